use std::fmt;

/// Attributes is the ordered list of a message's attributes.
#[derive(Default, PartialEq, Eq, Debug, Clone)]
pub struct Attributes(pub Vec<RawAttribute>);

impl Attributes {
    /// get returns the first attribute of the given type, if any.
    pub fn get(&self, t: AttrType) -> Option<&RawAttribute> {
        self.0.iter().find(|a| a.typ == t)
    }

    pub fn contains(&self, t: AttrType) -> bool {
        self.get(t).is_some()
    }
}

/// AttrType is a 16-bit attribute type.
#[derive(PartialEq, Eq, Debug, Default, Copy, Clone)]
pub struct AttrType(pub u16);

impl AttrType {
    /// required reports the comprehension-required range (0x0000-0x7FFF).
    pub fn required(&self) -> bool {
        self.0 <= 0x7FFF
    }

    /// optional reports the comprehension-optional range (0x8000-0xFFFF).
    pub fn optional(&self) -> bool {
        self.0 >= 0x8000
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// name gives the registry name for the types this stack knows.
    pub fn name(&self) -> Option<&'static str> {
        Some(match *self {
            ATTR_MAPPED_ADDRESS => "MAPPED-ADDRESS",
            ATTR_USERNAME => "USERNAME",
            ATTR_MESSAGE_INTEGRITY => "MESSAGE-INTEGRITY",
            ATTR_ERROR_CODE => "ERROR-CODE",
            ATTR_UNKNOWN_ATTRIBUTES => "UNKNOWN-ATTRIBUTES",
            ATTR_REALM => "REALM",
            ATTR_NONCE => "NONCE",
            ATTR_XORMAPPED_ADDRESS => "XOR-MAPPED-ADDRESS",
            ATTR_SOFTWARE => "SOFTWARE",
            ATTR_ALTERNATE_SERVER => "ALTERNATE-SERVER",
            ATTR_FINGERPRINT => "FINGERPRINT",
            ATTR_PRIORITY => "PRIORITY",
            ATTR_USE_CANDIDATE => "USE-CANDIDATE",
            ATTR_ICE_CONTROLLED => "ICE-CONTROLLED",
            ATTR_ICE_CONTROLLING => "ICE-CONTROLLING",
            ATTR_CHANNEL_NUMBER => "CHANNEL-NUMBER",
            ATTR_LIFETIME => "LIFETIME",
            ATTR_XOR_PEER_ADDRESS => "XOR-PEER-ADDRESS",
            ATTR_DATA => "DATA",
            ATTR_XOR_RELAYED_ADDRESS => "XOR-RELAYED-ADDRESS",
            ATTR_EVEN_PORT => "EVEN-PORT",
            ATTR_REQUESTED_TRANSPORT => "REQUESTED-TRANSPORT",
            ATTR_DONT_FRAGMENT => "DONT-FRAGMENT",
            ATTR_RESERVATION_TOKEN => "RESERVATION-TOKEN",
            ATTR_REQUESTED_ADDRESS_FAMILY => "REQUESTED-ADDRESS-FAMILY",
            _ => return None,
        })
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:x}", self.0),
        }
    }
}

// RFC 5389 attributes.
pub const ATTR_MAPPED_ADDRESS: AttrType = AttrType(0x0001);
pub const ATTR_USERNAME: AttrType = AttrType(0x0006);
pub const ATTR_MESSAGE_INTEGRITY: AttrType = AttrType(0x0008);
pub const ATTR_ERROR_CODE: AttrType = AttrType(0x0009);
pub const ATTR_UNKNOWN_ATTRIBUTES: AttrType = AttrType(0x000A);
pub const ATTR_REALM: AttrType = AttrType(0x0014);
pub const ATTR_NONCE: AttrType = AttrType(0x0015);
pub const ATTR_XORMAPPED_ADDRESS: AttrType = AttrType(0x0020);
pub const ATTR_SOFTWARE: AttrType = AttrType(0x8022);
pub const ATTR_ALTERNATE_SERVER: AttrType = AttrType(0x8023);
pub const ATTR_FINGERPRINT: AttrType = AttrType(0x8028);

// RFC 5245 (ICE) attributes.
pub const ATTR_PRIORITY: AttrType = AttrType(0x0024);
pub const ATTR_USE_CANDIDATE: AttrType = AttrType(0x0025);
pub const ATTR_ICE_CONTROLLED: AttrType = AttrType(0x8029);
pub const ATTR_ICE_CONTROLLING: AttrType = AttrType(0x802A);

// RFC 5766 (TURN) attributes.
pub const ATTR_CHANNEL_NUMBER: AttrType = AttrType(0x000C);
pub const ATTR_LIFETIME: AttrType = AttrType(0x000D);
pub const ATTR_XOR_PEER_ADDRESS: AttrType = AttrType(0x0012);
pub const ATTR_DATA: AttrType = AttrType(0x0013);
pub const ATTR_XOR_RELAYED_ADDRESS: AttrType = AttrType(0x0016);
pub const ATTR_EVEN_PORT: AttrType = AttrType(0x0018);
pub const ATTR_REQUESTED_TRANSPORT: AttrType = AttrType(0x0019);
pub const ATTR_DONT_FRAGMENT: AttrType = AttrType(0x001A);
pub const ATTR_RESERVATION_TOKEN: AttrType = AttrType(0x0022);

// RFC 6156 (TURN IPv6) attributes.
pub const ATTR_REQUESTED_ADDRESS_FAMILY: AttrType = AttrType(0x0017);

/// RawAttribute is a TLV as it appears on the wire, value unpadded.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub typ: AttrType,
    pub length: u16,
    pub value: Vec<u8>,
}
