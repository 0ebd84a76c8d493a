pub mod chandata;
pub mod channum;
pub mod data;
pub mod evenport;
pub mod lifetime;
pub mod peeraddr;
pub mod relayaddr;
pub mod reqfamily;
pub mod reqtrans;
pub mod rsrvtoken;

use std::fmt;

/// Protocol is the value of REQUESTED-TRANSPORT; only UDP (17) is
/// legal in TURN allocations.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub struct Protocol(pub u8);

pub const PROTO_UDP: Protocol = Protocol(17);
pub const PROTO_TCP: Protocol = Protocol(6);

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("{}", self.0);
        let s = match *self {
            PROTO_UDP => "UDP",
            PROTO_TCP => "TCP",
            _ => others.as_str(),
        };

        write!(f, "{s}")
    }
}

/// The Send-indication envelope around a datagram costs a fixed
/// 36 bytes when the peer address is IPv4: 20 (STUN header) +
/// 12 (XOR-PEER-ADDRESS TLV) + 4 (DATA TLV header). Senders that
/// route through a relay reserve this much headroom so the envelope
/// can be written in place.
pub const SEND_INDICATION_OVERHEAD: usize = 36;

/// padded_len rounds an attribute value length up to the 4-byte
/// boundary the STUN wire format requires.
pub fn padded_len(l: usize) -> usize {
    (l + 3) & !3
}
