use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use stun::attributes::ATTR_XOR_PEER_ADDRESS;
use stun::message::{Getter, Message, Setter};
use stun::xoraddr::XorMappedAddress;

/// PeerAddress is the XOR-PEER-ADDRESS attribute: the peer's
/// transport address as seen by the relay.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for PeerAddress {
    fn default() -> Self {
        PeerAddress {
            ip: IpAddr::V4(Ipv4Addr::from(0)),
            port: 0,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(_) => write!(f, "{}:{}", self.ip, self.port),
            IpAddr::V6(_) => write!(f, "[{}]:{}", self.ip, self.port),
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl PeerAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl Setter for PeerAddress {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        XorMappedAddress {
            ip: self.ip,
            port: self.port,
        }
        .add_to_as(m, ATTR_XOR_PEER_ADDRESS)
    }
}

impl Getter for PeerAddress {
    fn get_from(&mut self, m: &Message) -> stun::Result<()> {
        let mut a = XorMappedAddress::default();
        a.get_from_as(m, ATTR_XOR_PEER_ADDRESS)?;
        self.ip = a.ip;
        self.port = a.port;
        Ok(())
    }
}

/// peer_addresses_in collects every XOR-PEER-ADDRESS attribute, in
/// order; CreatePermission may carry several.
pub fn peer_addresses_in(m: &Message) -> stun::Result<Vec<PeerAddress>> {
    let mut out = vec![];
    for attr in &m.attributes.0 {
        if attr.typ == ATTR_XOR_PEER_ADDRESS {
            // re-decode each one against the message transaction id
            let mut tmp = Message::new();
            tmp.transaction_id = m.transaction_id;
            tmp.write_header();
            tmp.append(ATTR_XOR_PEER_ADDRESS, &attr.value);

            let mut pa = PeerAddress::default();
            pa.get_from(&tmp)?;
            out.push(pa);
        }
    }
    Ok(out)
}
