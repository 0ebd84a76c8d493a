use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::proto::{Protocol, PROTO_UDP};

/// FiveTuple identifies one client of the server: transport protocol
/// plus both endpoint addresses. Every allocation is keyed by it.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct FiveTuple {
    pub protocol: Protocol,
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
}

impl Default for FiveTuple {
    fn default() -> Self {
        FiveTuple {
            protocol: PROTO_UDP,
            src_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::from(0)), 0),
            dst_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::from(0)), 0),
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.protocol, self.src_addr, self.dst_addr)
    }
}

impl fmt::Debug for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
