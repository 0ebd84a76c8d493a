#[cfg(test)]
mod candidate_test;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::{Error, Result};

/// COMPONENT_RTP is the only component this stack uses; rtcp-mux is
/// mandatory so RTCP never gets its own component.
pub const COMPONENT_RTP: u16 = 1;

/// CandidateType ranks where a candidate came from.
#[derive(PartialEq, Eq, Debug, Copy, Clone, PartialOrd, Ord)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    /// preference is the type preference that leads the 32-bit
    /// priority (RFC 5245 section 4.1.2.1).
    pub fn preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CandidateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(Error::ErrUnknownCandidateType(s.to_owned())),
        }
    }
}

/// TcpType qualifies TCP candidates (active/passive/so). UDP
/// candidates leave it unset.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub enum TcpType {
    #[default]
    Unspecified,
    Active,
    Passive,
    SimultaneousOpen,
}

impl fmt::Display for TcpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpType::Unspecified => "unspecified",
            TcpType::Active => "active",
            TcpType::Passive => "passive",
            TcpType::SimultaneousOpen => "so",
        };
        write!(f, "{s}")
    }
}

/// Protocol of the candidate's transport.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub enum CandidateProtocol {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for CandidateProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateProtocol::Udp => write!(f, "udp"),
            CandidateProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Candidate is one transport address a peer can try, as carried in
/// `a=candidate:` SDP attributes (RFC 5245 section 15.1).
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Candidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: CandidateProtocol,
    pub priority: u32,
    pub addr: SocketAddr,
    pub typ: CandidateType,
    pub related: Option<SocketAddr>,
    pub tcp_type: TcpType,
}

impl Default for Candidate {
    fn default() -> Self {
        Candidate {
            foundation: String::new(),
            component: COMPONENT_RTP,
            protocol: CandidateProtocol::Udp,
            priority: 0,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::from(0)), 0),
            typ: CandidateType::Host,
            related: None,
            tcp_type: TcpType::Unspecified,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.typ, self.addr)
    }
}

/// calc_priority computes the standard priority formula.
pub fn calc_priority(typ: CandidateType, local_pref: u16, component: u16) -> u32 {
    (typ.preference() << 24) + ((local_pref as u32) << 8) + (256 - component as u32)
}

impl Candidate {
    pub fn new_host(foundation: String, addr: SocketAddr, local_pref: u16) -> Self {
        Candidate {
            foundation,
            priority: calc_priority(CandidateType::Host, local_pref, COMPONENT_RTP),
            addr,
            typ: CandidateType::Host,
            ..Default::default()
        }
    }

    pub fn new_server_reflexive(foundation: String, addr: SocketAddr, base: SocketAddr) -> Self {
        Candidate {
            foundation,
            priority: calc_priority(CandidateType::ServerReflexive, 65535, COMPONENT_RTP),
            addr,
            typ: CandidateType::ServerReflexive,
            related: Some(base),
            ..Default::default()
        }
    }

    pub fn new_peer_reflexive(foundation: String, addr: SocketAddr) -> Self {
        Candidate {
            foundation,
            priority: calc_priority(CandidateType::PeerReflexive, 65535, COMPONENT_RTP),
            addr,
            typ: CandidateType::PeerReflexive,
            ..Default::default()
        }
    }

    pub fn new_relay(foundation: String, addr: SocketAddr, base: SocketAddr) -> Self {
        Candidate {
            foundation,
            priority: calc_priority(CandidateType::Relay, 65535, COMPONENT_RTP),
            addr,
            typ: CandidateType::Relay,
            related: Some(base),
            ..Default::default()
        }
    }

    /// to_attribute renders the value of an `a=candidate:` line
    /// (without the `candidate:` prefix).
    pub fn to_attribute(&self) -> String {
        let mut s = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.typ
        );

        if let Some(related) = &self.related {
            s.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
        }
        if self.protocol == CandidateProtocol::Tcp && self.tcp_type != TcpType::Unspecified {
            s.push_str(&format!(" tcptype {}", self.tcp_type));
        }

        s
    }

    /// parse_attribute accepts the value with or without the
    /// `candidate:` prefix.
    pub fn parse_attribute(attr: &str) -> Result<Candidate> {
        let attr = attr.trim_start_matches("candidate:");
        let split: Vec<&str> = attr.split_whitespace().collect();
        if split.len() < 8 {
            return Err(Error::ErrParseCandidate(attr.to_owned()));
        }

        let bad = || Error::ErrParseCandidate(attr.to_owned());

        let foundation = split[0].to_owned();
        let component: u16 = split[1].parse().map_err(|_| bad())?;
        let protocol = match split[2].to_lowercase().as_str() {
            "udp" => CandidateProtocol::Udp,
            "tcp" => CandidateProtocol::Tcp,
            _ => return Err(bad()),
        };
        let priority: u32 = split[3].parse().map_err(|_| bad())?;
        let ip: IpAddr = split[4].parse().map_err(|_| bad())?;
        let port: u16 = split[5].parse().map_err(|_| bad())?;

        if split[6] != "typ" {
            return Err(bad());
        }
        let typ: CandidateType = split[7].parse()?;

        let mut cand = Candidate {
            foundation,
            component,
            protocol,
            priority,
            addr: SocketAddr::new(ip, port),
            typ,
            related: None,
            tcp_type: TcpType::Unspecified,
        };

        let mut rest = &split[8..];
        let mut raddr: Option<IpAddr> = None;
        let mut rport: Option<u16> = None;
        while rest.len() >= 2 {
            match rest[0] {
                "raddr" => raddr = Some(rest[1].parse().map_err(|_| bad())?),
                "rport" => rport = Some(rest[1].parse().map_err(|_| bad())?),
                "tcptype" => {
                    cand.tcp_type = match rest[1] {
                        "active" => TcpType::Active,
                        "passive" => TcpType::Passive,
                        "so" => TcpType::SimultaneousOpen,
                        _ => return Err(bad()),
                    }
                }
                // unknown extensions (generation, network-id, ...)
                // pass through silently
                _ => {}
            }
            rest = &rest[2..];
        }

        if let (Some(ip), Some(port)) = (raddr, rport) {
            cand.related = Some(SocketAddr::new(ip, port));
        }

        Ok(cand)
    }
}
