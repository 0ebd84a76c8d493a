
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::addr::*;
use crate::attributes::*;
use crate::message::*;
use crate::{Error, Result};

fn xor_bytes(dst: &mut [u8], a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len()).min(dst.len());
    for i in 0..n {
        dst[i] = a[i] ^ b[i];
    }
    n
}

/// XorMappedAddress implements the XOR-MAPPED-ADDRESS attribute
/// (RFC 5389 section 15.2): port xored with the top half of the magic
/// cookie, address xored with cookie (v4) or cookie || transaction-id
/// (v6).
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct XorMappedAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for XorMappedAddress {
    fn default() -> Self {
        XorMappedAddress {
            ip: IpAddr::V4(Ipv4Addr::from(0)),
            port: 0,
        }
    }
}

impl From<std::net::SocketAddr> for XorMappedAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        XorMappedAddress {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl XorMappedAddress {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for XorMappedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(_) => write!(f, "{}:{}", self.ip, self.port),
            IpAddr::V6(_) => write!(f, "[{}]:{}", self.ip, self.port),
        }
    }
}

impl Setter for XorMappedAddress {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        self.add_to_as(m, ATTR_XORMAPPED_ADDRESS)
    }
}

impl Getter for XorMappedAddress {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        self.get_from_as(m, ATTR_XORMAPPED_ADDRESS)
    }
}

impl XorMappedAddress {
    /// add_to_as writes the xored address under attribute type t
    /// (XOR-PEER-ADDRESS and XOR-RELAYED-ADDRESS share the encoding).
    pub fn add_to_as(&self, m: &mut Message, t: AttrType) -> Result<()> {
        let (family, ip_len, ip) = match self.ip {
            IpAddr::V4(ipv4) => (FAMILY_IPV4, IPV4LEN, ipv4.octets().to_vec()),
            IpAddr::V6(ipv6) => (FAMILY_IPV6, IPV6LEN, ipv6.octets().to_vec()),
        };

        let mut xor_zone = [0u8; 16 + TRANSACTION_ID_SIZE];
        xor_zone[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        xor_zone[4..4 + TRANSACTION_ID_SIZE].copy_from_slice(&m.transaction_id.0);

        let mut value = vec![0u8; 4 + ip_len];
        value[..2].copy_from_slice(&family.to_be_bytes());
        let xor_port = self.port ^ (MAGIC_COOKIE >> 16) as u16;
        value[2..4].copy_from_slice(&xor_port.to_be_bytes());
        xor_bytes(&mut value[4..], &ip, &xor_zone);

        m.append(t, &value);
        Ok(())
    }

    /// get_from_as reads the xored address from attribute type t.
    pub fn get_from_as(&mut self, m: &Message, t: AttrType) -> Result<()> {
        let v = m.get(t)?;
        if v.len() <= 4 {
            return Err(Error::ErrAttributeSizeInvalid);
        }

        let family = u16::from_be_bytes([v[0], v[1]]);
        self.port = u16::from_be_bytes([v[2], v[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

        let mut xor_zone = [0u8; 16 + TRANSACTION_ID_SIZE];
        xor_zone[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        xor_zone[4..4 + TRANSACTION_ID_SIZE].copy_from_slice(&m.transaction_id.0);

        match family {
            FAMILY_IPV4 => {
                if v.len() < 4 + IPV4LEN {
                    return Err(Error::ErrAttributeSizeInvalid);
                }
                let mut ip = [0u8; IPV4LEN];
                xor_bytes(&mut ip, &v[4..4 + IPV4LEN], &xor_zone);
                self.ip = IpAddr::from(ip);
            }
            FAMILY_IPV6 => {
                if v.len() < 4 + IPV6LEN {
                    return Err(Error::ErrAttributeSizeInvalid);
                }
                let mut ip = [0u8; IPV6LEN];
                xor_bytes(&mut ip, &v[4..4 + IPV6LEN], &xor_zone);
                self.ip = IpAddr::from(ip);
            }
            _ => return Err(Error::ErrBadAddressFamily),
        }

        Ok(())
    }
}
