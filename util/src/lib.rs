#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod conn;
mod error;
pub mod tcp_framing;

pub use conn::{conn_udp::UdpConn, Conn};
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

use std::net::SocketAddr;

use tokio::net::lookup_host as tokio_lookup_host;

/// Resolves a `host:port` string to the first usable socket address.
///
/// When `use_ipv4` is set, IPv6 results are skipped so that a
/// dual-stack hostname cannot select an unreachable family.
pub async fn lookup_host(use_ipv4: bool, host: &str) -> Result<SocketAddr> {
    for remote_addr in tokio_lookup_host(host).await? {
        if (use_ipv4 && remote_addr.is_ipv4()) || (!use_ipv4 && remote_addr.is_ipv6()) {
            return Ok(remote_addr);
        }
    }

    Err(Error::ErrAddressNotFound(host.to_owned()))
}
