use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::Conn;
use crate::{Error, Result};

/// UdpConn wraps a tokio UDP socket, optionally "connected" to a
/// fixed remote so that `send`/`recv` work without an address.
pub struct UdpConn {
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
}

impl UdpConn {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        UdpConn {
            socket,
            remote: None,
        }
    }

    pub fn connected(socket: Arc<UdpSocket>, remote: SocketAddr) -> Self {
        UdpConn {
            socket,
            remote: Some(remote),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(UdpConn::new(Arc::new(socket)))
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

#[async_trait]
impl Conn for UdpConn {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let (n, src) = self.socket.recv_from(buf).await?;
            match self.remote {
                // an unconnected socket accepts any source
                None => return Ok(n),
                Some(remote) if src == remote => return Ok(n),
                Some(_) => continue,
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        let remote = self.remote.ok_or(Error::ErrNoRemoteAddress)?;
        Ok(self.socket.send_to(buf, remote).await?)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(buf, target).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    async fn close(&self) -> Result<()> {
        // tokio sockets close on drop; nothing to flush for UDP
        Ok(())
    }
}
