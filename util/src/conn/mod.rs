pub mod conn_udp;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::Result;

/// Conn is the object-safe transport surface every protocol layer in
/// this stack sends and receives through. Implementations wrap a UDP
/// socket, a framed TCP stream, or an in-memory pipe in tests; the
/// consumers hold them as `Arc<dyn Conn + Send + Sync>`.
#[async_trait]
pub trait Conn {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
    async fn send(&self, buf: &[u8]) -> Result<usize>;
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize>;
    fn local_addr(&self) -> Result<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> Result<()>;
}
