use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use util::Conn;

use super::TurnClient;

/// RelayConn presents an allocation as a Conn: reads are datagrams
/// the relay forwarded from peers, writes are wrapped into Send
/// indications or ChannelData by the client. Its local address is the
/// relayed transport address.
pub struct RelayConn {
    client: Arc<TurnClient>,
    relayed_addr: SocketAddr,
    data_rx: Mutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
}

impl RelayConn {
    pub(crate) fn new(
        client: Arc<TurnClient>,
        relayed_addr: SocketAddr,
        data_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    ) -> Self {
        RelayConn {
            client,
            relayed_addr,
            data_rx: Mutex::new(data_rx),
        }
    }

    pub fn client(&self) -> Arc<TurnClient> {
        Arc::clone(&self.client)
    }
}

#[async_trait]
impl Conn for RelayConn {
    async fn recv(&self, buf: &mut [u8]) -> util::Result<usize> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> util::Result<(usize, SocketAddr)> {
        let mut rx = self.data_rx.lock().await;
        let (data, from) = rx.recv().await.ok_or(util::Error::ErrClosed)?;
        if data.len() > buf.len() {
            return Err(util::Error::ErrBufferTooShort);
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), from))
    }

    async fn send(&self, _buf: &[u8]) -> util::Result<usize> {
        Err(util::Error::ErrNoRemoteAddress)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> util::Result<usize> {
        self.client
            .relay_send(buf, target)
            .await
            .map_err(|e| util::Error::Other(e.to_string()))
    }

    fn local_addr(&self) -> util::Result<SocketAddr> {
        Ok(self.relayed_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> util::Result<()> {
        self.client
            .close()
            .await
            .map_err(|e| util::Error::Other(e.to_string()))
    }
}
