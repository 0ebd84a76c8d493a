use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use util::tcp_framing::{read_stream_message, write_stream_message};
use util::Conn;

/// TcpStreamConn adapts one long-lived TCP connection to a TURN
/// server into the datagram-shaped Conn the client speaks. STUN
/// messages and ChannelData frames are self-delimiting, so no extra
/// framing bytes go on the wire (RFC 5766 section 5).
///
/// A TLS stream wrapped to the same interface slots in for `turns:`
/// servers; the framing is identical.
pub struct TcpStreamConn {
    local: SocketAddr,
    peer: SocketAddr,
    rd: Mutex<tokio::net::tcp::OwnedReadHalf>,
    wr: Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

impl TcpStreamConn {
    pub fn new(stream: TcpStream) -> util::Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (rd, wr) = stream.into_split();
        Ok(TcpStreamConn {
            local,
            peer,
            rd: Mutex::new(rd),
            wr: Mutex::new(wr),
        })
    }

    pub async fn connect(server: SocketAddr) -> util::Result<Self> {
        let stream = TcpStream::connect(server).await?;
        TcpStreamConn::new(stream)
    }
}

#[async_trait]
impl Conn for TcpStreamConn {
    async fn recv(&self, buf: &mut [u8]) -> util::Result<usize> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> util::Result<(usize, SocketAddr)> {
        let msg = {
            let mut rd = self.rd.lock().await;
            read_stream_message(&mut rd).await?
        };
        if msg.len() > buf.len() {
            return Err(util::Error::ErrBufferTooShort);
        }
        buf[..msg.len()].copy_from_slice(&msg);
        Ok((msg.len(), self.peer))
    }

    async fn send(&self, buf: &[u8]) -> util::Result<usize> {
        let mut wr = self.wr.lock().await;
        write_stream_message(&mut wr, buf).await?;
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> util::Result<usize> {
        // the stream has exactly one destination: the server
        self.send(buf).await
    }

    fn local_addr(&self) -> util::Result<SocketAddr> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn close(&self) -> util::Result<()> {
        Ok(())
    }
}
