pub mod request;

use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time::Duration;
use util::Conn;

use crate::allocation::allocation_manager::Manager;
use crate::auth::AuthHandler;
use crate::client::tcp_conn::TcpStreamConn;
use crate::proto::{Protocol, PROTO_TCP, PROTO_UDP};
use crate::Result;

/// Allocation lifetimes the server will grant: requests are clamped
/// into [MIN_LIFETIME, MAX_LIFETIME], absent attribute gets the
/// proto default.
pub const MIN_LIFETIME: Duration = Duration::from_secs(15);
pub const MAX_LIFETIME: Duration = Duration::from_secs(3600);

/// ServerConfig wires one listener into the shared allocation state.
pub struct ServerConfig {
    /// conn is the server-side listening transport (UDP socket, or a
    /// framed per-client stream for TCP/TLS).
    pub conn: Arc<dyn Conn + Send + Sync>,
    pub realm: String,
    pub auth_handler: Arc<dyn AuthHandler + Send + Sync>,
    /// relay_ip is the address relay sockets bind on.
    pub relay_ip: IpAddr,
    pub software: String,
}

/// Server is the test-core TURN server: one allocation manager
/// shared by any number of listeners.
pub struct Server {
    manager: Arc<Manager>,
    realm: String,
    auth_handler: Arc<dyn AuthHandler + Send + Sync>,
    software: String,
}

impl Server {
    pub fn new(realm: String, relay_ip: IpAddr, auth_handler: Arc<dyn AuthHandler + Send + Sync>) -> Arc<Self> {
        Arc::new(Server {
            manager: Arc::new(Manager::new(relay_ip)),
            realm,
            auth_handler,
            software: "peercall-turn".to_owned(),
        })
    }

    pub fn manager(&self) -> Arc<Manager> {
        Arc::clone(&self.manager)
    }

    /// serve_conn runs the read loop for one datagram listener (a
    /// UDP socket serves every client; a framed stream serves one).
    pub fn serve_conn(self: &Arc<Self>, conn: Arc<dyn Conn + Send + Sync>, protocol: Protocol) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 0xffff];
            loop {
                let (n, src) = match conn.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        log::debug!("turn server listener done: {err}");
                        break;
                    }
                };

                let ctx = request::RequestContext {
                    conn: Arc::clone(&conn),
                    src_addr: src,
                    protocol,
                    manager: this.manager(),
                    realm: this.realm.clone(),
                    auth_handler: Arc::clone(&this.auth_handler),
                    software: this.software.clone(),
                };

                if let Err(err) = request::handle_packet(&ctx, &buf[..n]).await {
                    log::warn!("turn server: error handling packet from {src}: {err}");
                }
            }
        });
    }

    /// serve_udp starts serving one UDP socket.
    pub fn serve_udp(self: &Arc<Self>, conn: Arc<dyn Conn + Send + Sync>) {
        self.serve_conn(conn, PROTO_UDP);
    }

    /// serve_tcp accepts stream clients and serves each framed
    /// connection; a TLS acceptor in front yields the `turns:` flavor.
    pub fn serve_tcp(self: &Arc<Self>, listener: TcpListener) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (stream, src) = match listener.accept().await {
                    Ok(v) => v,
                    Err(err) => {
                        log::debug!("turn server tcp accept done: {err}");
                        break;
                    }
                };
                log::debug!("turn server: tcp client from {src}");

                match TcpStreamConn::new(stream) {
                    Ok(conn) => this.serve_conn(Arc::new(conn), PROTO_TCP),
                    Err(err) => log::warn!("turn server: tcp setup failed: {err}"),
                }
            }
        });
    }

    pub async fn close(&self) -> Result<()> {
        self.manager.close().await;
        Ok(())
    }
}
