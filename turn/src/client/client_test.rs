use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use util::{Conn, UdpConn};

use super::*;
use crate::auth::{generate_auth_key, AuthHandler};
use crate::server::Server;

struct TestAuth;

impl AuthHandler for TestAuth {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        _src_addr: SocketAddr,
    ) -> crate::Result<Vec<u8>> {
        Ok(generate_auth_key(username, realm, "pass"))
    }
}

async fn start_server() -> SocketAddr {
    let sock = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = sock.local_addr().unwrap();

    let server = Server::new(
        "peercall.test".to_owned(),
        "127.0.0.1".parse().unwrap(),
        Arc::new(TestAuth),
    );
    server.serve_udp(Arc::new(sock));

    addr
}

async fn new_client(server: SocketAddr) -> Arc<TurnClient> {
    let sock = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = TurnClient::new(ClientConfig {
        conn: Arc::new(sock),
        server_addr: server,
        username: "user".to_owned(),
        password: "pass".to_owned(),
        software: "peercall-test".to_owned(),
    });
    client.listen();
    client
}

#[test]
fn test_is_rfc1918() {
    assert!(is_rfc1918(&"10.1.2.3".parse().unwrap()));
    assert!(is_rfc1918(&"172.16.0.1".parse().unwrap()));
    assert!(is_rfc1918(&"192.168.0.1".parse().unwrap()));
    assert!(!is_rfc1918(&"127.0.0.1".parse().unwrap()));
    assert!(!is_rfc1918(&"203.0.113.7".parse().unwrap()));
    assert!(!is_rfc1918(&"2001:db8::1".parse().unwrap()));
}

#[tokio::test]
async fn test_allocate_reports_relayed_and_mapped() {
    let server = start_server().await;
    let client = new_client(server).await;

    let relay = client.allocate().await.unwrap();

    let relayed = relay.local_addr().unwrap();
    assert_eq!(relayed.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert_ne!(relayed.port(), 0);

    let mapped = client.mapped_addr().await.unwrap();
    assert_ne!(mapped.port(), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_relay_roundtrip_via_send_indication() {
    let server = start_server().await;
    let client = new_client(server).await;

    let relay = client.allocate().await.unwrap();
    let relayed = relay.local_addr().unwrap();

    // the "peer" is a plain UDP socket
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    client.create_permission(&[peer_addr]).await.unwrap();

    // outbound: client -> relay -> peer
    relay.send_to(b"ping", peer_addr).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("peer receives")
        .unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, relayed);

    // inbound: peer -> relay -> client, unwrapped from Data indication
    peer.send_to(b"pong", relayed).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(2), relay.recv_from(&mut buf))
        .await
        .expect("client receives")
        .unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, peer_addr);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_relay_roundtrip_via_channel() {
    let server = start_server().await;
    let client = new_client(server).await;

    let relay = client.allocate().await.unwrap();
    let relayed = relay.local_addr().unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    client.create_permission(&[peer_addr]).await.unwrap();
    let number = client.channel_bind(peer_addr).await.unwrap();
    assert!(number.valid());

    relay.send_to(b"via-channel", peer_addr).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("peer receives")
        .unwrap();
    assert_eq!(&buf[..n], b"via-channel");

    // inbound comes back as ChannelData and is unwrapped transparently
    peer.send_to(b"channel-reply", relayed).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(2), relay.recv_from(&mut buf))
        .await
        .expect("client receives")
        .unwrap();
    assert_eq!(&buf[..n], b"channel-reply");
    assert_eq!(from, peer_addr);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_send_indication_headroom_wire_shape() {
    let server = start_server().await;
    let client = new_client(server).await;

    let _relay = client.allocate().await.unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();
    client.create_permission(&[peer_addr]).await.unwrap();

    // packet with 36 bytes of reserved headroom in front
    let payload = b"headroom-payload".to_vec();
    let mut pkt = vec![0u8; SEND_INDICATION_OVERHEAD];
    pkt.extend_from_slice(&payload);

    client.relay_send_headroom(&mut pkt, peer_addr).await.unwrap();

    let mut buf = [0u8; 128];
    let (n, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("peer receives")
        .unwrap();
    assert_eq!(&buf[..n], payload.as_slice());

    client.close().await.unwrap();
}
