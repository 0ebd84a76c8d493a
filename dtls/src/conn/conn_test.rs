use std::sync::Arc;

use tokio::time::{timeout, Duration};
use util::{Conn, UdpConn};

use super::*;
use crate::config::{Certificate, Config};

async fn udp_pair() -> (Arc<UdpConn>, Arc<UdpConn>) {
    let a = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let b = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr_a = a.local_addr().unwrap();
    let addr_b = b.local_addr().unwrap();

    let a = Arc::new(UdpConn::connected(a.socket(), addr_b));
    let b = Arc::new(UdpConn::connected(b.socket(), addr_a));
    (a, b)
}

async fn handshake_pair() -> (DtlsConn, DtlsConn) {
    let (ca, cb) = udp_pair().await;

    let client_cert = Certificate::generate_self_signed().unwrap();
    let server_cert = Certificate::generate_self_signed().unwrap();

    let client_der = client_cert.der.clone();
    let server_der = server_cert.der.clone();

    let client = tokio::spawn(async move {
        DtlsConn::handshake(Config::new(client_cert, true), ca).await
    });
    let server = tokio::spawn(async move {
        DtlsConn::handshake(Config::new(server_cert, false), cb).await
    });

    let client = timeout(Duration::from_secs(10), client)
        .await
        .expect("client deadline")
        .unwrap()
        .expect("client handshake");
    let server = timeout(Duration::from_secs(10), server)
        .await
        .expect("server deadline")
        .unwrap()
        .expect("server handshake");

    // each side must hold the other's exact certificate
    assert_eq!(client.peer_certificate(), server_der.as_slice());
    assert_eq!(server.peer_certificate(), client_der.as_slice());

    (client, server)
}

#[tokio::test]
async fn test_loopback_handshake_completes() {
    let (client, server) = handshake_pair().await;
    assert!(client.is_client());
    assert!(!server.is_client());
}

#[tokio::test]
async fn test_exporter_halves_agree() {
    let (client, server) = handshake_pair().await;

    // RFC 5764: both ends derive identical keying material and
    // split it by role
    let a = client.export_srtp_keying_material(60);
    let b = server.export_srtp_keying_material(60);
    assert_eq!(a, b);
    assert_eq!(a.len(), 60);

    assert_eq!(
        client.selected_srtp_profile(),
        crate::SRTP_PROFILE_AES128_CM_SHA1_80
    );
}

#[tokio::test]
async fn test_application_data_both_directions() {
    let (client, server) = handshake_pair().await;

    client.send(b"from-client").await.unwrap();
    let got = timeout(Duration::from_secs(2), server.recv())
        .await
        .expect("server recv")
        .unwrap();
    assert_eq!(got, b"from-client");

    server.send(b"from-server").await.unwrap();
    let got = timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("client recv")
        .unwrap();
    assert_eq!(got, b"from-server");
}

#[tokio::test]
async fn test_handshake_times_out_without_peer() {
    let (ca, _cb) = udp_pair().await;
    let cert = Certificate::generate_self_signed().unwrap();

    let res = DtlsConn::handshake(Config::new(cert, true), ca).await;
    assert!(matches!(res, Err(Error::ErrHandshakeTimeout)));
}

#[tokio::test]
async fn test_fingerprints_match_der() {
    let cert = Certificate::generate_self_signed().unwrap();

    let fp = cert.sha256_fingerprint();
    // 32 bytes -> 64 hex chars + 31 colons
    assert_eq!(fp.len(), 95);
    assert!(fp.chars().all(|c| c.is_ascii_hexdigit() || c == ':'));

    let again = crate::crypto::sha256_fingerprint_of(&cert.der);
    assert_eq!(fp, again);
}
