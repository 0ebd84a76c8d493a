use std::net::SocketAddr;
use std::sync::Arc;

use stun::attributes::*;
use stun::error_code::*;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::TextAttribute;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use util::UdpConn;

use super::*;
use crate::auth::{generate_auth_key, AuthHandler};
use crate::proto::evenport::EvenPort;
use crate::proto::reqtrans::RequestedTransport;
use crate::proto::rsrvtoken::ReservationToken;
use crate::proto::PROTO_TCP;
use crate::server::Server;

struct TestAuth;

impl AuthHandler for TestAuth {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        _src_addr: SocketAddr,
    ) -> crate::Result<Vec<u8>> {
        if username == "user" {
            Ok(generate_auth_key(username, realm, "pass"))
        } else {
            Err(crate::Error::Other("no such user".to_owned()))
        }
    }
}

const REALM: &str = "peercall.test";

async fn start_server() -> SocketAddr {
    let sock = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = sock.local_addr().unwrap();

    let server = Server::new(REALM.to_owned(), "127.0.0.1".parse().unwrap(), Arc::new(TestAuth));
    server.serve_udp(Arc::new(sock));

    addr
}

async fn exchange(client: &UdpSocket, server: SocketAddr, msg: &Message) -> Message {
    client.send_to(&msg.raw, server).await.unwrap();

    let mut buf = vec![0u8; 1500];
    let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("server reply")
        .unwrap();

    let mut resp = Message::new();
    resp.read_from(&buf[..n]).unwrap();
    resp
}

fn error_code_of(resp: &Message) -> ErrorCode {
    let mut code = ErrorCodeAttribute::default();
    code.get_from(resp).unwrap();
    code.code
}

/// performs the 401 dance and returns (integrity, realm, nonce)
async fn learn_credentials(client: &UdpSocket, server: SocketAddr) -> (MessageIntegrity, String, String) {
    let mut msg = Message::new();
    msg.build(&[
        Box::new(TransactionId::new()),
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)),
        Box::new(RequestedTransport::default()),
    ])
    .unwrap();

    let resp = exchange(client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_ERROR_RESPONSE);
    assert_eq!(error_code_of(&resp), CODE_UNAUTHORIZED);

    let realm = TextAttribute::get_from_as(&resp, ATTR_REALM).unwrap().text;
    let nonce = TextAttribute::get_from_as(&resp, ATTR_NONCE).unwrap().text;
    let integrity =
        MessageIntegrity::new_long_term_integrity("user".to_owned(), realm.clone(), "pass".to_owned());

    (integrity, realm, nonce)
}

fn authed(
    method: Method,
    integrity: &MessageIntegrity,
    realm: &str,
    nonce: &str,
    extra: Vec<Box<dyn Setter>>,
) -> Message {
    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(TransactionId::new()),
        Box::new(MessageType::new(method, CLASS_REQUEST)),
    ];
    setters.extend(extra);
    setters.push(Box::new(TextAttribute::new(ATTR_USERNAME, "user".to_owned())));
    setters.push(Box::new(TextAttribute::new(ATTR_REALM, realm.to_owned())));
    setters.push(Box::new(TextAttribute::new(ATTR_NONCE, nonce.to_owned())));
    setters.push(Box::new(integrity.clone()));

    let mut msg = Message::new();
    msg.build(&setters).unwrap();
    msg
}

#[tokio::test]
async fn test_allocate_unauthenticated_draws_401() {
    let server = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let (_, realm, nonce) = learn_credentials(&client, server).await;
    assert_eq!(realm, REALM);
    assert!(!nonce.is_empty());
}

#[tokio::test]
async fn test_allocate_non_udp_transport_442() {
    let server = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity, realm, nonce) = learn_credentials(&client, server).await;

    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![Box::new(RequestedTransport {
            protocol: PROTO_TCP,
        })],
    );
    let resp = exchange(&client, server, &msg).await;

    assert_eq!(resp.typ.class, CLASS_ERROR_RESPONSE);
    assert_eq!(error_code_of(&resp), CODE_UNSUPPORTED_TRANS_PROTO);
}

#[tokio::test]
async fn test_allocate_even_port_with_token_400() {
    let server = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity, realm, nonce) = learn_credentials(&client, server).await;

    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![
            Box::new(RequestedTransport::default()),
            Box::new(EvenPort {
                reserve_port: true,
            }),
            Box::new(ReservationToken([1, 2, 3, 4, 5, 6, 7, 8])),
        ],
    );
    let resp = exchange(&client, server, &msg).await;

    assert_eq!(resp.typ.class, CLASS_ERROR_RESPONSE);
    assert_eq!(error_code_of(&resp), CODE_BAD_REQUEST);
}

#[tokio::test]
async fn test_allocate_twice_437() {
    let server = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity, realm, nonce) = learn_credentials(&client, server).await;

    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![Box::new(RequestedTransport::default())],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_SUCCESS_RESPONSE);

    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![Box::new(RequestedTransport::default())],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_ERROR_RESPONSE);
    assert_eq!(error_code_of(&resp), CODE_ALLOC_MISMATCH);
}

#[tokio::test]
async fn test_allocate_lifetime_clamped() {
    let server = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity, realm, nonce) = learn_credentials(&client, server).await;

    // ask for 10 hours, must come back clamped to the max
    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![
            Box::new(RequestedTransport::default()),
            Box::new(Lifetime(Duration::from_secs(36000))),
        ],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_SUCCESS_RESPONSE);

    let mut granted = Lifetime::default();
    granted.get_from(&resp).unwrap();
    assert_eq!(granted.0, MAX_LIFETIME);
}

#[tokio::test]
async fn test_even_port_reservation_redeemed() {
    let server = start_server().await;

    // first client allocates an even port and reserves its sibling
    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity, realm, nonce) = learn_credentials(&first, server).await;

    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![
            Box::new(RequestedTransport::default()),
            Box::new(EvenPort {
                reserve_port: true,
            }),
        ],
    );
    let resp = exchange(&first, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_SUCCESS_RESPONSE);

    let mut relayed = RelayedAddress::default();
    relayed.get_from(&resp).unwrap();
    assert_eq!(relayed.port % 2, 0, "even relay port");

    let mut token = ReservationToken::default();
    token.get_from(&resp).unwrap();

    // a second client redeems the token and lands on port + 1
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity2, realm2, nonce2) = learn_credentials(&second, server).await;
    let msg = authed(
        METHOD_ALLOCATE,
        &integrity2,
        &realm2,
        &nonce2,
        vec![Box::new(RequestedTransport::default()), Box::new(token)],
    );
    let resp = exchange(&second, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_SUCCESS_RESPONSE);

    let mut sibling = RelayedAddress::default();
    sibling.get_from(&resp).unwrap();
    assert_eq!(sibling.port, relayed.port + 1);
}

#[tokio::test]
async fn test_refresh_without_allocation_437() {
    let server = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity, realm, nonce) = learn_credentials(&client, server).await;

    let msg = authed(
        METHOD_REFRESH,
        &integrity,
        &realm,
        &nonce,
        vec![Box::new(Lifetime(Duration::from_secs(60)))],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_ERROR_RESPONSE);
    assert_eq!(error_code_of(&resp), CODE_ALLOC_MISMATCH);
}

#[tokio::test]
async fn test_refresh_zero_deletes_allocation() {
    let server = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity, realm, nonce) = learn_credentials(&client, server).await;

    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![Box::new(RequestedTransport::default())],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_SUCCESS_RESPONSE);

    let msg = authed(
        METHOD_REFRESH,
        &integrity,
        &realm,
        &nonce,
        vec![Box::new(Lifetime(Duration::from_secs(0)))],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_SUCCESS_RESPONSE);

    // a fresh Allocate must now succeed again on the same five-tuple
    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![Box::new(RequestedTransport::default())],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_SUCCESS_RESPONSE);
}

#[tokio::test]
async fn test_create_permission_family_mismatch_rolls_back() {
    let server = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity, realm, nonce) = learn_credentials(&client, server).await;

    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![Box::new(RequestedTransport::default())],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_SUCCESS_RESPONSE);

    // one good v4 peer, one v6 peer: the whole request must fail 443
    let good: SocketAddr = "203.0.113.5:4000".parse().unwrap();
    let bad: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
    let msg = authed(
        METHOD_CREATE_PERMISSION,
        &integrity,
        &realm,
        &nonce,
        vec![
            Box::new(PeerAddress::from(good)),
            Box::new(PeerAddress::from(bad)),
        ],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_ERROR_RESPONSE);
    assert_eq!(error_code_of(&resp), CODE_PEER_ADDR_FAMILY_MISMATCH);
}

#[tokio::test]
async fn test_channel_bind_bad_number_400() {
    let server = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (integrity, realm, nonce) = learn_credentials(&client, server).await;

    let msg = authed(
        METHOD_ALLOCATE,
        &integrity,
        &realm,
        &nonce,
        vec![Box::new(RequestedTransport::default())],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_SUCCESS_RESPONSE);

    let peer: SocketAddr = "203.0.113.5:4000".parse().unwrap();
    let msg = authed(
        METHOD_CHANNEL_BIND,
        &integrity,
        &realm,
        &nonce,
        vec![
            // 0x3FFF is below the channel range
            Box::new(ChannelNumber(0x3FFF)),
            Box::new(PeerAddress::from(peer)),
        ],
    );
    let resp = exchange(&client, server, &msg).await;
    assert_eq!(resp.typ.class, CLASS_ERROR_RESPONSE);
    assert_eq!(error_code_of(&resp), CODE_BAD_REQUEST);
}
