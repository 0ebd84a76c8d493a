use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration};

use econn::EconnState;
use peercall::{Ecall, EcallConfig, EcallTransport};
use util::Conn;

type Outbox = mpsc::UnboundedSender<String>;

struct ChannelTransport {
    tx: Outbox,
}

#[async_trait]
impl EcallTransport for ChannelTransport {
    async fn send(&self, _convid: &str, raw: &str) -> peercall::Result<()> {
        self.tx
            .send(raw.to_owned())
            .map_err(|e| peercall::Error::ErrInternal(e.to_string()))
    }
}

struct Endpoint {
    ecall: Arc<Ecall>,
    userid: &'static str,
    clientid: &'static str,
    events: Arc<Mutex<Vec<String>>>,
    closed_rx: mpsc::UnboundedReceiver<(i32, String)>,
}

async fn make_endpoint(
    userid: &'static str,
    clientid: &'static str,
    conf: EcallConfig,
) -> (Endpoint, mpsc::UnboundedReceiver<String>) {
    let (tx, outbox_rx) = mpsc::unbounded_channel();
    let ecall = Ecall::new(
        conf,
        "conv-1",
        userid,
        clientid,
        Arc::new(ChannelTransport { tx }),
    )
    .unwrap();

    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let ev = Arc::clone(&events);
    ecall
        .on_incoming(Box::new(move |user, has_video| {
            let ev = Arc::clone(&ev);
            Box::pin(async move {
                ev.lock().await.push(format!("incoming:{user}:{has_video}"));
            })
        }))
        .await;

    let ev = Arc::clone(&events);
    ecall
        .on_missed(Box::new(move |_t, user, _v| {
            let ev = Arc::clone(&ev);
            Box::pin(async move {
                ev.lock().await.push(format!("missed:{user}"));
            })
        }))
        .await;

    let ev = Arc::clone(&events);
    ecall
        .on_answered(Box::new(move || {
            let ev = Arc::clone(&ev);
            Box::pin(async move {
                ev.lock().await.push("answered".to_owned());
            })
        }))
        .await;

    let ev = Arc::clone(&events);
    ecall
        .on_media_estab(Box::new(move || {
            let ev = Arc::clone(&ev);
            Box::pin(async move {
                ev.lock().await.push("media".to_owned());
            })
        }))
        .await;

    let ev = Arc::clone(&events);
    ecall
        .on_datachan_estab(Box::new(move || {
            let ev = Arc::clone(&ev);
            Box::pin(async move {
                ev.lock().await.push("datachan".to_owned());
            })
        }))
        .await;

    let ev = Arc::clone(&events);
    ecall
        .on_propsync(Box::new(move |_props| {
            let ev = Arc::clone(&ev);
            Box::pin(async move {
                ev.lock().await.push("propsync".to_owned());
            })
        }))
        .await;

    let (closed_tx, closed_rx) = mpsc::unbounded_channel();
    ecall
        .on_closed(Box::new(move |code, metrics| {
            let closed_tx = closed_tx.clone();
            Box::pin(async move {
                let _ = closed_tx.send((code, metrics));
            })
        }))
        .await;

    (
        Endpoint {
            ecall,
            userid,
            clientid,
            events,
            closed_rx,
        },
        outbox_rx,
    )
}

fn loopback_conf() -> EcallConfig {
    EcallConfig {
        local_addrs: vec!["127.0.0.1".parse().unwrap()],
        ..Default::default()
    }
}

/// pumps every envelope one side emits into the other's msg_recv
fn pump(
    mut outbox: mpsc::UnboundedReceiver<String>,
    from_user: &'static str,
    from_client: &'static str,
    to: Arc<Ecall>,
) {
    tokio::spawn(async move {
        while let Some(raw) = outbox.recv().await {
            let _ = to.msg_recv(10, 10, from_user, from_client, &raw).await;
        }
    });
}

async fn await_state(ecall: &Arc<Ecall>, want: EconnState, secs: u64) {
    timeout(Duration::from_secs(secs), async {
        loop {
            if ecall.state().await == want {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state {want} within deadline"));
}

async fn wire_pair(a: &Endpoint, a_out: mpsc::UnboundedReceiver<String>, b: &Endpoint, b_out: mpsc::UnboundedReceiver<String>) {
    pump(a_out, a.userid, a.clientid, Arc::clone(&b.ecall));
    pump(b_out, b.userid, b.clientid, Arc::clone(&a.ecall));
}

#[tokio::test]
async fn test_happy_one_leg_call() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut a, a_out) = make_endpoint("alice", "client-a", loopback_conf()).await;
    let (mut b, b_out) = make_endpoint("bob", "client-b", loopback_conf()).await;
    wire_pair(&a, a_out, &b, b_out).await;

    a.ecall.start().await.unwrap();

    // b rings
    timeout(Duration::from_secs(5), async {
        loop {
            if b.events.lock().await.iter().any(|e| e.starts_with("incoming:alice")) {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("incoming event");

    b.ecall.answer().await.unwrap();

    // both legs land in DataChanEstablished
    await_state(&a.ecall, EconnState::DatachanEstablished, 15).await;
    await_state(&b.ecall, EconnState::DatachanEstablished, 15).await;

    {
        let events = a.events.lock().await;
        assert!(events.contains(&"answered".to_owned()));
        assert!(events.contains(&"media".to_owned()));
        assert!(events.contains(&"datachan".to_owned()));
    }

    // the propsync exchange has fired on at least one side
    timeout(Duration::from_secs(5), async {
        loop {
            if b.events.lock().await.contains(&"propsync".to_owned()) {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("propsync event");

    // hangup: both sides close normally with metrics
    a.ecall.end().await;

    let (code_a, metrics_a) = timeout(Duration::from_secs(10), a.closed_rx.recv())
        .await
        .expect("a closes")
        .unwrap();
    let (code_b, _metrics_b) = timeout(Duration::from_secs(10), b.closed_rx.recv())
        .await
        .expect("b closes")
        .unwrap();

    assert_eq!(code_a, 0);
    assert_eq!(code_b, 0);

    let v: serde_json::Value = serde_json::from_str(&metrics_a).unwrap();
    assert_eq!(v["answered"], true);
    assert_eq!(v["direction"], "Outgoing");
    assert_eq!(v["dtls"], true);
    assert_eq!(v["ice"], true);
    assert_eq!(v["ecall_error"], 0);
    assert_eq!(v["protocol-version"], "3.0");
}

#[tokio::test]
async fn test_glare_resolves_deterministically() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (a, a_out) = make_endpoint("alice", "client-a", loopback_conf()).await;
    let (b, b_out) = make_endpoint("bob", "client-b", loopback_conf()).await;
    wire_pair(&a, a_out, &b, b_out).await;

    // both sides dial within the same instant
    let (ra, rb) = tokio::join!(a.ecall.start(), b.ecall.start());
    ra.unwrap();
    rb.unwrap();

    // "alice" < "bob": bob keeps the offer, alice answers; both end
    // up established rather than both dying
    await_state(&a.ecall, EconnState::DatachanEstablished, 20).await;
    await_state(&b.ecall, EconnState::DatachanEstablished, 20).await;

    // bob won the conflict, so bob saw the answer event
    let b_events = b.events.lock().await;
    assert!(b_events.contains(&"answered".to_owned()));
}

#[tokio::test]
async fn test_stale_setup_is_a_missed_call() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (a, mut a_out) = make_endpoint("alice", "client-a", loopback_conf()).await;
    let (b, _b_out) = make_endpoint("bob", "client-b", loopback_conf()).await;

    a.ecall.start().await.unwrap();
    let setup = timeout(Duration::from_secs(5), a_out.recv())
        .await
        .expect("outbound setup")
        .unwrap();

    // delivered 100 seconds after it was sent: Tp is long gone
    b.ecall
        .msg_recv(1000, 900, "alice", "client-a", &setup)
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            if b.events.lock().await.contains(&"missed:alice".to_owned()) {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("missed event");

    let events = b.events.lock().await;
    assert!(!events.iter().any(|e| e.starts_with("incoming:")));
}

#[tokio::test]
async fn test_setup_response_from_own_user_stops_ringing() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (a, mut a_out) = make_endpoint("alice", "client-a", loopback_conf()).await;
    let (mut b, _b_out) = make_endpoint("bob", "client-b", loopback_conf()).await;

    a.ecall.start().await.unwrap();
    let setup = timeout(Duration::from_secs(5), a_out.recv())
        .await
        .expect("outbound setup")
        .unwrap();
    b.ecall
        .msg_recv(10, 10, "alice", "client-a", &setup)
        .await
        .unwrap();
    await_state(&b.ecall, EconnState::PendingIncoming, 5).await;

    // bob's other device answered: a SETUP response from bob himself
    let answer_elsewhere = r#"{"version":"3.0","type":"SETUP","sessid":"zzzzz","src_userid":"bob","src_clientid":"client-b2","resp":true,"sdp":"v=0"}"#;
    b.ecall
        .msg_recv(10, 10, "bob", "client-b2", answer_elsewhere)
        .await
        .unwrap();

    let (code, _metrics) = timeout(Duration::from_secs(5), b.closed_rx.recv())
        .await
        .expect("b closes")
        .unwrap();
    assert_eq!(code, peercall::Error::ErrAnsweredElsewhere.code());
}

struct TestAuth;

impl turn::auth::AuthHandler for TestAuth {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        _src: SocketAddr,
    ) -> turn::Result<Vec<u8>> {
        Ok(turn::auth::generate_auth_key(username, realm, "pass"))
    }
}

async fn start_turn_server() -> SocketAddr {
    let sock = util::UdpConn::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = sock.local_addr().unwrap();
    let server = turn::server::Server::new(
        "peercall.test".to_owned(),
        "127.0.0.1".parse().unwrap(),
        Arc::new(TestAuth),
    );
    server.serve_udp(Arc::new(sock));
    addr
}

#[tokio::test]
async fn test_relay_only_call_selects_relay_pair() {
    let _ = env_logger::builder().is_test(true).try_init();

    let turn_addr = start_turn_server().await;

    // TEST-NET host candidates are unroutable, so only the relayed
    // path can succeed
    let conf = || EcallConfig {
        local_addrs: vec!["203.0.113.77".parse().unwrap()],
        turn_servers: vec![ice::agent::TurnServerConfig {
            addr: turn_addr,
            username: "user".to_owned(),
            password: "pass".to_owned(),
            allow_udp: true,
            allow_tcp: false,
        }],
        ..Default::default()
    };

    let (a, a_out) = make_endpoint("alice", "client-a", conf()).await;
    let (b, b_out) = make_endpoint("bob", "client-b", conf()).await;
    wire_pair(&a, a_out, &b, b_out).await;

    a.ecall.start().await.unwrap();
    timeout(Duration::from_secs(10), async {
        loop {
            if b.ecall.state().await == EconnState::PendingIncoming {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("incoming within deadline");
    b.ecall.answer().await.unwrap();

    await_state(&a.ecall, EconnState::DatachanEstablished, 30).await;
    await_state(&b.ecall, EconnState::DatachanEstablished, 30).await;

    // the close metrics must report the relayed pair
    a.ecall.end().await;
    let (mut a, mut b) = (a, b);
    let (_code, metrics) = timeout(Duration::from_secs(10), a.closed_rx.recv())
        .await
        .expect("a closes")
        .unwrap();
    let _ = timeout(Duration::from_secs(10), b.closed_rx.recv()).await;

    // every surviving path runs through the relay; the strict
    // (relay, relay) pairing is asserted at the mediaflow level where
    // host candidates can be absent entirely
    let v: serde_json::Value = serde_json::from_str(&metrics).unwrap();
    assert_eq!(v["remote_cand"], "relay");
}

#[tokio::test]
async fn test_restart_renegotiates_back_to_established() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (a, a_out) = make_endpoint("alice", "client-a", loopback_conf()).await;
    let (b, b_out) = make_endpoint("bob", "client-b", loopback_conf()).await;
    wire_pair(&a, a_out, &b, b_out).await;

    a.ecall.start().await.unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if b.ecall.state().await == EconnState::PendingIncoming {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("incoming");
    b.ecall.answer().await.unwrap();

    await_state(&a.ecall, EconnState::DatachanEstablished, 15).await;
    await_state(&b.ecall, EconnState::DatachanEstablished, 15).await;

    // network handover: full re-gather, re-offer, re-handshake
    a.ecall.restart().await.unwrap();

    await_state(&a.ecall, EconnState::DatachanEstablished, 30).await;
    await_state(&b.ecall, EconnState::DatachanEstablished, 30).await;
}
