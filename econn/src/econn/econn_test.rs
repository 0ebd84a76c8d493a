use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout, Duration};

use super::*;
use crate::msg::{EconnMessage, MsgContent};

struct ChanTransport {
    tx: mpsc::UnboundedSender<EconnMessage>,
}

#[async_trait]
impl SignalingTransport for ChanTransport {
    async fn send(&self, msg: &EconnMessage) -> Result<()> {
        self.tx
            .send(msg.clone())
            .map_err(|e| Error::ErrTransportFailed(e.to_string()))
    }
}

struct Peer {
    econn: Arc<Econn>,
    outbox: mpsc::UnboundedReceiver<EconnMessage>,
    userid: &'static str,
    clientid: &'static str,
    events: Arc<AsyncMutex<Vec<String>>>,
}

async fn make_peer(userid: &'static str, clientid: &'static str, conf: EconnConfig) -> Peer {
    let (tx, outbox) = mpsc::unbounded_channel();
    let econn = Econn::new(
        conf,
        userid,
        clientid,
        Arc::new(ChanTransport { tx }),
    )
    .unwrap();

    let events = Arc::new(AsyncMutex::new(Vec::<String>::new()));

    let ev = Arc::clone(&events);
    econn
        .on_incoming(Box::new(move |_t, user, _client, age, _sdp, _props| {
            let ev = Arc::clone(&ev);
            Box::pin(async move {
                ev.lock().await.push(format!("incoming:{user}:{age}"));
            })
        }))
        .await;

    let ev = Arc::clone(&events);
    econn
        .on_answer(Box::new(move |reset, _sdp, _props| {
            let ev = Arc::clone(&ev);
            Box::pin(async move {
                ev.lock().await.push(format!("answer:reset={reset}"));
            })
        }))
        .await;

    let ev = Arc::clone(&events);
    econn
        .on_close(Box::new(move |err, _time| {
            let ev = Arc::clone(&ev);
            Box::pin(async move {
                let code = err.map(|e| e.code()).unwrap_or(0);
                ev.lock().await.push(format!("close:{code}"));
            })
        }))
        .await;

    Peer {
        econn,
        outbox,
        userid,
        clientid,
        events,
    }
}

fn default_conf() -> EconnConfig {
    EconnConfig::default()
}

async fn next_out(peer: &mut Peer) -> EconnMessage {
    timeout(Duration::from_secs(1), peer.outbox.recv())
        .await
        .expect("outbound message within deadline")
        .expect("channel open")
}

async fn deliver(from: &Peer, to: &Peer, msg: &EconnMessage) {
    to.econn
        .recv_message(from.userid, from.clientid, msg)
        .await;
}

async fn events_of(peer: &Peer) -> Vec<String> {
    peer.events.lock().await.clone()
}

#[tokio::test]
async fn test_start_sends_setup_request() {
    let mut a = make_peer("alice", "ca", default_conf()).await;

    a.econn.start("sdp-offer", None).await.unwrap();
    assert_eq!(a.econn.current_state().await, EconnState::PendingOutgoing);
    assert_eq!(a.econn.current_dir().await, EconnDir::Outgoing);

    let msg = next_out(&mut a).await;
    assert_eq!(msg.msg_type(), MsgType::Setup);
    assert!(msg.is_request());
    assert_eq!(msg.src_userid, "alice");
}

#[tokio::test]
async fn test_cannot_start_without_idle_state() {
    let mut a = make_peer("alice", "ca", default_conf()).await;
    a.econn.start("sdp", None).await.unwrap();
    let _ = next_out(&mut a).await;

    // a second start from PendingOutgoing is legal (re-offer) ...
    a.econn.start("sdp2", None).await.unwrap();
    let _ = next_out(&mut a).await;

    // ... but answering an outgoing call is not
    assert!(a.econn.answer("sdp", None).await.is_err());
}

#[tokio::test]
async fn test_happy_one_leg_call() {
    let mut a = make_peer("alice", "ca", default_conf()).await;
    let mut b = make_peer("bob", "cb", default_conf()).await;

    // SETUP request travels a -> b
    a.econn.start("offer-sdp", None).await.unwrap();
    let setup = next_out(&mut a).await;
    deliver(&a, &b, &setup).await;

    assert_eq!(b.econn.current_state().await, EconnState::PendingIncoming);
    assert_eq!(b.econn.current_dir().await, EconnDir::Incoming);
    assert_eq!(b.econn.userid_remote().await, "alice");
    assert!(events_of(&b).await.iter().any(|e| e.starts_with("incoming:alice")));

    // SETUP response travels b -> a
    b.econn.answer("answer-sdp", None).await.unwrap();
    let answer = next_out(&mut b).await;
    assert_eq!(b.econn.current_state().await, EconnState::Answered);
    deliver(&b, &a, &answer).await;

    assert_eq!(a.econn.current_state().await, EconnState::Answered);
    assert!(events_of(&a).await.contains(&"answer:reset=false".to_owned()));

    // session ids latched crosswise
    assert_eq!(a.econn.sessid_remote().await, b.econn.sessid_local());
    assert_eq!(b.econn.sessid_remote().await, a.econn.sessid_local());

    // data channel opens on both ends
    a.econn.set_datachan_established().await;
    b.econn.set_datachan_established().await;
    assert_eq!(
        a.econn.current_state().await,
        EconnState::DatachanEstablished
    );

    // hangup handshake: a requests, b responds, both close normally
    a.econn.end().await;
    let hangup_req = next_out(&mut a).await;
    assert_eq!(hangup_req.msg_type(), MsgType::Hangup);
    assert!(hangup_req.is_request());
    assert_eq!(a.econn.current_state().await, EconnState::HangupSent);

    deliver(&a, &b, &hangup_req).await;
    let hangup_resp = next_out(&mut b).await;
    assert_eq!(hangup_resp.msg_type(), MsgType::Hangup);
    assert!(!hangup_resp.is_request());
    assert_eq!(b.econn.current_state().await, EconnState::Terminating);
    assert!(events_of(&b).await.contains(&"close:0".to_owned()));

    deliver(&b, &a, &hangup_resp).await;
    assert_eq!(a.econn.current_state().await, EconnState::Terminating);
    assert!(events_of(&a).await.contains(&"close:0".to_owned()));
}

#[tokio::test]
async fn test_glare_resolution() {
    // "alice" < "bob": bob wins, alice answers
    let mut a = make_peer("alice", "ca", default_conf()).await;
    let mut b = make_peer("bob", "cb", default_conf()).await;

    a.econn.start("sdp-a", None).await.unwrap();
    b.econn.start("sdp-b", None).await.unwrap();
    let setup_a = next_out(&mut a).await;
    let setup_b = next_out(&mut b).await;

    // both setups cross on the wire
    deliver(&b, &a, &setup_b).await;
    deliver(&a, &b, &setup_a).await;

    // loser alice turns around and answers
    assert_eq!(
        a.econn.current_state().await,
        EconnState::ConflictResolution
    );
    assert!(events_of(&a).await.contains(&"answer:reset=true".to_owned()));

    // winner bob keeps its outgoing setup
    assert_eq!(b.econn.current_state().await, EconnState::PendingOutgoing);

    // alice's fresh answer lands bob in Answered
    a.econn.answer("sdp-a2", None).await.unwrap();
    assert_eq!(a.econn.current_state().await, EconnState::Answered);
    let answer = next_out(&mut a).await;
    deliver(&a, &b, &answer).await;
    assert_eq!(b.econn.current_state().await, EconnState::Answered);
}

#[tokio::test]
async fn test_cross_talk_dropped_by_session_id() {
    let mut a = make_peer("alice", "ca", default_conf()).await;
    let mut b = make_peer("bob", "cb", default_conf()).await;

    a.econn.start("offer", None).await.unwrap();
    let setup = next_out(&mut a).await;
    deliver(&a, &b, &setup).await;
    b.econn.answer("answer", None).await.unwrap();
    let answer = next_out(&mut b).await;
    deliver(&b, &a, &answer).await;
    a.econn.set_datachan_established().await;

    // an out-of-the-blue UPDATE with a foreign session id
    let mut stray = EconnMessage::new(
        "xxxxx",
        MsgContent::Update {
            sdp: "stray".to_owned(),
            props: None,
        },
    );
    stray.src_userid = "bob".to_owned();
    stray.src_clientid = "cb".to_owned();

    let before = a.econn.current_state().await;
    deliver(&b, &a, &stray).await;

    assert_eq!(a.econn.current_state().await, before);
    assert_eq!(a.econn.dropped_session_mismatch(), 1);
}

#[tokio::test]
async fn test_stray_setup_dropped_and_counted() {
    let mut a = make_peer("alice", "ca", default_conf()).await;
    let mut b = make_peer("bob", "cb", default_conf()).await;

    a.econn.start("offer", None).await.unwrap();
    let setup = next_out(&mut a).await;
    deliver(&a, &b, &setup).await;
    b.econn.answer("answer", None).await.unwrap();
    let answer = next_out(&mut b).await;
    deliver(&b, &a, &answer).await;
    a.econn.set_datachan_established().await;

    // an out-of-the-blue SETUP request from another call of the same
    // peer: latched remote session is b's, this one is foreign
    let mut stray = EconnMessage::new(
        "xxxxx",
        MsgContent::Setup {
            sdp: "stray-offer".to_owned(),
            props: None,
        },
    );
    stray.src_userid = "bob".to_owned();
    stray.src_clientid = "cb".to_owned();

    let before = a.econn.current_state().await;
    let events_before = events_of(&a).await.len();
    deliver(&b, &a, &stray).await;

    assert_eq!(a.econn.current_state().await, before);
    assert_eq!(a.econn.dropped_session_mismatch(), 1);
    // no side effect reached the application either
    assert_eq!(events_of(&a).await.len(), events_before);
}

#[tokio::test]
async fn test_messages_from_different_identity_dropped() {
    let mut a = make_peer("alice", "ca", default_conf()).await;
    let b = make_peer("bob", "cb", default_conf()).await;
    let mallory = make_peer("mallory", "cm", default_conf()).await;

    a.econn.start("offer", None).await.unwrap();
    let setup = next_out(&mut a).await;
    deliver(&a, &b, &setup).await;

    // b's identity is latched on b's econn; now mallory's SETUP
    // arrives at a (whose remote is still unset) and gets latched,
    // then b's answer must be dropped
    let mut mallory_setup = EconnMessage::new(
        "msess",
        MsgContent::Setup {
            sdp: "m-sdp".to_owned(),
            props: None,
        },
    );
    mallory_setup.src_userid = "mallory".to_owned();
    mallory_setup.src_clientid = "cm".to_owned();
    deliver(&mallory, &a, &mallory_setup).await;
    assert_eq!(a.econn.userid_remote().await, "mallory");

    let mut fake_answer = EconnMessage::new(
        "bsess",
        MsgContent::Setup {
            sdp: "b-sdp".to_owned(),
            props: None,
        },
    );
    fake_answer.resp = true;
    fake_answer.src_userid = "bob".to_owned();
    fake_answer.src_clientid = "cb".to_owned();

    let before = a.econn.current_state().await;
    deliver(&b, &a, &fake_answer).await;
    assert_eq!(a.econn.current_state().await, before);
    assert_eq!(a.econn.dropped_identity_mismatch(), 1);
}

#[tokio::test]
async fn test_setup_timeout_closes_with_timeout_error() {
    let conf = EconnConfig {
        timeout_setup: Duration::from_millis(50),
        timeout_term: Duration::from_millis(50),
    };
    let mut a = make_peer("alice", "ca", conf).await;

    a.econn.start("offer", None).await.unwrap();
    let _setup = next_out(&mut a).await;

    sleep(Duration::from_millis(200)).await;

    assert_eq!(a.econn.current_state().await, EconnState::Terminating);
    let events = events_of(&a).await;
    assert!(
        events.contains(&format!("close:{}", Error::ErrTimeout.code())),
        "events: {events:?}"
    );

    // timing out a pending outgoing call also cancels it on the wire
    let cancel = next_out(&mut a).await;
    assert_eq!(cancel.msg_type(), MsgType::Cancel);
}

#[tokio::test]
async fn test_cancel_from_remote() {
    let mut a = make_peer("alice", "ca", default_conf()).await;
    let b = make_peer("bob", "cb", default_conf()).await;

    a.econn.start("offer", None).await.unwrap();
    let setup = next_out(&mut a).await;
    deliver(&a, &b, &setup).await;
    assert_eq!(b.econn.current_state().await, EconnState::PendingIncoming);

    let mut cancel = EconnMessage::new(a.econn.sessid_local(), MsgContent::Cancel);
    cancel.src_userid = "alice".to_owned();
    cancel.src_clientid = "ca".to_owned();
    deliver(&a, &b, &cancel).await;

    assert_eq!(b.econn.current_state().await, EconnState::Terminating);
    let events = events_of(&b).await;
    assert!(events.contains(&format!("close:{}", Error::ErrCancelled.code())));
}

#[tokio::test]
async fn test_propsync_requires_datachan_and_is_idempotent() {
    let mut a = make_peer("alice", "ca", default_conf()).await;
    let mut b = make_peer("bob", "cb", default_conf()).await;

    let mut props = Properties::new();
    props.add("videosend", "false");

    // before establishment: protocol error
    assert!(a.econn.send_propsync(false, &props).await.is_err());

    a.econn.start("offer", None).await.unwrap();
    let setup = next_out(&mut a).await;
    deliver(&a, &b, &setup).await;
    b.econn.answer("answer", None).await.unwrap();
    let answer = next_out(&mut b).await;
    deliver(&b, &a, &answer).await;
    a.econn.set_datachan_established().await;

    // repeated propsyncs are fine and do not move the state machine
    a.econn.send_propsync(false, &props).await.unwrap();
    a.econn.send_propsync(false, &props).await.unwrap();
    assert_eq!(
        a.econn.current_state().await,
        EconnState::DatachanEstablished
    );

    let m1 = next_out(&mut a).await;
    let m2 = next_out(&mut a).await;
    assert_eq!(m1.msg_type(), MsgType::Propsync);
    assert_eq!(m1.content, m2.content);
}

#[tokio::test]
async fn test_alert_dispatches_to_handler() {
    let mut a = make_peer("alice", "ca", default_conf()).await;
    let b = make_peer("bob", "cb", default_conf()).await;

    let alerts = Arc::new(AsyncMutex::new(Vec::<(u32, String)>::new()));
    let sink = Arc::clone(&alerts);
    b.econn
        .on_alert(Box::new(move |level, descr| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().await.push((level, descr));
            })
        }))
        .await;

    // alerts are transient: no call state is required to carry one
    a.econn.send_alert(3, "ringing").await.unwrap();
    let alert = next_out(&mut a).await;
    assert_eq!(alert.msg_type(), MsgType::Alert);
    deliver(&a, &b, &alert).await;

    let got = alerts.lock().await.clone();
    assert_eq!(got, vec![(3, "ringing".to_owned())]);
    assert_eq!(b.econn.current_state().await, EconnState::Idle);
}

#[tokio::test]
async fn test_update_flow_returns_to_answered() {
    let mut a = make_peer("alice", "ca", default_conf()).await;
    let mut b = make_peer("bob", "cb", default_conf()).await;

    a.econn.start("offer", None).await.unwrap();
    let setup = next_out(&mut a).await;
    deliver(&a, &b, &setup).await;
    b.econn.answer("answer", None).await.unwrap();
    let answer = next_out(&mut b).await;
    deliver(&b, &a, &answer).await;
    a.econn.set_datachan_established().await;
    b.econn.set_datachan_established().await;

    // a requests an update
    a.econn.update_req("offer2", None).await.unwrap();
    assert_eq!(a.econn.current_state().await, EconnState::UpdateSent);
    let update = next_out(&mut a).await;
    assert_eq!(update.msg_type(), MsgType::Update);

    deliver(&a, &b, &update).await;
    assert_eq!(b.econn.current_state().await, EconnState::UpdateRecv);

    b.econn.update_resp("answer2", None).await.unwrap();
    assert_eq!(b.econn.current_state().await, EconnState::Answered);
    let update_resp = next_out(&mut b).await;

    deliver(&b, &a, &update_resp).await;
    assert_eq!(a.econn.current_state().await, EconnState::Answered);
}
