use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::{timeout, Duration};
use util::UdpConn;

use super::*;
use crate::rand_creds::{generate_pwd, generate_ufrag};

async fn make_agent(controlling: bool) -> (Arc<Agent>, SocketAddr) {
    let socket = Arc::new(UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
    let addr = socket.local_addr().unwrap();

    let agent = Agent::new(
        AgentConfig {
            ufrag: generate_ufrag(),
            pwd: generate_pwd(),
            is_controlling: controlling,
            stun_server: None,
            turn_servers: vec![],
            local_addrs: vec!["127.0.0.1".parse().unwrap()],
        },
        socket,
    );
    agent.start();
    (agent, addr)
}

async fn wire_up(a: &Arc<Agent>, b: &Arc<Agent>) {
    a.set_remote_credentials(b.local_ufrag().to_owned(), b.local_pwd().to_owned())
        .await;
    b.set_remote_credentials(a.local_ufrag().to_owned(), a.local_pwd().to_owned())
        .await;

    for cand in a.local_candidates().await {
        b.add_remote_candidate(cand).await;
    }
    for cand in b.local_candidates().await {
        a.add_remote_candidate(cand).await;
    }
}

async fn await_selected(agent: &Arc<Agent>) -> CandidatePair {
    let mut rx = agent.selected_watch();
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(pair) = rx.borrow().clone() {
                return pair;
            }
            if rx.changed().await.is_err() {
                panic!("agent closed before selection");
            }
        }
    })
    .await
    .expect("selection within deadline")
}

#[tokio::test]
async fn test_gather_host_candidates() {
    let (agent, addr) = make_agent(true).await;

    agent.gather().await.unwrap();
    assert!(agent.is_gathered());

    let local = agent.local_candidates().await;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].typ, CandidateType::Host);
    assert_eq!(local[0].addr.port(), addr.port());

    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_gathering_complete_fires_once() {
    let (agent, _) = make_agent(true).await;

    let count = Arc::new(portable_atomic::AtomicU32::new(0));
    let count2 = Arc::clone(&count);
    agent
        .on_gathering_complete(Box::new(move || {
            let count = Arc::clone(&count2);
            Box::pin(async move {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
        }))
        .await;

    agent.gather().await.unwrap();
    // second gather invocation must not re-fire completion
    let _ = agent.gather().await;

    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_loopback_connectivity_selects_host_pair() {
    let (a, _) = make_agent(true).await;
    let (b, _) = make_agent(false).await;

    a.gather().await.unwrap();
    b.gather().await.unwrap();
    wire_up(&a, &b).await;

    a.start_checks();
    b.start_checks();

    let pa = await_selected(&a).await;
    assert_eq!(pa.local.typ, CandidateType::Host);
    assert_eq!(pa.remote.typ, CandidateType::Host);

    // the controlled side latches from the nominated inbound check
    let pb = await_selected(&b).await;
    assert_eq!(pb.remote.addr.port(), pa.local.addr.port());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_send_to_selected_direct() {
    let (a, _) = make_agent(true).await;
    let (b, _) = make_agent(false).await;

    a.gather().await.unwrap();
    b.gather().await.unwrap();
    wire_up(&a, &b).await;

    a.start_checks();
    b.start_checks();
    await_selected(&a).await;

    let mut mux_b = b.take_mux_receiver().await.unwrap();

    // a non-STUN byte pattern must surface on b's mux stream
    let payload = vec![0x80u8, 1, 2, 3];
    a.send_to_selected(&payload).await.unwrap();

    let (got, _) = timeout(Duration::from_secs(2), mux_b.recv())
        .await
        .expect("mux delivery")
        .unwrap();
    assert_eq!(got, payload);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_lite_forces_controlling() {
    let (agent, _) = make_agent(false).await;
    assert!(!agent.is_controlling());

    agent.set_remote_lite(true);
    assert!(agent.is_controlling());

    agent.close().await.unwrap();
}
