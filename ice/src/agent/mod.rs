#[cfg(test)]
mod agent_test;

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use portable_atomic::AtomicBool;
use rand::Rng;
use stun::attributes::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::TextAttribute;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{sleep, timeout, Duration};
use turn::client::relay_conn::RelayConn;
use turn::client::tcp_conn::TcpStreamConn;
use turn::client::{ClientConfig, TurnClient};
use util::{Conn, UdpConn};

use crate::candidate::*;
use crate::{Error, Result};

const CHECK_INTERVAL: Duration = Duration::from_millis(250);
const CHECK_TIMEOUT: Duration = Duration::from_millis(1600);
const MAX_CHECK_FAILURES: u32 = 8;

pub type OnCandidateHdlrFn = Box<
    dyn (FnMut(Candidate) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnGatheringCompleteHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

/// TurnServerConfig names one relay to try while gathering, in
/// transport preference order UDP, then TCP, then TLS-over-TCP.
#[derive(Clone, Debug)]
pub struct TurnServerConfig {
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
    /// allow_udp/allow_tcp narrow the transports tried.
    pub allow_udp: bool,
    pub allow_tcp: bool,
}

/// AgentConfig seeds the trickle agent. `is_controlling` comes from
/// the caller's identity comparison, not from a tie-breaker exchange:
/// the lexicographically larger (user-id, client-id) controls, and a
/// remote ice-lite peer forces the local side to controlling.
pub struct AgentConfig {
    pub ufrag: String,
    pub pwd: String,
    pub is_controlling: bool,
    pub stun_server: Option<SocketAddr>,
    pub turn_servers: Vec<TurnServerConfig>,
    pub local_addrs: Vec<IpAddr>,
}

/// PairState tracks one candidate pair through its checks.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
enum PairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// CandidatePair is the (local, remote) combination checks run over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

struct PairEntry {
    pair: CandidatePair,
    state: PairState,
    failures: u32,
}

/// SendPath is where outgoing media should go: straight out the
/// socket, or wrapped through the TURN client.
#[derive(Clone)]
pub enum SendPath {
    Direct(SocketAddr),
    Relay(Arc<TurnClient>, SocketAddr),
}

struct Handlers {
    on_candidate: Option<OnCandidateHdlrFn>,
    on_gathering_complete: Option<OnGatheringCompleteHdlrFn>,
}

/// Agent is the trickle-ICE agent for one call: it gathers host,
/// server-reflexive and relayed candidates, runs aggressive-
/// nomination connectivity checks, and latches the first working
/// pair as selected.
pub struct Agent {
    ufrag: String,
    pwd: String,
    is_controlling: AtomicBool,
    stun_server: Option<SocketAddr>,
    turn_servers: Vec<TurnServerConfig>,
    local_addrs: Vec<IpAddr>,

    socket: Arc<UdpConn>,
    relay: Mutex<Option<Arc<RelayConn>>>,
    relay_client: Mutex<Option<Arc<TurnClient>>>,

    local_candidates: Mutex<Vec<Candidate>>,
    remote_candidates: Mutex<Vec<Candidate>>,
    remote_creds: Mutex<Option<(String, String)>>,
    remote_is_lite: AtomicBool,

    pairs: Mutex<Vec<PairEntry>>,
    selected_tx: watch::Sender<Option<CandidatePair>>,
    selected_rx: watch::Receiver<Option<CandidatePair>>,

    gather_done_tx: watch::Sender<bool>,
    gather_done_rx: watch::Receiver<bool>,
    gather_fired: AtomicBool,

    transactions: Arc<Mutex<HashMap<TransactionId, oneshot::Sender<Message>>>>,
    handlers: Mutex<Handlers>,

    mux_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    mux_rx: Mutex<Option<mpsc::Receiver<(Vec<u8>, SocketAddr)>>>,

    tie_breaker: u64,
    closed: AtomicBool,
}

impl Agent {
    pub fn new(config: AgentConfig, socket: Arc<UdpConn>) -> Arc<Self> {
        let (selected_tx, selected_rx) = watch::channel(None);
        let (gather_done_tx, gather_done_rx) = watch::channel(false);
        let (mux_tx, mux_rx) = mpsc::channel(256);

        Arc::new(Agent {
            ufrag: config.ufrag,
            pwd: config.pwd,
            is_controlling: AtomicBool::new(config.is_controlling),
            stun_server: config.stun_server,
            turn_servers: config.turn_servers,
            local_addrs: config.local_addrs,
            socket,
            relay: Mutex::new(None),
            relay_client: Mutex::new(None),
            local_candidates: Mutex::new(vec![]),
            remote_candidates: Mutex::new(vec![]),
            remote_creds: Mutex::new(None),
            remote_is_lite: AtomicBool::new(false),
            pairs: Mutex::new(vec![]),
            selected_tx,
            selected_rx,
            gather_done_tx,
            gather_done_rx,
            gather_fired: AtomicBool::new(false),
            transactions: Arc::new(Mutex::new(HashMap::new())),
            handlers: Mutex::new(Handlers {
                on_candidate: None,
                on_gathering_complete: None,
            }),
            mux_tx,
            mux_rx: Mutex::new(Some(mux_rx)),
            tie_breaker: rand::thread_rng().gen(),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn on_candidate(&self, f: OnCandidateHdlrFn) {
        let mut handlers = self.handlers.lock().await;
        handlers.on_candidate = Some(f);
    }

    pub async fn on_gathering_complete(&self, f: OnGatheringCompleteHdlrFn) {
        let mut handlers = self.handlers.lock().await;
        handlers.on_gathering_complete = Some(f);
    }

    /// take_mux_receiver hands out the stream of non-STUN packets
    /// (DTLS, SRTP) arriving on any of the agent's paths.
    pub async fn take_mux_receiver(&self) -> Option<mpsc::Receiver<(Vec<u8>, SocketAddr)>> {
        let mut rx = self.mux_rx.lock().await;
        rx.take()
    }

    pub fn local_ufrag(&self) -> &str {
        &self.ufrag
    }

    pub fn local_pwd(&self) -> &str {
        &self.pwd
    }

    pub fn is_controlling(&self) -> bool {
        self.is_controlling.load(Ordering::SeqCst)
    }

    /// set_controlling installs the role once the caller can compare
    /// identities; both sides derive it from the same tuple ordering
    /// so they always disagree exactly once.
    pub fn set_controlling(&self, controlling: bool) {
        if !self.remote_is_lite.load(Ordering::SeqCst) {
            self.is_controlling.store(controlling, Ordering::SeqCst);
        }
    }

    /// set_remote_lite forces the local side to controlling; a lite
    /// responder never controls.
    pub fn set_remote_lite(&self, lite: bool) {
        self.remote_is_lite.store(lite, Ordering::SeqCst);
        if lite {
            self.is_controlling.store(true, Ordering::SeqCst);
        }
    }

    /// start spawns the socket read loop. Call once.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 0xffff];
            loop {
                if this.closed.load(Ordering::SeqCst) {
                    break;
                }
                let (n, src) = match this.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        log::debug!("ice agent socket loop done: {err}");
                        break;
                    }
                };

                if is_message(&buf[..n]) {
                    if let Err(err) = this.handle_stun(&buf[..n], src, false).await {
                        log::warn!("ice agent: stun handling failed: {err}");
                    }
                } else {
                    let _ = this.mux_tx.send((buf[..n].to_vec(), src)).await;
                }
            }
        });
    }

    /// gather runs the three stages host -> srflx -> relay and fires
    /// the completion handler exactly once at the end.
    pub async fn gather(self: &Arc<Self>) -> Result<()> {
        let port = self.socket.local_addr()?.port();

        // host candidates: one per usable local address, sharing the
        // socket's port
        let mut foundation = 1u32;
        for ip in self.local_addrs.clone() {
            let cand = Candidate::new_host(
                foundation.to_string(),
                SocketAddr::new(ip, port),
                65535 - foundation as u16,
            );
            foundation += 1;
            self.add_local_candidate(cand).await;
        }

        // server-reflexive via the gather STUN server
        if let Some(stun_server) = self.stun_server {
            match self.query_mapped_address(stun_server).await {
                Ok(mapped) => {
                    let already_host = {
                        let local = self.local_candidates.lock().await;
                        local.iter().any(|c| c.addr == mapped)
                    };
                    if !already_host {
                        let base = SocketAddr::new(
                            self.local_addrs.first().copied().unwrap_or(mapped.ip()),
                            port,
                        );
                        let cand = Candidate::new_server_reflexive(
                            foundation.to_string(),
                            mapped,
                            base,
                        );
                        foundation += 1;
                        self.add_local_candidate(cand).await;
                    }
                }
                Err(err) => {
                    log::warn!("ice agent: srflx gather failed: {err}");
                }
            }
        }

        // relayed via the TURN servers, UDP preferred, TCP fallback
        for server in self.turn_servers.clone() {
            match self.allocate_relay(&server).await {
                Ok((relayed, base)) => {
                    let cand =
                        Candidate::new_relay(foundation.to_string(), relayed, base);
                    foundation += 1;
                    self.add_local_candidate(cand).await;
                    // one relay is plenty for a 1:1 call
                    break;
                }
                Err(err) => {
                    log::warn!("ice agent: relay gather at {} failed: {err}", server.addr);
                }
            }
        }

        let have_any = {
            let local = self.local_candidates.lock().await;
            !local.is_empty()
        };

        self.fire_gathering_complete().await;

        if have_any {
            Ok(())
        } else {
            Err(Error::ErrGatherTimeout)
        }
    }

    async fn fire_gathering_complete(&self) {
        // downstream must tolerate a redundant call; the flag makes
        // sure they never see one
        if self.gather_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.gather_done_tx.send(true);

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_gathering_complete.as_mut() {
            f().await;
        }
    }

    pub fn gather_complete_watch(&self) -> watch::Receiver<bool> {
        self.gather_done_rx.clone()
    }

    pub fn is_gathered(&self) -> bool {
        *self.gather_done_rx.borrow()
    }

    async fn add_local_candidate(&self, cand: Candidate) {
        log::debug!("ice agent: local candidate {cand}");
        {
            let mut local = self.local_candidates.lock().await;
            local.push(cand.clone());
        }
        self.form_pairs().await;

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_candidate.as_mut() {
            f(cand).await;
        }
    }

    pub async fn local_candidates(&self) -> Vec<Candidate> {
        self.local_candidates.lock().await.clone()
    }

    /// add_remote_candidate accepts one trickled (or SDP-carried)
    /// candidate from the peer.
    pub async fn add_remote_candidate(&self, cand: Candidate) {
        if cand.component != COMPONENT_RTP {
            return;
        }
        {
            let mut remote = self.remote_candidates.lock().await;
            if remote.iter().any(|c| c.addr == cand.addr) {
                return;
            }
            log::debug!("ice agent: remote candidate {cand}");
            remote.push(cand);
        }
        self.form_pairs().await;
    }

    pub async fn set_remote_credentials(&self, ufrag: String, pwd: String) {
        let mut creds = self.remote_creds.lock().await;
        *creds = Some((ufrag, pwd));
    }

    async fn form_pairs(&self) {
        let local = self.local_candidates.lock().await.clone();
        let remote = self.remote_candidates.lock().await.clone();
        let mut pairs = self.pairs.lock().await;

        for l in &local {
            for r in &remote {
                if l.addr.is_ipv4() != r.addr.is_ipv4() {
                    continue;
                }
                let exists = pairs
                    .iter()
                    .any(|p| p.pair.local.addr == l.addr && p.pair.remote.addr == r.addr);
                if !exists {
                    pairs.push(PairEntry {
                        pair: CandidatePair {
                            local: l.clone(),
                            remote: r.clone(),
                        },
                        state: PairState::Waiting,
                        failures: 0,
                    });
                }
            }
        }

        // highest combined priority first
        pairs.sort_by(|a, b| {
            let pa = a.pair.local.priority as u64 + a.pair.remote.priority as u64;
            let pb = b.pair.local.priority as u64 + b.pair.remote.priority as u64;
            pb.cmp(&pa)
        });
    }

    /// start_checks drives connectivity checks until a pair is
    /// selected. The first success wins and later successes never
    /// replace it; only a failing selected pair reopens the hunt.
    pub fn start_checks(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if this.closed.load(Ordering::SeqCst) {
                    break;
                }
                if this.selected_rx.borrow().is_some() {
                    break;
                }

                let todo: Vec<CandidatePair> = {
                    let mut pairs = this.pairs.lock().await;
                    pairs
                        .iter_mut()
                        .filter(|p| {
                            p.state == PairState::Waiting || p.state == PairState::InProgress
                        })
                        .map(|p| {
                            p.state = PairState::InProgress;
                            p.pair.clone()
                        })
                        .collect()
                };

                for pair in todo {
                    if this.selected_rx.borrow().is_some() {
                        break;
                    }
                    let this2 = Arc::clone(&this);
                    tokio::spawn(async move {
                        this2.check_pair(pair).await;
                    });
                }

                sleep(CHECK_INTERVAL).await;
            }
        });
    }

    async fn check_pair(self: &Arc<Self>, pair: CandidatePair) {
        match self.send_binding_check(&pair).await {
            Ok(_) => {
                let mut pairs = self.pairs.lock().await;
                if let Some(p) = pairs
                    .iter_mut()
                    .find(|p| p.pair == pair)
                {
                    p.state = PairState::Succeeded;
                }
                drop(pairs);
                self.latch_selected(pair).await;
            }
            Err(err) => {
                log::debug!("ice agent: check failed for {} -> {}: {err}", pair.local, pair.remote);
                let mut pairs = self.pairs.lock().await;
                if let Some(p) = pairs.iter_mut().find(|p| p.pair == pair) {
                    p.failures += 1;
                    if p.failures >= MAX_CHECK_FAILURES {
                        p.state = PairState::Failed;
                    } else {
                        p.state = PairState::Waiting;
                    }
                }
            }
        }
    }

    async fn latch_selected(&self, pair: CandidatePair) {
        let mut latched = false;
        self.selected_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(pair.clone());
                latched = true;
                true
            } else {
                false
            }
        });
        if latched {
            log::info!("ice agent: selected pair {} -> {}", pair.local, pair.remote);
        }
    }

    /// mark_selected_failed reopens checking after the selected pair
    /// went dark (consent expiry).
    pub async fn mark_selected_failed(self: &Arc<Self>) {
        let pair = self.selected_rx.borrow().clone();
        if let Some(pair) = pair {
            {
                let mut pairs = self.pairs.lock().await;
                if let Some(p) = pairs.iter_mut().find(|p| p.pair == pair) {
                    p.state = PairState::Failed;
                }
            }
            let _ = self.selected_tx.send(None);
            self.start_checks();
        }
    }

    pub fn selected_watch(&self) -> watch::Receiver<Option<CandidatePair>> {
        self.selected_rx.clone()
    }

    pub fn selected_pair(&self) -> Option<CandidatePair> {
        self.selected_rx.borrow().clone()
    }

    /// send_path says how media should leave this agent right now.
    pub async fn send_path(&self) -> Option<SendPath> {
        let pair = self.selected_rx.borrow().clone()?;
        if pair.local.typ == CandidateType::Relay {
            let client = self.relay_client.lock().await.clone()?;
            Some(SendPath::Relay(client, pair.remote.addr))
        } else {
            Some(SendPath::Direct(pair.remote.addr))
        }
    }

    /// send_to_selected routes one already-encrypted packet out the
    /// selected path.
    pub async fn send_to_selected(&self, data: &[u8]) -> Result<()> {
        match self.send_path().await {
            Some(SendPath::Direct(addr)) => {
                self.socket.send_to(data, addr).await?;
                Ok(())
            }
            Some(SendPath::Relay(client, addr)) => {
                client.relay_send(data, addr).await?;
                Ok(())
            }
            None => Err(Error::ErrNoCandidatePairs),
        }
    }

    async fn query_mapped_address(&self, server: SocketAddr) -> Result<SocketAddr> {
        let mut msg = Message::new();
        msg.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;

        let resp = self.transaction(&msg, server, false).await?;
        let mut mapped = XorMappedAddress::default();
        mapped.get_from(&resp)?;
        Ok(mapped.socket_addr())
    }

    async fn allocate_relay(
        self: &Arc<Self>,
        server: &TurnServerConfig,
    ) -> Result<(SocketAddr, SocketAddr)> {
        let transports: Vec<bool> = vec![server.allow_udp, server.allow_tcp];

        for (idx, allowed) in transports.into_iter().enumerate() {
            if !allowed {
                continue;
            }
            let attempt = if idx == 0 {
                self.allocate_relay_udp(server).await
            } else {
                self.allocate_relay_tcp(server).await
            };
            match attempt {
                Ok(v) => return Ok(v),
                Err(err) => log::debug!(
                    "ice agent: relay transport {} to {} failed: {err}",
                    if idx == 0 { "udp" } else { "tcp" },
                    server.addr
                ),
            }
        }

        Err(Error::Other("no relay transport succeeded".to_owned()))
    }

    async fn allocate_relay_udp(
        self: &Arc<Self>,
        server: &TurnServerConfig,
    ) -> Result<(SocketAddr, SocketAddr)> {
        let sock = UdpConn::bind("0.0.0.0:0".parse().unwrap()).await?;
        let base = sock.local_addr()?;
        let client = TurnClient::new(ClientConfig {
            conn: Arc::new(sock),
            server_addr: server.addr,
            username: server.username.clone(),
            password: server.password.clone(),
            software: "peercall-ice".to_owned(),
        });
        client.listen();
        self.install_relay(client, base).await
    }

    async fn allocate_relay_tcp(
        self: &Arc<Self>,
        server: &TurnServerConfig,
    ) -> Result<(SocketAddr, SocketAddr)> {
        let stream = TcpStreamConn::connect(server.addr).await?;
        let base = stream.local_addr()?;
        let client = TurnClient::new(ClientConfig {
            conn: Arc::new(stream),
            server_addr: server.addr,
            username: server.username.clone(),
            password: server.password.clone(),
            software: "peercall-ice".to_owned(),
        });
        client.listen();
        self.install_relay(client, base).await
    }

    async fn install_relay(
        self: &Arc<Self>,
        client: Arc<TurnClient>,
        base: SocketAddr,
    ) -> Result<(SocketAddr, SocketAddr)> {
        let relay_conn = Arc::new(client.allocate().await?);
        let relayed = relay_conn.local_addr()?;

        {
            let mut relay = self.relay.lock().await;
            *relay = Some(Arc::clone(&relay_conn));
        }
        {
            let mut rc = self.relay_client.lock().await;
            *rc = Some(Arc::clone(&client));
        }

        self.spawn_relay_loop(relay_conn);
        Ok((relayed, base))
    }

    fn spawn_relay_loop(self: &Arc<Self>, relay: Arc<RelayConn>) {
        let this = Arc::clone(self);
        let mux_tx = self.mux_tx.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 0xffff];
            loop {
                let (n, src) = match relay.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        log::debug!("ice agent relay loop done: {err}");
                        break;
                    }
                };
                if is_message(&buf[..n]) {
                    // requests answered and responses matched, same
                    // as on the direct path
                    if let Err(err) = this.handle_stun(&buf[..n], src, true).await {
                        log::warn!("ice agent: relay stun handling failed: {err}");
                    }
                } else {
                    let _ = mux_tx.send((buf[..n].to_vec(), src)).await;
                }
            }
        });
    }

    async fn transaction(
        &self,
        msg: &Message,
        dest: SocketAddr,
        via_relay: bool,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        {
            let mut transactions = self.transactions.lock().await;
            transactions.insert(msg.transaction_id, tx);
        }

        if via_relay {
            let relay = { self.relay.lock().await.clone() };
            if let Some(relay) = relay {
                relay.send_to(&msg.raw, dest).await?;
            } else {
                return Err(Error::ErrNoCandidatePairs);
            }
        } else {
            self.socket.send_to(&msg.raw, dest).await?;
        }

        match timeout(CHECK_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(Error::ErrClosed),
            Err(_) => {
                let mut transactions = self.transactions.lock().await;
                transactions.remove(&msg.transaction_id);
                Err(Error::Other("stun transaction timed out".to_owned()))
            }
        }
    }

    async fn send_binding_check(&self, pair: &CandidatePair) -> Result<SocketAddr> {
        let (rufrag, rpwd) = {
            let creds = self.remote_creds.lock().await;
            creds.clone().ok_or(Error::ErrNoCandidatePairs)?
        };

        let username = format!("{}:{}", rufrag, self.ufrag);
        let controlling = self.is_controlling();
        let prio = calc_priority(CandidateType::PeerReflexive, 65535, COMPONENT_RTP);

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(BINDING_REQUEST),
            Box::new(TextAttribute::new(ATTR_USERNAME, username)),
            Box::new(PriorityAttr(prio)),
        ];
        if controlling {
            setters.push(Box::new(ControlAttr {
                controlling: true,
                tie_breaker: self.tie_breaker,
            }));
            // aggressive nomination: every check carries USE-CANDIDATE
            setters.push(Box::new(UseCandidateAttr));
        } else {
            setters.push(Box::new(ControlAttr {
                controlling: false,
                tie_breaker: self.tie_breaker,
            }));
        }
        setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
            rpwd,
        )));
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&setters)?;

        let via_relay = pair.local.typ == CandidateType::Relay;
        if via_relay {
            // the relay will not forward without a permission
            let client = { self.relay_client.lock().await.clone() };
            if let Some(client) = client {
                let _ = client.create_permission(&[pair.remote.addr]).await;
            }
        }

        let resp = self.transaction(&msg, pair.remote.addr, via_relay).await?;
        if resp.typ.class != CLASS_SUCCESS_RESPONSE {
            return Err(Error::Other("binding check rejected".to_owned()));
        }

        let mut mapped = XorMappedAddress::default();
        mapped.get_from(&resp)?;
        Ok(mapped.socket_addr())
    }

    /// keepalive re-checks the selected pair; consent freshness runs
    /// on top of this.
    pub async fn keepalive(&self) -> Result<()> {
        let pair = self
            .selected_rx
            .borrow()
            .clone()
            .ok_or(Error::ErrNoCandidatePairs)?;
        self.send_binding_check(&pair).await?;
        Ok(())
    }

    /// handle_stun processes one STUN packet from either path:
    /// responses complete transactions, requests get validated,
    /// answered, and may latch the remote peer.
    pub async fn handle_stun(
        self: &Arc<Self>,
        data: &[u8],
        src: SocketAddr,
        via_relay: bool,
    ) -> Result<()> {
        let mut msg = Message::new();
        msg.read_from(data)?;

        match msg.typ.class {
            CLASS_SUCCESS_RESPONSE | CLASS_ERROR_RESPONSE => {
                let tx = {
                    let mut transactions = self.transactions.lock().await;
                    transactions.remove(&msg.transaction_id)
                };
                if let Some(tx) = tx {
                    let _ = tx.send(msg);
                }
                Ok(())
            }
            CLASS_REQUEST => self.handle_binding_request(&msg, src, via_relay).await,
            _ => Ok(()),
        }
    }

    async fn handle_binding_request(
        self: &Arc<Self>,
        msg: &Message,
        src: SocketAddr,
        via_relay: bool,
    ) -> Result<()> {
        if msg.typ.method != METHOD_BINDING {
            return Ok(());
        }

        // short-term credentials against the local password
        let integrity = MessageIntegrity::new_short_term_integrity(self.pwd.clone());
        if integrity.check(msg).is_err() {
            log::debug!("ice agent: dropping check with bad integrity from {src}");
            return Ok(());
        }

        // unknown source becomes a peer-reflexive remote candidate
        let known = {
            let remote = self.remote_candidates.lock().await;
            remote.iter().any(|c| c.addr == src)
        };
        if !known {
            self.add_remote_candidate(Candidate::new_peer_reflexive(
                "prflx".to_owned(),
                src,
            ))
            .await;
        }

        let use_candidate = msg.contains(ATTR_USE_CANDIDATE);
        if use_candidate && !self.is_controlling() {
            // the controlling side nominated this path; adopt it
            let local_typ = if via_relay {
                CandidateType::Relay
            } else {
                CandidateType::Host
            };
            let pair = {
                let pairs = self.pairs.lock().await;
                pairs
                    .iter()
                    .find(|p| p.pair.remote.addr == src && (p.pair.local.typ == local_typ || !via_relay))
                    .map(|p| p.pair.clone())
            };
            if let Some(pair) = pair {
                self.latch_selected(pair).await;
            }
        }

        let mut resp = Message::new();
        resp.build(&[
            Box::new(msg.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress::from(src)),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ])?;

        if via_relay {
            let relay = { self.relay.lock().await.clone() };
            if let Some(relay) = relay {
                relay.send_to(&resp.raw, src).await?;
            }
        } else {
            self.socket.send_to(&resp.raw, src).await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let client = { self.relay_client.lock().await.clone() };
        if let Some(client) = client {
            let _ = client.close().await;
        }
        let _ = self.socket.close().await;
        Ok(())
    }
}

/// PriorityAttr is the PRIORITY attribute on checks.
pub struct PriorityAttr(pub u32);

impl Setter for PriorityAttr {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        m.append(ATTR_PRIORITY, &self.0.to_be_bytes());
        Ok(())
    }
}

/// ControlAttr is ICE-CONTROLLING or ICE-CONTROLLED with the
/// tie-breaker payload.
pub struct ControlAttr {
    pub controlling: bool,
    pub tie_breaker: u64,
}

impl Setter for ControlAttr {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        let attr = if self.controlling {
            ATTR_ICE_CONTROLLING
        } else {
            ATTR_ICE_CONTROLLED
        };
        m.append(attr, &self.tie_breaker.to_be_bytes());
        Ok(())
    }
}

/// UseCandidateAttr is the flag-only USE-CANDIDATE attribute.
pub struct UseCandidateAttr;

impl Setter for UseCandidateAttr {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        m.append(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}

/// enumerate_local_addrs finds the default-route local address by
/// the connected-socket trick, skipping loopback and link-local.
/// Falls back to loopback so tests on an isolated host still work.
pub async fn enumerate_local_addrs() -> Vec<IpAddr> {
    let mut out = vec![];

    if let Ok(sock) = tokio::net::UdpSocket::bind("0.0.0.0:0").await {
        // connect() picks the route; no packet is sent
        if sock.connect("8.8.8.8:53").await.is_ok() {
            if let Ok(addr) = sock.local_addr() {
                let ip = addr.ip();
                let link_local = match ip {
                    IpAddr::V4(v4) => v4.is_link_local(),
                    IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
                };
                if !ip.is_loopback() && !link_local && !ip.is_unspecified() {
                    out.push(ip);
                }
            }
        }
    }

    if out.is_empty() {
        out.push(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    }

    out
}
