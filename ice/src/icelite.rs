use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use portable_atomic::AtomicBool;
use stun::attributes::ATTR_USE_CANDIDATE;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Duration, Instant};

use crate::candidate::Candidate;
use crate::{Error, Result};

/// No traffic for this long closes the lite session.
const FRESHNESS_TIMEOUT: Duration = Duration::from_secs(10);
const FRESHNESS_SWEEP: Duration = Duration::from_secs(5);

pub type OnLiteClosedHdlrFn = Box<dyn FnMut(Error) + Send + Sync>;

/// IceLite is the single-port responder half of ICE: it never sends
/// checks, it answers them. The first peer that shows up with a
/// USE-CANDIDATE (or, for old peers, any valid request) is latched;
/// traffic refreshes a freshness clock.
pub struct IceLite {
    pwd: String,
    remote_candidates: Mutex<Vec<Candidate>>,
    latched_tx: watch::Sender<Option<Candidate>>,
    latched_rx: watch::Receiver<Option<Candidate>>,
    last_traffic: Mutex<Instant>,
    on_closed: Mutex<Option<OnLiteClosedHdlrFn>>,
    closed: Arc<AtomicBool>,
    /// compat: latch on any valid request, not only USE-CANDIDATE
    latch_without_nomination: bool,
}

impl IceLite {
    pub fn new(pwd: String, latch_without_nomination: bool) -> Arc<Self> {
        let (latched_tx, latched_rx) = watch::channel(None);
        Arc::new(IceLite {
            pwd,
            remote_candidates: Mutex::new(vec![]),
            latched_tx,
            latched_rx,
            last_traffic: Mutex::new(Instant::now()),
            on_closed: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            latch_without_nomination,
        })
    }

    pub async fn on_closed(&self, f: OnLiteClosedHdlrFn) {
        let mut handler = self.on_closed.lock().await;
        *handler = Some(f);
    }

    /// add_remote_candidate records an SDP-carried candidate so the
    /// latched peer can be reported with its full attributes.
    pub async fn add_remote_candidate(&self, cand: Candidate) {
        let mut remote = self.remote_candidates.lock().await;
        if !remote.iter().any(|c| c.addr == cand.addr) {
            remote.push(cand);
        }
    }

    pub fn latched_watch(&self) -> watch::Receiver<Option<Candidate>> {
        self.latched_rx.clone()
    }

    pub fn latched_peer(&self) -> Option<Candidate> {
        self.latched_rx.borrow().clone()
    }

    /// start_freshness_timer arms the sweep that closes the session
    /// after FRESHNESS_TIMEOUT without any packet.
    pub fn start_freshness_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(FRESHNESS_SWEEP).await;
                if this.closed.load(Ordering::SeqCst) {
                    break;
                }

                let idle = {
                    let last = this.last_traffic.lock().await;
                    last.elapsed()
                };
                if idle > FRESHNESS_TIMEOUT {
                    log::info!(
                        "icelite: no packets for {}s, closing",
                        idle.as_secs()
                    );
                    this.closed.store(true, Ordering::SeqCst);
                    let mut handler = this.on_closed.lock().await;
                    if let Some(f) = handler.as_mut() {
                        f(Error::ErrFreshnessTimeout);
                    }
                    break;
                }
            }
        });
    }

    /// note_traffic refreshes the freshness clock; the owner calls it
    /// for every packet on the media socket, STUN or not.
    pub async fn note_traffic(&self) {
        let mut last = self.last_traffic.lock().await;
        *last = Instant::now();
    }

    /// handle_stun validates one Binding request against the local
    /// password and returns the reply bytes to send. Invalid requests
    /// yield None and are dropped.
    pub async fn handle_stun(&self, data: &[u8], src: SocketAddr) -> Result<Option<Vec<u8>>> {
        self.note_traffic().await;

        let mut msg = Message::new();
        msg.read_from(data)?;

        if msg.typ != BINDING_REQUEST {
            return Ok(None);
        }

        let integrity = MessageIntegrity::new_short_term_integrity(self.pwd.clone());
        if integrity.check(&msg).is_err() {
            log::debug!("icelite: bad integrity from {src}");
            return Ok(None);
        }

        let nominated = msg.contains(ATTR_USE_CANDIDATE);
        if nominated || self.latch_without_nomination {
            self.latch(src).await;
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

        Ok(Some(resp.raw))
    }

    async fn latch(&self, src: SocketAddr) {
        let known = {
            let remote = self.remote_candidates.lock().await;
            remote.iter().find(|c| c.addr == src).cloned()
        };
        let cand =
            known.unwrap_or_else(|| Candidate::new_peer_reflexive("prflx".to_owned(), src));

        self.latched_tx.send_if_modified(|current| {
            match current {
                Some(c) if c.addr == src => false,
                _ => {
                    log::info!("icelite: latched peer {}", cand);
                    *current = Some(cand.clone());
                    true
                }
            }
        });
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod icelite_test {
    use super::*;
    use stun::attributes::ATTR_USERNAME;
    use stun::textattrs::TextAttribute;

    fn check_request(pwd: &str, nominate: bool) -> Message {
        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(BINDING_REQUEST),
            Box::new(TextAttribute::new(ATTR_USERNAME, "lf:rf".to_owned())),
        ];
        if nominate {
            setters.push(Box::new(crate::agent::UseCandidateAttr));
        }
        setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
            pwd.to_owned(),
        )));
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&setters).unwrap();
        msg
    }

    #[tokio::test]
    async fn test_latches_on_use_candidate() {
        let lite = IceLite::new("pwd123".to_owned(), false);
        let src: SocketAddr = "198.51.100.7:2000".parse().unwrap();

        let msg = check_request("pwd123", true);
        let reply = lite.handle_stun(&msg.raw, src).await.unwrap();
        assert!(reply.is_some());

        let latched = lite.latched_peer().unwrap();
        assert_eq!(latched.addr, src);
    }

    #[tokio::test]
    async fn test_no_latch_without_nomination_in_strict_mode() {
        let lite = IceLite::new("pwd123".to_owned(), false);
        let src: SocketAddr = "198.51.100.7:2000".parse().unwrap();

        let msg = check_request("pwd123", false);
        let reply = lite.handle_stun(&msg.raw, src).await.unwrap();
        assert!(reply.is_some());
        assert!(lite.latched_peer().is_none());
    }

    #[tokio::test]
    async fn test_compat_mode_latches_any_request() {
        let lite = IceLite::new("pwd123".to_owned(), true);
        let src: SocketAddr = "198.51.100.7:2000".parse().unwrap();

        let msg = check_request("pwd123", false);
        lite.handle_stun(&msg.raw, src).await.unwrap();
        assert_eq!(lite.latched_peer().unwrap().addr, src);
    }

    #[tokio::test]
    async fn test_bad_password_dropped() {
        let lite = IceLite::new("pwd123".to_owned(), true);
        let src: SocketAddr = "198.51.100.7:2000".parse().unwrap();

        let msg = check_request("wrong", true);
        let reply = lite.handle_stun(&msg.raw, src).await.unwrap();
        assert!(reply.is_none());
        assert!(lite.latched_peer().is_none());
    }

    #[tokio::test]
    async fn test_known_candidate_latched_with_attributes() {
        let lite = IceLite::new("pwd123".to_owned(), true);
        let src: SocketAddr = "198.51.100.7:2000".parse().unwrap();

        let cand = Candidate::new_host("42".to_owned(), src, 100);
        lite.add_remote_candidate(cand.clone()).await;

        let msg = check_request("pwd123", true);
        lite.handle_stun(&msg.raw, src).await.unwrap();
        assert_eq!(lite.latched_peer().unwrap(), cand);
    }
}
