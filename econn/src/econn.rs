#[cfg(test)]
mod econn_test;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use portable_atomic::{AtomicU64, AtomicUsize};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::msg::{EconnMessage, MsgContent, MsgType};
use crate::props::Properties;
use crate::{Error, Result};

/// EconnState is the signaling state machine for one peer
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EconnState {
    Idle,
    PendingOutgoing,
    PendingIncoming,
    ConflictResolution,
    /// the call was answered
    Answered,
    /// the data channel came up
    DatachanEstablished,
    HangupSent,
    HangupRecv,
    UpdateSent,
    UpdateRecv,
    Terminating,
}

impl fmt::Display for EconnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EconnState::Idle => "Idle",
            EconnState::PendingOutgoing => "Pending-Outgoing",
            EconnState::PendingIncoming => "Pending-Incoming",
            EconnState::ConflictResolution => "Conflict-Resolution",
            EconnState::Answered => "Answered",
            EconnState::DatachanEstablished => "DatachanEstablished",
            EconnState::HangupSent => "HangupSent",
            EconnState::HangupRecv => "HangupRecv",
            EconnState::UpdateSent => "UpdateSent",
            EconnState::UpdateRecv => "UpdateRecv",
            EconnState::Terminating => "Terminating",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EconnDir {
    Unknown,
    Outgoing,
    Incoming,
}

impl fmt::Display for EconnDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EconnDir::Unknown => "Unknown",
            EconnDir::Outgoing => "Outgoing",
            EconnDir::Incoming => "Incoming",
        };
        write!(f, "{s}")
    }
}

/// EconnConfig carries the two timers: Tp bounds an outstanding
/// SETUP, Tt is the grace wait for HANGUP responses.
#[derive(Debug, Clone, Copy)]
pub struct EconnConfig {
    pub timeout_setup: Duration,
    pub timeout_term: Duration,
}

impl Default for EconnConfig {
    fn default() -> Self {
        EconnConfig {
            timeout_setup: Duration::from_secs(30),
            timeout_term: Duration::from_secs(5),
        }
    }
}

/// SignalingTransport delivers envelopes to the peer. The owner
/// routes SETUP/UPDATE/CANCEL via the host and HANGUP/PROPSYNC/ALERT
/// over the data channel.
#[async_trait]
pub trait SignalingTransport {
    async fn send(&self, msg: &EconnMessage) -> Result<()>;
}

type HdlrFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub type OnIncomingHdlrFn =
    Box<dyn (FnMut(u64, String, String, u64, String, Option<Properties>) -> HdlrFuture) + Send + Sync>;
pub type OnAnswerHdlrFn =
    Box<dyn (FnMut(bool, String, Option<Properties>) -> HdlrFuture) + Send + Sync>;
pub type OnUpdateReqHdlrFn =
    Box<dyn (FnMut(String, String, String, Option<Properties>, bool) -> HdlrFuture) + Send + Sync>;
pub type OnUpdateRespHdlrFn =
    Box<dyn (FnMut(String, Option<Properties>) -> HdlrFuture) + Send + Sync>;
pub type OnPropsyncHdlrFn = Box<dyn (FnMut(bool, Properties) -> HdlrFuture) + Send + Sync>;
pub type OnAlertHdlrFn = Box<dyn (FnMut(u32, String) -> HdlrFuture) + Send + Sync>;
pub type OnCloseHdlrFn = Box<dyn (FnMut(Option<Error>, u64) -> HdlrFuture) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_incoming: Option<OnIncomingHdlrFn>,
    on_answer: Option<OnAnswerHdlrFn>,
    on_update_req: Option<OnUpdateReqHdlrFn>,
    on_update_resp: Option<OnUpdateRespHdlrFn>,
    on_propsync: Option<OnPropsyncHdlrFn>,
    on_alert: Option<OnAlertHdlrFn>,
    on_close: Option<OnCloseHdlrFn>,
}

struct Inner {
    state: EconnState,
    dir: EconnDir,
    sessid_remote: String,
    userid_remote: String,
    clientid_remote: String,
    conflict: i8,
    err: Option<Error>,
}

/// iswinner resolves glare: the lexicographically larger
/// (user-id, client-id) tuple keeps its outgoing SETUP.
pub fn iswinner(
    userid_self: &str,
    clientid_self: &str,
    userid_remote: &str,
    clientid_remote: &str,
) -> bool {
    (userid_self, clientid_self) > (userid_remote, clientid_remote)
}

fn random_sessid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect()
}

const MESSAGE_TIME_UNKNOWN: u64 = 0;

/// Econn drives SETUP/CANCEL/UPDATE/HANGUP for one logical peer
/// connection, including glare resolution and the Tp/Tt timers.
pub struct Econn {
    userid_self: String,
    clientid_self: String,
    sessid_local: String,
    conf: EconnConfig,
    transport: Arc<dyn SignalingTransport + Send + Sync>,

    inner: Mutex<Inner>,
    handlers: Mutex<Handlers>,
    timer_gen: AtomicU64,

    dropped_session_mismatch: AtomicUsize,
    dropped_identity_mismatch: AtomicUsize,
}

impl Econn {
    pub fn new(
        conf: EconnConfig,
        userid_self: &str,
        clientid_self: &str,
        transport: Arc<dyn SignalingTransport + Send + Sync>,
    ) -> Result<Arc<Self>> {
        if userid_self.is_empty() || clientid_self.is_empty() {
            return Err(Error::ErrInvalidArg);
        }

        Ok(Arc::new(Econn {
            userid_self: userid_self.to_owned(),
            clientid_self: clientid_self.to_owned(),
            sessid_local: random_sessid(),
            conf,
            transport,
            inner: Mutex::new(Inner {
                state: EconnState::Idle,
                dir: EconnDir::Unknown,
                sessid_remote: String::new(),
                userid_remote: String::new(),
                clientid_remote: String::new(),
                conflict: 0,
                err: None,
            }),
            handlers: Mutex::new(Handlers::default()),
            timer_gen: AtomicU64::new(0),
            dropped_session_mismatch: AtomicUsize::new(0),
            dropped_identity_mismatch: AtomicUsize::new(0),
        }))
    }

    pub async fn on_incoming(&self, f: OnIncomingHdlrFn) {
        self.handlers.lock().await.on_incoming = Some(f);
    }

    pub async fn on_answer(&self, f: OnAnswerHdlrFn) {
        self.handlers.lock().await.on_answer = Some(f);
    }

    pub async fn on_update_req(&self, f: OnUpdateReqHdlrFn) {
        self.handlers.lock().await.on_update_req = Some(f);
    }

    pub async fn on_update_resp(&self, f: OnUpdateRespHdlrFn) {
        self.handlers.lock().await.on_update_resp = Some(f);
    }

    pub async fn on_propsync(&self, f: OnPropsyncHdlrFn) {
        self.handlers.lock().await.on_propsync = Some(f);
    }

    pub async fn on_alert(&self, f: OnAlertHdlrFn) {
        self.handlers.lock().await.on_alert = Some(f);
    }

    pub async fn on_close(&self, f: OnCloseHdlrFn) {
        self.handlers.lock().await.on_close = Some(f);
    }

    pub fn sessid_local(&self) -> &str {
        &self.sessid_local
    }

    pub async fn sessid_remote(&self) -> String {
        self.inner.lock().await.sessid_remote.clone()
    }

    pub async fn userid_remote(&self) -> String {
        self.inner.lock().await.userid_remote.clone()
    }

    pub async fn clientid_remote(&self) -> String {
        self.inner.lock().await.clientid_remote.clone()
    }

    pub async fn current_state(&self) -> EconnState {
        self.inner.lock().await.state
    }

    pub async fn current_dir(&self) -> EconnDir {
        self.inner.lock().await.dir
    }

    pub fn dropped_session_mismatch(&self) -> usize {
        self.dropped_session_mismatch.load(Ordering::Relaxed)
    }

    pub fn dropped_identity_mismatch(&self) -> usize {
        self.dropped_identity_mismatch.load(Ordering::Relaxed)
    }

    pub async fn set_error(&self, err: Error) {
        let mut inner = self.inner.lock().await;
        inner.err = Some(err);
    }

    async fn set_state(&self, next: EconnState) {
        let mut inner = self.inner.lock().await;
        log::info!(
            "econn({}): state {} -> {next}",
            self.sessid_local,
            inner.state
        );
        inner.state = next;
    }

    // --- timers -----------------------------------------------------

    fn start_timer(self: &Arc<Self>, d: Duration) {
        let gen = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            sleep(d).await;
            if this.timer_gen.load(Ordering::SeqCst) != gen {
                return;
            }
            let err = {
                let inner = this.inner.lock().await;
                if inner.state == EconnState::Terminating {
                    return;
                }
                inner.err.clone()
            };
            log::info!(
                "econn({}): local timer fired (state={})",
                this.sessid_local,
                this.current_state().await
            );
            this.close(Some(err.unwrap_or(Error::ErrTimeout)), MESSAGE_TIME_UNKNOWN)
                .await;
        });
    }

    fn start_deferred_close(self: &Arc<Self>, d: Duration) {
        let gen = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            sleep(d).await;
            if this.timer_gen.load(Ordering::SeqCst) != gen {
                return;
            }
            let err = { this.inner.lock().await.err.clone() };
            this.close(err, MESSAGE_TIME_UNKNOWN).await;
        });
    }

    fn cancel_timer(&self) {
        self.timer_gen.fetch_add(1, Ordering::SeqCst);
    }

    // --- sending ----------------------------------------------------

    fn outgoing(&self, content: MsgContent, resp: bool) -> EconnMessage {
        let mut msg = EconnMessage::new(&self.sessid_local, content);
        msg.resp = resp;
        msg.src_userid = self.userid_self.clone();
        msg.src_clientid = self.clientid_self.clone();
        msg
    }

    async fn transp_send(&self, msg: &EconnMessage) -> Result<()> {
        self.transport
            .send(msg)
            .await
            .map_err(|e| Error::ErrTransportFailed(e.to_string()))
    }

    async fn send_setup(
        &self,
        resp: bool,
        sdp: &str,
        props: Option<&Properties>,
        update: bool,
    ) -> Result<()> {
        let content = if update {
            MsgContent::Update {
                sdp: sdp.to_owned(),
                props: props.cloned(),
            }
        } else {
            MsgContent::Setup {
                sdp: sdp.to_owned(),
                props: props.cloned(),
            }
        };
        let msg = self.outgoing(content, resp);

        if let Err(err) = self.transp_send(&msg).await {
            log::warn!("econn({}): send_setup failed: {err}", self.sessid_local);
            {
                let mut inner = self.inner.lock().await;
                inner.err = Some(err.clone());
                inner.state = EconnState::Terminating;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn send_cancel(&self) -> Result<()> {
        let msg = self.outgoing(MsgContent::Cancel, false);
        self.transp_send(&msg).await
    }

    async fn send_hangup(&self, resp: bool) -> Result<()> {
        let msg = self.outgoing(MsgContent::Hangup, resp);
        self.transp_send(&msg).await
    }

    // --- public operations ------------------------------------------

    /// start begins a new outgoing call: SETUP request plus the Tp
    /// timer.
    pub async fn start(self: &Arc<Self>, sdp: &str, props: Option<&Properties>) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            match inner.state {
                EconnState::Idle | EconnState::PendingOutgoing => {}
                state => {
                    log::warn!("econn({}): start: invalid state '{state}'", self.sessid_local);
                    return Err(Error::ErrProtocol(format!("start in state {state}")));
                }
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner.state = EconnState::PendingOutgoing;
            inner.dir = EconnDir::Outgoing;
        }

        self.send_setup(false, sdp, props, false).await?;

        if self.conf.timeout_setup.is_zero() {
            log::warn!("econn({}): start: illegal timer value 0", self.sessid_local);
            return Err(Error::ErrProtocol("zero setup timeout".to_owned()));
        }
        self.start_timer(self.conf.timeout_setup);
        Ok(())
    }

    /// answer accepts an incoming call with a SETUP response.
    pub async fn answer(self: &Arc<Self>, sdp: &str, props: Option<&Properties>) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.state != EconnState::PendingIncoming
                && inner.state != EconnState::ConflictResolution
            {
                log::warn!(
                    "econn({}): cannot answer in state '{}'",
                    self.sessid_local,
                    inner.state
                );
                return Err(Error::ErrProtocol(format!(
                    "answer in state {}",
                    inner.state
                )));
            }
        }

        self.cancel_timer();
        self.send_setup(true, sdp, props, false).await?;
        self.set_state(EconnState::Answered).await;
        Ok(())
    }

    /// update_req starts a renegotiation from an established call.
    pub async fn update_req(self: &Arc<Self>, sdp: &str, props: Option<&Properties>) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            match inner.state {
                EconnState::Answered | EconnState::DatachanEstablished => {}
                state => {
                    return Err(Error::ErrProtocol(format!("update_req in state {state}")));
                }
            }
        }

        self.set_state(EconnState::UpdateSent).await;
        self.send_setup(false, sdp, props, true).await?;
        self.start_timer(self.conf.timeout_setup);
        Ok(())
    }

    /// update_resp answers a received UPDATE.
    pub async fn update_resp(
        self: &Arc<Self>,
        sdp: &str,
        props: Option<&Properties>,
    ) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.state != EconnState::UpdateRecv {
                log::warn!(
                    "econn({}): update_resp: wrong state '{}'",
                    self.sessid_local,
                    inner.state
                );
                return Err(Error::ErrProtocol(format!(
                    "update_resp in state {}",
                    inner.state
                )));
            }
        }

        self.cancel_timer();
        self.send_setup(true, sdp, props, true).await?;
        self.set_state(EconnState::Answered).await;
        Ok(())
    }

    /// end hangs up: CANCEL from pending states, the HANGUP exchange
    /// from an established call.
    pub async fn end(self: &Arc<Self>) {
        let state = self.current_state().await;
        log::info!("econn({}): end (state={state})", self.sessid_local);

        match state {
            EconnState::UpdateRecv | EconnState::PendingIncoming => {
                // ignore the incoming call
                self.set_state(EconnState::Terminating).await;
                self.start_deferred_close(Duration::from_millis(1));
            }

            EconnState::UpdateSent
            | EconnState::PendingOutgoing
            | EconnState::Answered
            | EconnState::ConflictResolution => {
                if let Err(err) = self.send_cancel().await {
                    log::warn!("econn({}): end: send_cancel failed: {err}", self.sessid_local);
                }
                self.set_state(EconnState::Terminating).await;
                self.start_deferred_close(Duration::from_millis(1));
            }

            EconnState::DatachanEstablished => match self.send_hangup(false).await {
                Ok(()) => {
                    self.set_state(EconnState::HangupSent).await;
                    self.start_timer_term();
                }
                Err(err) => {
                    log::warn!("econn({}): send_hangup failed: {err}", self.sessid_local);
                    self.set_error(err).await;
                    self.start_deferred_close(Duration::from_millis(1));
                }
            },

            EconnState::Terminating => {}

            state => {
                log::warn!("econn({}): cannot end in state '{state}'", self.sessid_local);
                self.set_state(EconnState::Terminating).await;
                self.start_timer_term();
            }
        }
    }

    fn start_timer_term(self: &Arc<Self>) {
        let gen = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        let d = self.conf.timeout_term;
        tokio::spawn(async move {
            sleep(d).await;
            if this.timer_gen.load(Ordering::SeqCst) != gen {
                return;
            }
            log::debug!("econn({}): timeout waiting for HANGUP(r)", this.sessid_local);
            let err = { this.inner.lock().await.err.clone() };
            this.close(err, MESSAGE_TIME_UNKNOWN).await;
        });
    }

    /// set_datachan_established moves Answered forward once the data
    /// channel opens.
    pub async fn set_datachan_established(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == EconnState::Answered {
            log::info!(
                "econn({}): state {} -> DatachanEstablished",
                self.sessid_local,
                inner.state
            );
            inner.state = EconnState::DatachanEstablished;
        } else {
            log::warn!(
                "econn({}): set_datachan_established: illegal state {}",
                self.sessid_local,
                inner.state
            );
        }
    }

    pub async fn can_send_propsync(&self) -> bool {
        self.inner.lock().await.state == EconnState::DatachanEstablished
    }

    /// send_propsync ships the current property bag; legal only with
    /// the data channel up. Re-sending identical properties causes no
    /// state transition on either side.
    pub async fn send_propsync(&self, resp: bool, props: &Properties) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.state != EconnState::DatachanEstablished {
                log::warn!(
                    "econn({}): send_propsync: wrong state '{}'",
                    self.sessid_local,
                    inner.state
                );
                return Err(Error::ErrProtocol(format!(
                    "propsync in state {}",
                    inner.state
                )));
            }
        }

        let msg = self.outgoing(
            MsgContent::Propsync {
                props: props.clone(),
            },
            resp,
        );
        self.transp_send(&msg).await
    }

    /// send_alert ships an ALERT request.
    pub async fn send_alert(&self, level: u32, descr: &str) -> Result<()> {
        let msg = self.outgoing(
            MsgContent::Alert {
                level,
                descr: descr.to_owned(),
            },
            false,
        );
        self.transp_send(&msg).await
    }

    // --- close ------------------------------------------------------

    /// close stops timers, sends CANCEL if a SETUP is still pending,
    /// and fires the close handler exactly once.
    pub async fn close(self: &Arc<Self>, err: Option<Error>, msg_time: u64) {
        match &err {
            Some(err) => {
                log::info!("econn({}): connection closed ({err})", self.sessid_local)
            }
            None => log::info!("econn({}): connection closed (normal)", self.sessid_local),
        }

        self.cancel_timer();

        let was_pending_outgoing = {
            let mut inner = self.inner.lock().await;
            let was = inner.state == EconnState::PendingOutgoing;
            if inner.err.is_none() {
                inner.err = err.clone();
            }
            inner.state = EconnState::Terminating;
            was
        };

        if was_pending_outgoing {
            let _ = self.send_cancel().await;
        }

        // handler invocation must come last, with all state settled
        let handler = { self.handlers.lock().await.on_close.take() };
        if let Some(mut f) = handler {
            f(err, msg_time).await;
        }
    }

    // --- receive ----------------------------------------------------

    /// recv_message dispatches one decoded envelope. The caller has
    /// already filtered messages from its own user.
    pub async fn recv_message(
        self: &Arc<Self>,
        userid_sender: &str,
        clientid_sender: &str,
        msg: &EconnMessage,
    ) {
        match msg.msg_type() {
            MsgType::Setup => self.recv_setup(userid_sender, clientid_sender, msg).await,
            MsgType::Update => self.recv_update(userid_sender, clientid_sender, msg).await,
            MsgType::Cancel => self.recv_cancel(clientid_sender, msg).await,
            MsgType::Hangup => self.recv_hangup(msg).await,
            MsgType::Propsync => self.recv_propsync(msg).await,
            MsgType::Alert => self.recv_alert(userid_sender, clientid_sender, msg).await,
            MsgType::Reject => {}
            other => {
                log::warn!(
                    "econn({}): recv: message not supported ({other})",
                    self.sessid_local
                );
            }
        }
    }

    /// latch_identity pins the remote (user, client) on first contact
    /// and drops anything from a different identity afterwards.
    async fn latch_identity(&self, userid_sender: &str, clientid_sender: &str) -> bool {
        let mut inner = self.inner.lock().await;

        if !inner.userid_remote.is_empty()
            && !inner.userid_remote.eq_ignore_ascii_case(userid_sender)
        {
            log::info!(
                "econn({}): remote UserID already set, dropping message",
                self.sessid_local
            );
            drop(inner);
            self.dropped_identity_mismatch.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if inner.userid_remote.is_empty() {
            inner.userid_remote = userid_sender.to_owned();
        }

        if !inner.clientid_remote.is_empty()
            && !inner.clientid_remote.eq_ignore_ascii_case(clientid_sender)
        {
            log::info!(
                "econn({}): remote ClientID already set, dropping message",
                self.sessid_local
            );
            drop(inner);
            self.dropped_identity_mismatch.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if inner.clientid_remote.is_empty() {
            inner.clientid_remote = clientid_sender.to_owned();
        }

        true
    }

    async fn session_matches(&self, msg: &EconnMessage) -> bool {
        let inner = self.inner.lock().await;
        let ok = inner
            .sessid_remote
            .eq_ignore_ascii_case(&msg.sessid_sender);
        if !ok {
            log::warn!(
                "econn({}): remote SESSIONID does not match ({} vs {})",
                self.sessid_local,
                inner.sessid_remote,
                msg.sessid_sender
            );
            drop(inner);
            self.dropped_session_mismatch.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    async fn recv_setup(
        self: &Arc<Self>,
        userid_sender: &str,
        clientid_sender: &str,
        msg: &EconnMessage,
    ) {
        if !self.latch_identity(userid_sender, clientid_sender).await {
            return;
        }

        let MsgContent::Setup { sdp, props } = &msg.content else {
            return;
        };

        if msg.is_request() {
            self.handle_setup_request(userid_sender, clientid_sender, msg, sdp, props.as_ref())
                .await;
        } else {
            self.handle_setup_response(msg, sdp, props.as_ref()).await;
        }
    }

    async fn handle_setup_request(
        self: &Arc<Self>,
        userid_sender: &str,
        clientid_sender: &str,
        msg: &EconnMessage,
        sdp: &str,
        props: Option<&Properties>,
    ) {
        let state = self.current_state().await;

        match state {
            EconnState::Idle => {}

            EconnState::PendingOutgoing => {
                let winner = iswinner(
                    &self.userid_self,
                    &self.clientid_self,
                    userid_sender,
                    clientid_sender,
                );
                log::info!(
                    "econn({}): setup conflict: is_winner={winner}",
                    self.sessid_local
                );

                {
                    let mut inner = self.inner.lock().await;
                    inner.sessid_remote = msg.sessid_sender.clone();
                    inner.conflict = if winner { 1 } else { -1 };
                }

                if winner {
                    // drop the remote offer; their answer to our
                    // SETUP is still on its way
                    return;
                }

                // loser: abandon our offer and answer theirs
                self.set_state(EconnState::ConflictResolution).await;

                let handler_sdp = sdp.to_owned();
                let handler_props = props.cloned();
                let mut handlers = self.handlers.lock().await;
                if let Some(f) = handlers.on_answer.as_mut() {
                    f(true, handler_sdp, handler_props).await;
                }
                return;
            }

            state => {
                // a stray SETUP with a foreign session id is
                // cross-talk from another call and counts as such
                let _ = self.session_matches(msg).await;
                log::warn!(
                    "econn({}): recv_setup: ignoring SETUP request in state '{state}'",
                    self.sessid_local
                );
                return;
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner.state = EconnState::PendingIncoming;
            inner.dir = EconnDir::Incoming;
            inner.sessid_remote = msg.sessid_sender.clone();
        }
        self.start_timer(self.conf.timeout_setup);

        let msg_time = msg.time;
        let age = msg.age;
        let handler_sdp = sdp.to_owned();
        let handler_props = props.cloned();
        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_incoming.as_mut() {
            f(
                msg_time,
                userid_sender.to_owned(),
                clientid_sender.to_owned(),
                age,
                handler_sdp,
                handler_props,
            )
            .await;
        }
    }

    async fn handle_setup_response(
        self: &Arc<Self>,
        msg: &EconnMessage,
        sdp: &str,
        props: Option<&Properties>,
    ) {
        {
            let inner = self.inner.lock().await;
            if inner.state != EconnState::PendingOutgoing
                && inner.state != EconnState::ConflictResolution
            {
                log::info!(
                    "econn({}): recv_setup: ignoring SETUP response in state '{}'",
                    self.sessid_local,
                    inner.state
                );
                return;
            }
        }

        self.cancel_timer();
        {
            let mut inner = self.inner.lock().await;
            inner.state = EconnState::Answered;
            inner.sessid_remote = msg.sessid_sender.clone();
        }

        let handler_sdp = sdp.to_owned();
        let handler_props = props.cloned();
        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_answer.as_mut() {
            f(false, handler_sdp, handler_props).await;
        }
    }

    async fn recv_update(
        self: &Arc<Self>,
        userid_sender: &str,
        clientid_sender: &str,
        msg: &EconnMessage,
    ) {
        if !self.session_matches(msg).await {
            return;
        }

        let MsgContent::Update { sdp, props } = &msg.content else {
            return;
        };

        // the update must come from the latched client
        {
            let inner = self.inner.lock().await;
            if !inner.clientid_remote.eq_ignore_ascii_case(clientid_sender) {
                log::warn!(
                    "econn({}): ignoring UPDATE from wrong client",
                    self.sessid_local
                );
                drop(inner);
                self.dropped_identity_mismatch.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if msg.is_request() {
            let state = self.current_state().await;
            let mut should_reset = false;

            match state {
                EconnState::Answered | EconnState::DatachanEstablished => {
                    self.set_state(EconnState::UpdateRecv).await;
                }
                EconnState::UpdateSent => {
                    let winner = iswinner(
                        &self.userid_self,
                        &self.clientid_self,
                        userid_sender,
                        clientid_sender,
                    );
                    log::info!(
                        "econn({}): update conflict: is_winner={winner}",
                        self.sessid_local
                    );
                    if winner {
                        // drop the remote update; ours stands
                        return;
                    }
                    self.set_state(EconnState::UpdateRecv).await;
                    should_reset = true;
                }
                state => {
                    log::warn!(
                        "econn({}): recv_update: ignoring UPDATE request in state '{state}'",
                        self.sessid_local
                    );
                    return;
                }
            }

            self.start_timer(self.conf.timeout_setup);

            let handler_sdp = sdp.to_owned();
            let handler_props = props.clone();
            let mut handlers = self.handlers.lock().await;
            if let Some(f) = handlers.on_update_req.as_mut() {
                f(
                    userid_sender.to_owned(),
                    clientid_sender.to_owned(),
                    handler_sdp,
                    handler_props,
                    should_reset,
                )
                .await;
            }
        } else {
            {
                let inner = self.inner.lock().await;
                if inner.state != EconnState::UpdateSent {
                    log::info!(
                        "econn({}): ignoring UPDATE response in state '{}'",
                        self.sessid_local,
                        inner.state
                    );
                    return;
                }
            }

            self.cancel_timer();
            self.set_state(EconnState::Answered).await;

            let handler_sdp = sdp.to_owned();
            let handler_props = props.clone();
            let mut handlers = self.handlers.lock().await;
            if let Some(f) = handlers.on_update_resp.as_mut() {
                f(handler_sdp, handler_props).await;
            }
        }
    }

    async fn recv_cancel(self: &Arc<Self>, clientid_sender: &str, msg: &EconnMessage) {
        {
            let inner = self.inner.lock().await;
            if !inner.clientid_remote.eq_ignore_ascii_case(clientid_sender) {
                log::info!(
                    "econn({}): recv_cancel: clientid does not match",
                    self.sessid_local
                );
                return;
            }
            match inner.state {
                EconnState::PendingIncoming
                | EconnState::Answered
                | EconnState::DatachanEstablished => {}
                state => {
                    log::info!(
                        "econn({}): recv_cancel: ignoring CANCEL in state '{state}'",
                        self.sessid_local
                    );
                    return;
                }
            }
        }

        if !self.session_matches(msg).await {
            return;
        }

        self.set_state(EconnState::Terminating).await;

        let err = {
            let inner = self.inner.lock().await;
            inner.err.clone()
        };
        self.close(Some(err.unwrap_or(Error::ErrCancelled)), msg.time)
            .await;
    }

    async fn recv_hangup(self: &Arc<Self>, msg: &EconnMessage) {
        if !self.session_matches(msg).await {
            return;
        }

        {
            let inner = self.inner.lock().await;
            match inner.state {
                EconnState::DatachanEstablished | EconnState::HangupSent => {}
                state => {
                    log::warn!(
                        "econn({}): ignoring HANGUP in state {state}",
                        self.sessid_local
                    );
                    return;
                }
            }
        }

        self.set_state(EconnState::HangupRecv).await;

        // a HANGUP request gets its response before teardown
        if msg.is_request() {
            if let Err(err) = self.send_hangup(true).await {
                log::warn!("econn({}): send_hangup failed: {err}", self.sessid_local);
            }
        }

        self.set_state(EconnState::Terminating).await;

        let err = { self.inner.lock().await.err.clone() };
        self.close(err, msg.time).await;
    }

    async fn recv_propsync(self: &Arc<Self>, msg: &EconnMessage) {
        if !self.session_matches(msg).await {
            return;
        }

        let MsgContent::Propsync { props } = &msg.content else {
            return;
        };

        let is_request = msg.is_request();
        let handler_props = props.clone();
        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_propsync.as_mut() {
            f(is_request, handler_props).await;
        }
    }

    async fn recv_alert(&self, userid_sender: &str, clientid_sender: &str, msg: &EconnMessage) {
        let MsgContent::Alert { level, descr } = &msg.content else {
            return;
        };

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_alert.as_mut() {
            f(*level, descr.clone()).await;
        } else {
            log::warn!(
                "econn({}): received ALERT from {userid_sender}.{clientid_sender} ({descr})",
                self.sessid_local
            );
        }
    }
}
