use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use portable_atomic::AtomicBool;
use tokio::sync::Mutex;
use tokio::time::Instant;

use econn::econn::iswinner;
use econn::{Econn, EconnConfig, EconnDir, EconnMessage, EconnState, MsgType, Properties};
use ice::agent::TurnServerConfig;
use mediaflow::{Mediaflow, MediaflowConfig};

use crate::stats::{self, CallTimeline};
use crate::{Error, Result};

/// EcallConfig seeds one call object.
pub struct EcallConfig {
    pub econn: EconnConfig,
    /// local_addrs empty means "enumerate the host".
    pub local_addrs: Vec<IpAddr>,
    pub stun_server: Option<SocketAddr>,
    pub turn_servers: Vec<TurnServerConfig>,
    pub enable_video: bool,
}

impl Default for EcallConfig {
    fn default() -> Self {
        EcallConfig {
            econn: EconnConfig::default(),
            local_addrs: vec![],
            stun_server: None,
            turn_servers: vec![],
            enable_video: false,
        }
    }
}

/// EcallTransport is the host's message delivery layer: it carries
/// encoded SETUP/UPDATE/CANCEL envelopes to the other endpoint of
/// the conversation.
#[async_trait]
pub trait EcallTransport {
    async fn send(&self, convid: &str, raw: &str) -> Result<()>;
}

type HdlrFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub type OnIncomingCallHdlrFn = Box<dyn (FnMut(String, bool) -> HdlrFuture) + Send + Sync>;
pub type OnMissedCallHdlrFn = Box<dyn (FnMut(u64, String, bool) -> HdlrFuture) + Send + Sync>;
pub type OnAnsweredHdlrFn = Box<dyn (FnMut() -> HdlrFuture) + Send + Sync>;
pub type OnMediaEstabHdlrFn = Box<dyn (FnMut() -> HdlrFuture) + Send + Sync>;
pub type OnAudioEstabHdlrFn = Box<dyn (FnMut() -> HdlrFuture) + Send + Sync>;
pub type OnDatachanEstabHdlrFn = Box<dyn (FnMut() -> HdlrFuture) + Send + Sync>;
pub type OnPropsyncHdlrFn = Box<dyn (FnMut(Properties) -> HdlrFuture) + Send + Sync>;
pub type OnCallClosedHdlrFn = Box<dyn (FnMut(i32, String) -> HdlrFuture) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_incoming: Option<OnIncomingCallHdlrFn>,
    on_missed: Option<OnMissedCallHdlrFn>,
    on_answered: Option<OnAnsweredHdlrFn>,
    on_media_estab: Option<OnMediaEstabHdlrFn>,
    on_audio_estab: Option<OnAudioEstabHdlrFn>,
    on_datachan_estab: Option<OnDatachanEstabHdlrFn>,
    on_propsync: Option<OnPropsyncHdlrFn>,
    on_closed: Option<OnCallClosedHdlrFn>,
}

/// AsyncSdp parks an offer or answer that has to wait for candidate
/// gathering; the gather-complete handler finishes the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsyncSdp {
    None,
    Offer,
    Answer,
    Complete,
}

struct Times {
    ts_started: Option<Instant>,
    ts_answered: Option<Instant>,
    ts_media: Option<Instant>,
    estab_time_ms: Option<u64>,
    audio_setup_time_ms: Option<u64>,
}

/// Ecall binds one Econn to one Mediaflow for a 1:1 conversation:
/// it owns the data channel routing, recreates the media transport
/// on UPDATE, and emits the call-level events.
pub struct Ecall {
    convid: String,
    userid_self: String,
    clientid_self: String,
    conf: EcallConfig,
    transport: Arc<dyn EcallTransport + Send + Sync>,

    econn: Mutex<Option<Arc<Econn>>>,
    mf: Mutex<Option<Arc<Mediaflow>>>,

    props_local: Mutex<Properties>,
    props_remote: Mutex<Option<Properties>>,
    remote_identity: Mutex<Option<(String, String)>>,
    turn_servers: Mutex<Vec<TurnServerConfig>>,

    sdp_async: Mutex<AsyncSdp>,
    update: AtomicBool,
    answered: AtomicBool,
    audio_seen: AtomicBool,
    closed: AtomicBool,

    pending_err: Mutex<Option<Error>>,
    times: Mutex<Times>,
    handlers: Mutex<Handlers>,
}

/// EconnTransportShim lets the Econn send through its owning Ecall
/// without a reference cycle.
struct EconnTransportShim {
    ecall: Weak<Ecall>,
}

#[async_trait]
impl econn::SignalingTransport for EconnTransportShim {
    async fn send(&self, msg: &EconnMessage) -> econn::Result<()> {
        let Some(ecall) = self.ecall.upgrade() else {
            return Err(econn::Error::ErrTransportFailed("call is gone".to_owned()));
        };
        ecall
            .route_econn_message(msg)
            .await
            .map_err(|e| econn::Error::ErrTransportFailed(e.to_string()))
    }
}

impl Ecall {
    pub fn new(
        conf: EcallConfig,
        convid: &str,
        userid_self: &str,
        clientid_self: &str,
        transport: Arc<dyn EcallTransport + Send + Sync>,
    ) -> Result<Arc<Self>> {
        if convid.is_empty() || userid_self.is_empty() || clientid_self.is_empty() {
            return Err(Error::ErrInvalidArg);
        }

        let mut props_local = Properties::new();
        props_local.add("videosend", "false");
        props_local.add("audiocbr", "false");

        let turn_servers = conf.turn_servers.clone();

        Ok(Arc::new(Ecall {
            convid: convid.to_owned(),
            userid_self: userid_self.to_owned(),
            clientid_self: clientid_self.to_owned(),
            conf,
            transport,
            econn: Mutex::new(None),
            mf: Mutex::new(None),
            props_local: Mutex::new(props_local),
            props_remote: Mutex::new(None),
            remote_identity: Mutex::new(None),
            turn_servers: Mutex::new(turn_servers),
            sdp_async: Mutex::new(AsyncSdp::None),
            update: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            audio_seen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pending_err: Mutex::new(None),
            times: Mutex::new(Times {
                ts_started: None,
                ts_answered: None,
                ts_media: None,
                estab_time_ms: None,
                audio_setup_time_ms: None,
            }),
            handlers: Mutex::new(Handlers::default()),
        }))
    }

    pub fn convid(&self) -> &str {
        &self.convid
    }

    pub async fn on_incoming(&self, f: OnIncomingCallHdlrFn) {
        self.handlers.lock().await.on_incoming = Some(f);
    }

    pub async fn on_missed(&self, f: OnMissedCallHdlrFn) {
        self.handlers.lock().await.on_missed = Some(f);
    }

    pub async fn on_answered(&self, f: OnAnsweredHdlrFn) {
        self.handlers.lock().await.on_answered = Some(f);
    }

    pub async fn on_media_estab(&self, f: OnMediaEstabHdlrFn) {
        self.handlers.lock().await.on_media_estab = Some(f);
    }

    pub async fn on_audio_estab(&self, f: OnAudioEstabHdlrFn) {
        self.handlers.lock().await.on_audio_estab = Some(f);
    }

    pub async fn on_datachan_estab(&self, f: OnDatachanEstabHdlrFn) {
        self.handlers.lock().await.on_datachan_estab = Some(f);
    }

    pub async fn on_propsync(&self, f: OnPropsyncHdlrFn) {
        self.handlers.lock().await.on_propsync = Some(f);
    }

    pub async fn on_closed(&self, f: OnCallClosedHdlrFn) {
        self.handlers.lock().await.on_closed = Some(f);
    }

    pub async fn state(&self) -> EconnState {
        let econn = self.econn.lock().await;
        match econn.as_ref() {
            Some(e) => e.current_state().await,
            None => EconnState::Idle,
        }
    }

    /// set_turn_server registers one more relay for the next
    /// mediaflow allocation; the host typically feeds these from its
    /// ice-server configuration messages.
    pub async fn set_turn_server(&self, server: TurnServerConfig) {
        let mut servers = self.turn_servers.lock().await;
        if !servers.iter().any(|s| s.addr == server.addr) {
            servers.push(server);
        }
    }

    pub async fn props_get_local(&self, key: &str) -> Option<String> {
        self.props_local.lock().await.get(key).map(str::to_owned)
    }

    pub async fn props_get_remote(&self, key: &str) -> Option<String> {
        let props = self.props_remote.lock().await;
        props.as_ref().and_then(|p| p.get(key)).map(str::to_owned)
    }

    // --- outbound routing -------------------------------------------

    /// route_econn_message carries the state machine's envelopes:
    /// backend for call setup, data channel for in-call messages.
    async fn route_econn_message(&self, msg: &EconnMessage) -> Result<()> {
        let raw = econn::msg::encode(msg).map_err(|e| Error::ErrProtocol(e.to_string()))?;

        match msg.msg_type() {
            MsgType::Setup | MsgType::Update | MsgType::Cancel => {
                log::debug!("ecall({}): SE -> {}", self.convid, msg.brief());
                self.transport.send(&self.convid, &raw).await
            }
            MsgType::Hangup | MsgType::Propsync | MsgType::Alert => {
                log::debug!("ecall({}): DataChan -> {}", self.convid, msg.brief());
                let mf = { self.mf.lock().await.clone() };
                let mf = mf.ok_or(Error::ErrTransportClosed)?;
                mf.datachan()
                    .send(raw.as_bytes())
                    .await
                    .map_err(Error::from)
            }
            other => Err(Error::ErrNotSupported(other.to_string())),
        }
    }

    // --- lifecycle --------------------------------------------------

    /// start places an outgoing call: offer (once gathered) plus
    /// SETUP.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let econn = self.econn.lock().await;
            if econn.is_some() {
                return Err(Error::ErrAlreadyExists);
            }
        }

        self.ensure_mediaflow().await?;
        self.create_econn().await?;

        {
            let mut times = self.times.lock().await;
            times.ts_started = Some(Instant::now());
        }

        if self.park_or_proceed(AsyncSdp::Offer).await? {
            self.offer_and_connect().await
        } else {
            log::info!("ecall({}): not gathered yet, parking offer", self.convid);
            Ok(())
        }
    }

    /// park_or_proceed decides under the sdp_async lock whether the
    /// caller can run its offer/answer now (true) or must wait for
    /// the gather handler to resume it (false). Taking the same lock
    /// the gather handler takes closes the completion race.
    async fn park_or_proceed(self: &Arc<Self>, wanted: AsyncSdp) -> Result<bool> {
        let mut sdp_async = self.sdp_async.lock().await;

        let gathered = {
            let mf = self.mf.lock().await;
            mf.as_ref().map(|m| m.is_gathered()).unwrap_or(false)
        };
        if gathered {
            return Ok(true);
        }

        match *sdp_async {
            AsyncSdp::None | AsyncSdp::Complete => {
                *sdp_async = wanted;
                Ok(false)
            }
            current if current == wanted => Ok(false),
            AsyncSdp::Offer if wanted == AsyncSdp::Answer => {
                // an incoming offer supersedes our parked one (glare)
                *sdp_async = AsyncSdp::Answer;
                Ok(false)
            }
            other => {
                log::warn!(
                    "ecall({}): async sdp busy ({other:?} vs {wanted:?})",
                    self.convid
                );
                Err(Error::ErrProtocol("async sdp busy".to_owned()))
            }
        }
    }

    /// answer accepts the incoming call, deferring until gathering
    /// finishes when necessary.
    pub async fn answer(self: &Arc<Self>) -> Result<()> {
        let state = self.state().await;
        if state != EconnState::PendingIncoming && state != EconnState::ConflictResolution {
            return Err(Error::ErrProtocol(format!("answer in state {state}")));
        }

        self.generate_or_gather_answer().await
    }

    /// end hangs the call up; the close handler reports the outcome.
    pub async fn end(self: &Arc<Self>) {
        log::info!("ecall({}): end", self.convid);
        let econn = { self.econn.lock().await.clone() };
        match econn {
            Some(econn) => econn.end().await,
            None => self.finalize_close(None).await,
        }
    }

    /// restart renegotiates the whole media transport from an
    /// established call (network handover).
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        let state = self.state().await;
        match state {
            EconnState::Answered | EconnState::DatachanEstablished => {}
            state => {
                log::warn!(
                    "ecall({}): restart: cannot restart in state '{state}'",
                    self.convid
                );
                return Err(Error::ErrProtocol(format!("restart in state {state}")));
            }
        }

        self.update.store(true, Ordering::SeqCst);

        // tear the old transport down and gather a fresh one
        {
            let old = { self.mf.lock().await.take() };
            if let Some(old) = old {
                old.close().await;
            }
        }
        self.ensure_mediaflow().await?;

        {
            let mut sdp_async = self.sdp_async.lock().await;
            *sdp_async = AsyncSdp::None;
        }

        if self.park_or_proceed(AsyncSdp::Offer).await? {
            self.offer_and_connect().await
        } else {
            Ok(())
        }
    }

    /// msg_recv injects one envelope the host delivered for this
    /// conversation. Clocks are whole seconds.
    pub async fn msg_recv(
        self: &Arc<Self>,
        curr_time: u64,
        msg_time: u64,
        userid_sender: &str,
        clientid_sender: &str,
        raw: &str,
    ) -> Result<()> {
        let msg = econn::msg::decode(raw, curr_time, msg_time)
            .map_err(|e| Error::ErrProtocol(e.to_string()))?;

        log::debug!("ecall({}): SE <- {}", self.convid, msg.brief());

        // messages from our own user: only a SETUP response matters,
        // it means another of our clients picked the call up
        if self.userid_self.eq_ignore_ascii_case(userid_sender) {
            if msg.msg_type() == MsgType::Setup && msg.resp {
                let econn = { self.econn.lock().await.clone() };
                if let Some(econn) = econn {
                    if econn.current_state().await == EconnState::PendingIncoming {
                        log::info!("ecall({}): answered on another device", self.convid);
                        econn
                            .close(Some(econn::Error::ErrAnsweredElsewhere), msg.time)
                            .await;
                    }
                }
            } else {
                log::info!(
                    "ecall({}): ignoring {} from own user",
                    self.convid,
                    msg.msg_type()
                );
            }
            return Ok(());
        }

        // a foreign SETUP request creates the econn lazily
        let needs_econn = {
            let econn = self.econn.lock().await;
            econn.is_none()
        };
        if needs_econn {
            let is_creator = msg.msg_type() == MsgType::Setup && msg.is_request();
            if !is_creator {
                log::info!(
                    "ecall({}): dropping {} without an active call",
                    self.convid,
                    msg.msg_type()
                );
                return Ok(());
            }
            self.create_econn().await?;
        }

        let econn = { self.econn.lock().await.clone() };
        if let Some(econn) = econn {
            econn
                .recv_message(userid_sender, clientid_sender, &msg)
                .await;
        }
        Ok(())
    }

    /// set_video_send_active flips the local `videosend` property and
    /// re-syncs it over the data channel when possible.
    pub async fn set_video_send_active(self: &Arc<Self>, active: bool) -> Result<()> {
        let state = crate::video_state::VideoSendState::parse(if active { "true" } else { "false" })?;
        {
            let mut props = self.props_local.lock().await;
            props.update("videosend", state.as_property());
        }
        self.propsync_request().await
    }

    /// propsync_request pushes the local property bag to the peer if
    /// the channel is up; a no-op otherwise.
    pub async fn propsync_request(self: &Arc<Self>) -> Result<()> {
        let econn = { self.econn.lock().await.clone() };
        let Some(econn) = econn else {
            return Ok(());
        };
        if !econn.can_send_propsync().await {
            return Ok(());
        }
        let props = { self.props_local.lock().await.clone() };
        econn
            .send_propsync(false, &props)
            .await
            .map_err(Error::from)
    }

    // --- internal plumbing ------------------------------------------

    async fn ensure_mediaflow(self: &Arc<Self>) -> Result<()> {
        {
            let mf = self.mf.lock().await;
            if mf.is_some() {
                return Ok(());
            }
        }

        let local_addrs = if self.conf.local_addrs.is_empty() {
            ice::agent::enumerate_local_addrs().await
        } else {
            self.conf.local_addrs.clone()
        };
        let turn_servers = { self.turn_servers.lock().await.clone() };

        let mf = Mediaflow::new(MediaflowConfig {
            local_addrs,
            stun_server: self.conf.stun_server,
            turn_servers,
            // refined by identity comparison before checks start
            is_controlling: true,
            enable_video: self.conf.enable_video,
        })
        .await?;

        let weak = Arc::downgrade(self);
        mf.on_gather_complete(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.gather_handler().await;
                }
            })
        }))
        .await;

        let weak = Arc::downgrade(self);
        mf.on_media_estab(Box::new(move |_crypto| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.media_estab_handler().await;
                }
            })
        }))
        .await;

        let weak = Arc::downgrade(self);
        mf.on_rtp(Box::new(move |_pkt| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.rtp_seen_handler().await;
                }
            })
        }))
        .await;

        let weak = Arc::downgrade(self);
        mf.on_close(Box::new(move |err| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.mf_close_handler(err).await;
                }
            })
        }))
        .await;

        let chan = mf.datachan();
        let weak = Arc::downgrade(self);
        chan.on_open(Box::new(move |_label| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.channel_estab_handler().await;
                }
            })
        }))
        .await;

        let weak = Arc::downgrade(self);
        chan.on_message(Box::new(move |data| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.channel_message_handler(data).await;
                }
            })
        }))
        .await;

        let weak = Arc::downgrade(self);
        chan.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.channel_closed_handler().await;
                }
            })
        }))
        .await;

        {
            let mut slot = self.mf.lock().await;
            *slot = Some(Arc::clone(&mf));
        }

        // gathering runs in the background; its completion resumes a
        // parked offer or answer
        let gather_mf = Arc::clone(&mf);
        tokio::spawn(async move {
            if let Err(err) = gather_mf.gather().await {
                log::warn!("ecall: gathering failed: {err}");
            }
        });

        Ok(())
    }

    async fn create_econn(self: &Arc<Self>) -> Result<()> {
        let shim = Arc::new(EconnTransportShim {
            ecall: Arc::downgrade(self),
        });
        let econn = Econn::new(
            self.conf.econn,
            &self.userid_self,
            &self.clientid_self,
            shim,
        )?;

        let weak = Arc::downgrade(self);
        econn
            .on_incoming(Box::new(move |msg_time, user, client, age, sdp, props| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(this) = weak.upgrade() {
                        this.econn_incoming_handler(msg_time, user, client, age, sdp, props)
                            .await;
                    }
                })
            }))
            .await;

        let weak = Arc::downgrade(self);
        econn
            .on_answer(Box::new(move |reset, sdp, props| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(this) = weak.upgrade() {
                        this.econn_answer_handler(reset, sdp, props).await;
                    }
                })
            }))
            .await;

        let weak = Arc::downgrade(self);
        econn
            .on_update_req(Box::new(move |user, client, sdp, props, should_reset| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(this) = weak.upgrade() {
                        this.econn_update_req_handler(user, client, sdp, props, should_reset)
                            .await;
                    }
                })
            }))
            .await;

        let weak = Arc::downgrade(self);
        econn
            .on_update_resp(Box::new(move |sdp, props| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(this) = weak.upgrade() {
                        this.econn_update_resp_handler(sdp, props).await;
                    }
                })
            }))
            .await;

        let weak = Arc::downgrade(self);
        econn
            .on_propsync(Box::new(move |is_request, props| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(this) = weak.upgrade() {
                        this.econn_propsync_handler(is_request, props).await;
                    }
                })
            }))
            .await;

        let weak = Arc::downgrade(self);
        econn
            .on_close(Box::new(move |err, _msg_time| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(this) = weak.upgrade() {
                        this.finalize_close(err).await;
                    }
                })
            }))
            .await;

        let mut slot = self.econn.lock().await;
        *slot = Some(econn);
        Ok(())
    }

    /// fail_from_handler defers the close so an econn callback frame
    /// never re-enters the state machine it was called from.
    fn fail_from_handler(self: &Arc<Self>, err: Error) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut pending = this.pending_err.lock().await;
                pending.get_or_insert(err);
            }
            let econn = { this.econn.lock().await.clone() };
            match econn {
                Some(econn) => {
                    econn
                        .close(Some(econn::Error::Other("media failure".to_owned())), 0)
                        .await
                }
                None => this.finalize_close(None).await,
            }
        });
    }

    async fn set_remote_identity(&self, user: &str, client: &str) {
        let mut identity = self.remote_identity.lock().await;
        if identity.is_none() {
            *identity = Some((user.to_owned(), client.to_owned()));
        }
    }

    async fn apply_controlling_role(&self) {
        let mut identity = { self.remote_identity.lock().await.clone() };

        // outgoing legs learn the remote identity from the state
        // machine's latch rather than from an incoming SETUP
        if identity.is_none() {
            let econn = { self.econn.lock().await.clone() };
            if let Some(econn) = econn {
                let user = econn.userid_remote().await;
                let client = econn.clientid_remote().await;
                if !user.is_empty() {
                    self.set_remote_identity(&user, &client).await;
                    identity = Some((user, client));
                }
            }
        }

        if let Some((user, client)) = identity {
            let controlling = iswinner(&self.userid_self, &self.clientid_self, &user, &client);
            let mf = { self.mf.lock().await.clone() };
            if let Some(mf) = mf {
                mf.set_controlling(controlling);
            }
        }
    }

    // --- econn events -----------------------------------------------

    async fn econn_incoming_handler(
        self: &Arc<Self>,
        msg_time: u64,
        user: String,
        client: String,
        age: u64,
        sdp: String,
        props: Option<Properties>,
    ) {
        self.set_remote_identity(&user, &client).await;

        if let Err(err) = self.ensure_mediaflow().await {
            self.fail_from_handler(err);
            return;
        }

        let mf = { self.mf.lock().await.clone() };
        let Some(mf) = mf else {
            return;
        };

        if let Err(err) = mf.handle_offer(&sdp).await {
            log::warn!("ecall({}): handle_offer failed: {err}", self.convid);
            self.fail_from_handler(err.into());
            return;
        }

        if !mf.has_data().await {
            log::warn!(
                "ecall({}): remote peer does not support data channels",
                self.convid
            );
            return;
        }

        {
            let mut remote = self.props_remote.lock().await;
            if remote.is_some() {
                log::warn!("ecall({}): remote props already set", self.convid);
            }
            *remote = props.clone();
        }

        let video_active = props
            .as_ref()
            .and_then(|p| p.get("videosend").map(|v| v == "true"))
            .unwrap_or(false);

        {
            let mut times = self.times.lock().await;
            times.ts_started = Some(Instant::now());
        }

        log::info!("ecall({}): incoming, message age {age}s", self.convid);

        // a stale SETUP is a missed call, not a ringing one
        let missed = age.saturating_mul(1000) > self.conf.econn.timeout_setup.as_millis() as u64;
        let mut handlers = self.handlers.lock().await;
        if missed {
            if let Some(f) = handlers.on_missed.as_mut() {
                f(msg_time, user, video_active).await;
            }
        } else if let Some(f) = handlers.on_incoming.as_mut() {
            f(user, video_active).await;
        }
    }

    async fn econn_answer_handler(
        self: &Arc<Self>,
        reset: bool,
        sdp: String,
        props: Option<Properties>,
    ) {
        log::info!("ecall({}): answered (reset={reset})", self.convid);

        {
            let mut times = self.times.lock().await;
            times.ts_answered = Some(Instant::now());
        }

        let mf = { self.mf.lock().await.clone() };
        let Some(mf) = mf else {
            return;
        };

        if reset {
            // glare loser path: our offer is void, theirs replaces it
            mf.sdpstate_reset().await;
            if let Err(err) = mf.handle_offer(&sdp).await {
                log::warn!("ecall({}): glare handle_offer failed: {err}", self.convid);
                self.fail_from_handler(err.into());
                return;
            }
            {
                let mut remote = self.props_remote.lock().await;
                *remote = props;
            }
            if let Err(err) = self.generate_or_gather_answer().await {
                self.fail_from_handler(err);
            }
            self.answered.store(true, Ordering::SeqCst);
            return;
        }

        if self.answered.swap(true, Ordering::SeqCst) {
            log::warn!("ecall({}): answer_handler: already connected", self.convid);
            return;
        }

        if let Err(err) = mf.handle_answer(&sdp).await {
            log::warn!("ecall({}): handle_answer failed: {err}", self.convid);
            self.fail_from_handler(err.into());
            return;
        }

        if !mf.has_data().await {
            log::warn!(
                "ecall({}): remote peer does not support data channels",
                self.convid
            );
            self.fail_from_handler(Error::ErrNotSupported("data channel".to_owned()));
            return;
        }

        self.apply_controlling_role().await;
        if let Err(err) = mf.start_ice().await {
            log::warn!("ecall({}): start_ice failed: {err}", self.convid);
            self.fail_from_handler(err.into());
            return;
        }

        {
            let mut remote = self.props_remote.lock().await;
            *remote = props;
        }

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_answered.as_mut() {
            f().await;
        }
    }

    async fn econn_update_req_handler(
        self: &Arc<Self>,
        user: String,
        client: String,
        sdp: String,
        props: Option<Properties>,
        _should_reset: bool,
    ) {
        self.update.store(true, Ordering::SeqCst);

        let stream_change = sdp.contains("x-streamchange");
        log::info!(
            "ecall({}): update request (streamchange={stream_change})",
            self.convid
        );

        let have_mf = { self.mf.lock().await.is_some() };
        if have_mf && stream_change {
            // media pipeline reset only; transport and gathering stay
            let mf = { self.mf.lock().await.clone() };
            if let Some(mf) = mf {
                mf.sdpstate_reset().await;
            }
        } else {
            let old = { self.mf.lock().await.take() };
            if let Some(old) = old {
                old.close().await;
            }
            if let Err(err) = self.ensure_mediaflow().await {
                self.fail_from_handler(err);
                return;
            }
        }

        let mf = { self.mf.lock().await.clone() };
        let Some(mf) = mf else {
            return;
        };

        if let Err(err) = mf.handle_offer(&sdp).await {
            log::warn!("ecall({}): update handle_offer failed: {err}", self.convid);
            self.fail_from_handler(err.into());
            return;
        }

        if !mf.has_data().await {
            log::warn!(
                "ecall({}): update without data channel support",
                self.convid
            );
            return;
        }

        {
            let mut remote = self.props_remote.lock().await;
            *remote = props;
        }
        let _ = (user, client);

        {
            let mut sdp_async = self.sdp_async.lock().await;
            *sdp_async = AsyncSdp::None;
        }

        if let Err(err) = self.generate_or_gather_answer().await {
            self.fail_from_handler(err);
        }
    }

    async fn econn_update_resp_handler(
        self: &Arc<Self>,
        sdp: String,
        props: Option<Properties>,
    ) {
        if !self.update.load(Ordering::SeqCst) {
            log::warn!(
                "ecall({}): UPDATE response without pending update",
                self.convid
            );
            return;
        }

        let mf = { self.mf.lock().await.clone() };
        let Some(mf) = mf else {
            return;
        };

        if let Err(err) = mf.handle_answer(&sdp).await {
            log::warn!("ecall({}): update handle_answer failed: {err}", self.convid);
            self.fail_from_handler(err.into());
            return;
        }

        {
            let mut remote = self.props_remote.lock().await;
            *remote = props;
        }

        self.apply_controlling_role().await;
        if let Err(err) = mf.start_ice().await {
            self.fail_from_handler(err.into());
        }
    }

    async fn econn_propsync_handler(self: &Arc<Self>, is_request: bool, props: Properties) {
        if is_request {
            let econn = { self.econn.lock().await.clone() };
            if let Some(econn) = econn {
                let local = { self.props_local.lock().await.clone() };
                if let Err(err) = econn.send_propsync(true, &local).await {
                    log::warn!("ecall({}): propsync response failed: {err}", self.convid);
                }
            }
        }

        {
            let mut remote = self.props_remote.lock().await;
            *remote = Some(props.clone());
        }

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_propsync.as_mut() {
            f(props).await;
        }
    }

    // --- offer/answer plumbing --------------------------------------

    async fn offer_and_connect(self: &Arc<Self>) -> Result<()> {
        let mf = { self.mf.lock().await.clone() };
        let mf = mf.ok_or(Error::ErrInternal("no mediaflow".to_owned()))?;

        let sdp = mf.generate_offer().await?;
        let props = { self.props_local.lock().await.clone() };

        let econn = { self.econn.lock().await.clone() };
        let econn = econn.ok_or(Error::ErrInternal("no econn".to_owned()))?;

        if self.update.load(Ordering::SeqCst) {
            econn.update_req(&sdp, Some(&props)).await?;
        } else {
            econn.start(&sdp, Some(&props)).await?;
        }
        Ok(())
    }

    async fn generate_or_gather_answer(self: &Arc<Self>) -> Result<()> {
        if self.park_or_proceed(AsyncSdp::Answer).await? {
            self.do_generate_answer().await
        } else {
            Ok(())
        }
    }

    async fn do_generate_answer(self: &Arc<Self>) -> Result<()> {
        let mf = { self.mf.lock().await.clone() };
        let mf = mf.ok_or(Error::ErrInternal("no mediaflow".to_owned()))?;

        let sdp = mf.generate_answer().await?;

        self.apply_controlling_role().await;
        mf.start_ice().await?;

        let props = { self.props_local.lock().await.clone() };
        let econn = { self.econn.lock().await.clone() };
        let econn = econn.ok_or(Error::ErrInternal("no econn".to_owned()))?;

        if self.update.load(Ordering::SeqCst) {
            econn.update_resp(&sdp, Some(&props)).await?;
            if mf.datachan().is_open() {
                econn.set_datachan_established().await;
            }
        } else {
            econn.answer(&sdp, Some(&props)).await?;
            self.answered.store(true, Ordering::SeqCst);
            let mut times = self.times.lock().await;
            times.ts_answered = Some(Instant::now());
        }
        Ok(())
    }

    // --- mediaflow events -------------------------------------------

    async fn gather_handler(self: &Arc<Self>) {
        let state = self.state().await;
        log::info!("ecall({}): gathering complete", self.convid);

        if state == EconnState::Terminating {
            return;
        }

        let pending = {
            let mut sdp_async = self.sdp_async.lock().await;
            let pending = *sdp_async;
            if pending == AsyncSdp::Offer || pending == AsyncSdp::Answer {
                *sdp_async = AsyncSdp::Complete;
            }
            pending
        };

        let result = match pending {
            AsyncSdp::Offer => self.offer_and_connect().await,
            AsyncSdp::Answer => self.do_generate_answer().await,
            _ => Ok(()),
        };

        if let Err(err) = result {
            log::warn!("ecall({}): deferred sdp failed: {err}", self.convid);
            self.fail_from_handler(err);
        }
    }

    async fn media_estab_handler(self: &Arc<Self>) {
        log::info!("ecall({}): media established", self.convid);

        {
            let mut times = self.times.lock().await;
            times.ts_media = Some(Instant::now());
            if times.estab_time_ms.is_none() {
                if let Some(answered) = times.ts_answered {
                    times.estab_time_ms = Some(answered.elapsed().as_millis() as u64);
                }
            }
        }

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_media_estab.as_mut() {
            f().await;
        }
    }

    async fn rtp_seen_handler(self: &Arc<Self>) {
        if self.audio_seen.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut times = self.times.lock().await;
            if times.audio_setup_time_ms.is_none() {
                if let Some(answered) = times.ts_answered {
                    times.audio_setup_time_ms = Some(answered.elapsed().as_millis() as u64);
                }
            }
        }

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_audio_estab.as_mut() {
            f().await;
        }
    }

    async fn channel_estab_handler(self: &Arc<Self>) {
        log::info!("ecall({}): data channel established", self.convid);

        let econn = { self.econn.lock().await.clone() };
        let Some(econn) = econn else {
            return;
        };

        econn.set_datachan_established().await;

        // sync the property bag as soon as the channel can carry it
        if econn.can_send_propsync().await {
            let props = { self.props_local.lock().await.clone() };
            if let Err(err) = econn.send_propsync(false, &props).await {
                log::warn!("ecall({}): propsync failed: {err}", self.convid);
            }
        }

        self.update.store(false, Ordering::SeqCst);

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_datachan_estab.as_mut() {
            f().await;
        }
    }

    async fn channel_message_handler(self: &Arc<Self>, data: Vec<u8>) {
        let raw = String::from_utf8_lossy(&data);
        let msg = match econn::msg::decode(&raw, 0, 0) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!(
                    "ecall({}): failed to decode channel message: {err}",
                    self.convid
                );
                return;
            }
        };

        log::debug!("ecall({}): DataChan <- {}", self.convid, msg.brief());

        let econn = { self.econn.lock().await.clone() };
        let Some(econn) = econn else {
            return;
        };

        // HANGUP, PROPSYNC and ALERT all route through the state
        // machine under the latched remote identity
        let user = econn.userid_remote().await;
        let client = econn.clientid_remote().await;
        econn.recv_message(&user, &client, &msg).await;
    }

    async fn channel_closed_handler(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        // during a hangup exchange the peer tearing the channel down
        // first is the expected ending, not a failure
        let state = self.state().await;
        match state {
            EconnState::HangupSent | EconnState::HangupRecv | EconnState::Terminating => {
                let econn = { self.econn.lock().await.clone() };
                if let Some(econn) = econn {
                    econn.close(None, 0).await;
                } else {
                    self.finalize_close(None).await;
                }
            }
            _ => {
                log::warn!("ecall({}): data channel closed", self.convid);
                self.fail_from_handler(Error::ErrTransportClosed);
            }
        }
    }

    async fn mf_close_handler(self: &Arc<Self>, err: Arc<mediaflow::Error>) {
        log::info!("ecall({}): mediaflow closed ({err})", self.convid);

        let mapped = match &*err {
            mediaflow::Error::ErrAuthentication => Error::ErrAuthentication,
            mediaflow::Error::ErrTransportClosed => Error::ErrTransportClosed,
            mediaflow::Error::Dtls(dtls::Error::ErrHandshakeTimeout) => Error::ErrTimeout,
            mediaflow::Error::Ice(ice::Error::ErrConsentExpired) => Error::ErrTimeout,
            other => Error::ErrProtocol(other.to_string()),
        };
        self.fail_from_handler(mapped);
    }

    // --- close ------------------------------------------------------

    async fn finalize_close(self: &Arc<Self>, econn_err: Option<econn::Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let code = {
            let pending = self.pending_err.lock().await;
            match (&*pending, &econn_err) {
                (Some(err), _) => err.code(),
                (None, Some(err)) => Error::from(err.clone()).code(),
                (None, None) => 0,
            }
        };

        let dir = {
            let econn = self.econn.lock().await;
            match econn.as_ref() {
                Some(e) => e.current_dir().await,
                None => EconnDir::Unknown,
            }
        };

        let mf = { self.mf.lock().await.take() };
        let mf_stats = match &mf {
            Some(mf) => Some(mf.stats().await),
            None => None,
        };

        let timeline = {
            let times = self.times.lock().await;
            CallTimeline {
                answered: self.answered.load(Ordering::SeqCst),
                estab_time_ms: times.estab_time_ms,
                audio_setup_time_ms: times.audio_setup_time_ms,
                media_time_ms: times.ts_media.map(|t| t.elapsed().as_millis() as u64),
            }
        };

        let has_video = mf_stats.is_some() && self.conf.enable_video;
        let metrics = stats::prepare(dir, &timeline, mf_stats.as_ref(), has_video, code);

        if let Some(mf) = mf {
            mf.close().await;
        }

        log::info!("ecall({}): closed (error={code})", self.convid);

        let handler = { self.handlers.lock().await.on_closed.take() };
        if let Some(mut f) = handler {
            f(code, metrics).await;
        }
    }
}
