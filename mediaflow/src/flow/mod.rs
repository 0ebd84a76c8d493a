
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use ice::agent::{Agent, AgentConfig, SendPath, TurnServerConfig};
use ice::candidate::{Candidate, CandidateType};
use ice::consent::Consent;
use ice::rand_creds::{generate_pwd, generate_ufrag};
use portable_atomic::{AtomicBool, AtomicU64};
use rand::Rng;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use turn::proto::SEND_INDICATION_OVERHEAD;
use util::{Conn, UdpConn};

use crate::codec::{Codec, CodecKind};
use crate::datachan::DataChannel;
use crate::demux::{classify, PacketKind};
use crate::rtp_stats::{parse_remb, ReceiverReport, RtpStats, SenderReport};
use crate::sdp::{Fingerprint, MediaSection, SessionDescription, Setup};
use crate::{Error, Result};

const DATA_CHANNEL_LABEL: &str = "calling-3";
const SCTP_PORT: u16 = 5000;

/// Offer/answer gate: the only legal walks are
/// Idle -> GatheredOffer -> Done and Idle -> HandledOffer -> Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SdpState {
    Idle,
    GatheredOffer,
    HandledOffer,
    Done,
}

/// MediaflowConfig seeds one flow. `is_controlling` encodes the
/// caller's identity-comparison result; it is not negotiated.
pub struct MediaflowConfig {
    pub local_addrs: Vec<IpAddr>,
    pub stun_server: Option<SocketAddr>,
    pub turn_servers: Vec<TurnServerConfig>,
    pub is_controlling: bool,
    pub enable_video: bool,
}

/// MediaflowStats is the snapshot the close metrics read.
#[derive(Debug, Clone, Default)]
pub struct MediaflowStats {
    pub ice_ready: bool,
    pub crypto_ready: bool,
    pub crypto_name: String,
    pub local_cand: String,
    pub remote_cand: String,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub avg_rtt_ms: u64,
    pub max_rtt_ms: u64,
    pub avg_loss_up: u64,
    pub avg_loss_down: u64,
    pub srtp_errors: u64,
    pub srtp_dropped: u64,
    pub turn_alloc_ms: Option<u64>,
    pub nat_estab_ms: Option<u64>,
    pub dtls_estab_ms: Option<u64>,
}

type HdlrFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub type OnGatherCompleteHdlrFn = Box<dyn (FnMut() -> HdlrFuture) + Send + Sync>;
pub type OnMediaEstabHdlrFn = Box<dyn (FnMut(String) -> HdlrFuture) + Send + Sync>;
pub type OnRtpHdlrFn = Box<dyn (FnMut(Vec<u8>) -> HdlrFuture) + Send + Sync>;
pub type OnFlowCloseHdlrFn = Box<dyn (FnMut(Arc<Error>) -> HdlrFuture) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_gather_complete: Option<OnGatherCompleteHdlrFn>,
    on_media_estab: Option<OnMediaEstabHdlrFn>,
    on_rtp: Option<OnRtpHdlrFn>,
    on_close: Option<OnFlowCloseHdlrFn>,
}

struct SdpInner {
    state: SdpState,
    sdp_offerer: bool,
    got_sdp: bool,
    sent_sdp: bool,
    local_setup: Setup,
    remote_setup: Setup,
    remote_fingerprint: Option<Fingerprint>,
    remote_mid_audio: String,
    remote_has_data: bool,
    remote_has_video: bool,
}

struct Timeline {
    created: Instant,
    ice_estab: Option<Instant>,
    dtls_estab: Option<Instant>,
}

/// Mediaflow owns the call's UDP socket (through its ICE agent),
/// demultiplexes everything arriving on it, and runs SDP, DTLS-SRTP
/// and the data channel for exactly one call.
pub struct Mediaflow {
    agent: Arc<Agent>,
    certificate: Mutex<Option<dtls::Certificate>>,
    local_fingerprint: String,
    lssrc_audio: u32,
    lssrc_video: u32,
    lssrc_video_rtx: u32,
    cname: String,
    enable_video: bool,
    codecs: Vec<Codec>,

    sdp: Mutex<SdpInner>,
    dtls_conn: Mutex<Option<Arc<dtls::DtlsConn>>>,
    srtp_tx: Mutex<Option<srtp::Context>>,
    srtp_rx: Mutex<Option<srtp::Context>>,
    consent: Mutex<Option<Consent>>,
    datachan: Arc<DataChannel>,

    // DTLS records flow to the handshake through this channel
    dtls_rx_slot: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    dtls_tx: mpsc::Sender<Vec<u8>>,

    ice_ready: AtomicBool,
    crypto_ready: AtomicBool,
    crypto_verified: AtomicBool,
    closed: AtomicBool,

    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,

    stats: Mutex<RtpStats>,
    n_srtp_error: AtomicU64,
    n_srtp_dropped: AtomicU64,
    timeline: Mutex<Timeline>,

    handlers: Mutex<Handlers>,
}

impl Mediaflow {
    /// new binds the media socket and prepares the agent; nothing is
    /// sent until gather() and start_ice().
    pub async fn new(config: MediaflowConfig) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpConn::bind("0.0.0.0:0".parse().unwrap()).await?);

        let agent = Agent::new(
            AgentConfig {
                ufrag: generate_ufrag(),
                pwd: generate_pwd(),
                is_controlling: config.is_controlling,
                stun_server: config.stun_server,
                turn_servers: config.turn_servers,
                local_addrs: config.local_addrs,
            },
            socket,
        );
        agent.start();

        let certificate = dtls::Certificate::generate_self_signed()?;
        let local_fingerprint = certificate.sha256_fingerprint();

        let mut codecs = vec![Codec::opus()];
        if config.enable_video {
            codecs.push(Codec::vp8());
        }

        // keep the rng out of scope before the awaits below
        let (lssrc_audio, lssrc_video, lssrc_video_rtx, cname) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen(),
                rng.gen(),
                rng.gen(),
                format!("{:08x}", rng.gen::<u32>()),
            )
        };
        let (dtls_tx, dtls_rx) = mpsc::channel(256);
        let (ready_tx, ready_rx) = watch::channel(false);

        let flow = Arc::new(Mediaflow {
            agent,
            certificate: Mutex::new(Some(certificate)),
            local_fingerprint,
            lssrc_audio,
            lssrc_video,
            lssrc_video_rtx,
            cname,
            enable_video: config.enable_video,
            codecs,
            sdp: Mutex::new(SdpInner {
                state: SdpState::Idle,
                sdp_offerer: false,
                got_sdp: false,
                sent_sdp: false,
                local_setup: Setup::ActPass,
                remote_setup: Setup::ActPass,
                remote_fingerprint: None,
                remote_mid_audio: "audio".to_owned(),
                remote_has_data: false,
                remote_has_video: false,
            }),
            dtls_conn: Mutex::new(None),
            srtp_tx: Mutex::new(None),
            srtp_rx: Mutex::new(None),
            consent: Mutex::new(None),
            datachan: DataChannel::new(DATA_CHANNEL_LABEL),
            dtls_rx_slot: Mutex::new(Some(dtls_rx)),
            dtls_tx,
            ice_ready: AtomicBool::new(false),
            crypto_ready: AtomicBool::new(false),
            crypto_verified: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ready_tx,
            ready_rx,
            stats: Mutex::new(RtpStats::new()),
            n_srtp_error: AtomicU64::new(0),
            n_srtp_dropped: AtomicU64::new(0),
            timeline: Mutex::new(Timeline {
                created: Instant::now(),
                ice_estab: None,
                dtls_estab: None,
            }),
            handlers: Mutex::new(Handlers::default()),
        });

        flow.spawn_demux_pump().await;
        Ok(flow)
    }

    pub async fn on_gather_complete(&self, f: OnGatherCompleteHdlrFn) {
        self.handlers.lock().await.on_gather_complete = Some(f);
    }

    pub async fn on_media_estab(&self, f: OnMediaEstabHdlrFn) {
        self.handlers.lock().await.on_media_estab = Some(f);
    }

    pub async fn on_rtp(&self, f: OnRtpHdlrFn) {
        self.handlers.lock().await.on_rtp = Some(f);
    }

    pub async fn on_close(&self, f: OnFlowCloseHdlrFn) {
        self.handlers.lock().await.on_close = Some(f);
    }

    pub fn datachan(&self) -> Arc<DataChannel> {
        Arc::clone(&self.datachan)
    }

    pub fn local_fingerprint(&self) -> &str {
        &self.local_fingerprint
    }

    pub fn audio_ssrc(&self) -> u32 {
        self.lssrc_audio
    }

    // --- gathering --------------------------------------------------

    /// gather collects host, reflexive and relayed candidates; the
    /// completion handler fires exactly once even if called again.
    pub async fn gather(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.agent
            .on_gathering_complete(Box::new(move || {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    let mut handlers = this.handlers.lock().await;
                    if let Some(f) = handlers.on_gather_complete.as_mut() {
                        f().await;
                    }
                })
            }))
            .await;

        self.agent.gather().await?;
        Ok(())
    }

    pub fn is_gathered(&self) -> bool {
        self.agent.is_gathered()
    }

    /// set_controlling feeds the identity-comparison result into the
    /// agent before checks start.
    pub fn set_controlling(&self, controlling: bool) {
        self.agent.set_controlling(controlling);
    }

    // --- SDP --------------------------------------------------------

    async fn build_local_sdp(&self, offer: bool) -> String {
        let local_cands = self.agent.local_candidates().await;
        let addr = local_cands
            .first()
            .map(|c| c.addr.ip())
            .unwrap_or_else(|| "127.0.0.1".parse().unwrap());
        let port = local_cands.first().map(|c| c.addr.port()).unwrap_or(9);

        let (local_setup, mid_audio) = {
            let inner = self.sdp.lock().await;
            (inner.local_setup, inner.remote_mid_audio.clone())
        };

        let mut sdp = SessionDescription::new(addr, rand::thread_rng().gen::<u32>() as u64);
        sdp.add_session_attr(if offer { "x-OFFER" } else { "x-ANSWER" }, None);
        sdp.add_session_attr("ice-options", Some("trickle"));
        sdp.add_session_attr("ice-ufrag", Some(self.agent.local_ufrag()));
        sdp.add_session_attr("ice-pwd", Some(self.agent.local_pwd()));
        sdp.add_session_attr(
            "fingerprint",
            Some(&format!("sha-256 {}", self.local_fingerprint)),
        );
        sdp.add_session_attr("setup", Some(local_setup.name()));

        // audio
        let audio_codecs: Vec<&Codec> = self
            .codecs
            .iter()
            .filter(|c| c.kind == CodecKind::Audio)
            .collect();
        let mut audio = MediaSection::new("audio", port, "UDP/TLS/RTP/SAVPF");
        audio.formats = audio_codecs
            .iter()
            .map(|c| c.payload_type.to_string())
            .collect();
        audio.connection = Some(format!(
            "IN {} {addr}",
            if addr.is_ipv4() { "IP4" } else { "IP6" }
        ));
        for codec in &audio_codecs {
            audio.add_attr(
                "rtpmap",
                Some(&format!("{} {}", codec.payload_type, codec.rtpmap())),
            );
            if let Some(fmtp) = &codec.fmtp {
                audio.add_attr("fmtp", Some(&format!("{} {fmtp}", codec.payload_type)));
            }
        }
        audio.add_attr("mid", Some(&mid_audio));
        audio.add_attr("rtcp-mux", None);
        audio.add_attr(
            "ssrc",
            Some(&format!("{} cname:{}", self.lssrc_audio, self.cname)),
        );
        for cand in &local_cands {
            audio.add_attr("candidate", Some(&cand.to_attribute()));
        }
        audio.add_attr("sendrecv", None);
        sdp.media.push(audio);

        // video, when enabled
        if self.enable_video {
            let video_codecs: Vec<&Codec> = self
                .codecs
                .iter()
                .filter(|c| c.kind == CodecKind::Video)
                .collect();
            let mut video = MediaSection::new("video", port, "UDP/TLS/RTP/SAVPF");
            video.formats = video_codecs
                .iter()
                .map(|c| c.payload_type.to_string())
                .collect();
            for codec in &video_codecs {
                video.add_attr(
                    "rtpmap",
                    Some(&format!("{} {}", codec.payload_type, codec.rtpmap())),
                );
            }
            video.add_attr("mid", Some("video"));
            video.add_attr("rtcp-mux", None);
            video.add_attr(
                "ssrc-group",
                Some(&format!(
                    "FID {} {}",
                    self.lssrc_video, self.lssrc_video_rtx
                )),
            );
            video.add_attr(
                "ssrc",
                Some(&format!("{} cname:{}", self.lssrc_video, self.cname)),
            );
            video.add_attr("sendrecv", None);
            sdp.media.push(video);
        }

        // data channel
        let mut data = MediaSection::new("application", port, "UDP/DTLS/SCTP");
        data.formats = vec!["webrtc-datachannel".to_owned()];
        data.add_attr("mid", Some("data"));
        data.add_attr("sctp-port", Some(&SCTP_PORT.to_string()));
        sdp.media.push(data);

        sdp.to_string()
    }

    /// generate_offer renders the local offer; only legal from Idle.
    pub async fn generate_offer(&self) -> Result<String> {
        {
            let mut inner = self.sdp.lock().await;
            if inner.state != SdpState::Idle {
                return Err(Error::ErrSdpState(format!(
                    "generate_offer in {:?}",
                    inner.state
                )));
            }
            inner.state = SdpState::GatheredOffer;
            inner.sdp_offerer = true;
            inner.local_setup = Setup::ActPass;
            inner.sent_sdp = true;
        }
        Ok(self.build_local_sdp(true).await)
    }

    fn apply_remote_description(
        inner: &mut SdpInner,
        sdp: &SessionDescription,
        audio: &MediaSection,
    ) -> Result<(String, String, Vec<Candidate>, bool)> {
        let ufrag = sdp
            .session_or_media_attr(audio, "ice-ufrag")
            .ok_or_else(|| Error::ErrProtocol("no ice-ufrag".to_owned()))?
            .to_owned();
        let pwd = sdp
            .session_or_media_attr(audio, "ice-pwd")
            .ok_or_else(|| Error::ErrProtocol("no ice-pwd".to_owned()))?
            .to_owned();

        if !audio.has_attr("rtcp-mux") && !sdp.has_session_attr("rtcp-mux") {
            return Err(Error::ErrProtocol("no rtcp-mux".to_owned()));
        }

        let fingerprint = sdp
            .session_or_media_attr(audio, "fingerprint")
            .ok_or_else(|| Error::ErrProtocol("no fingerprint".to_owned()))?;
        let fingerprint = Fingerprint::parse(fingerprint)?;
        match fingerprint.hash.as_str() {
            "sha-256" | "sha-1" => {}
            other => {
                return Err(Error::ErrNotSupported(format!(
                    "fingerprint hash '{other}'"
                )))
            }
        }
        inner.remote_fingerprint = Some(fingerprint);

        if let Some(setup) = sdp.session_or_media_attr(audio, "setup") {
            inner.remote_setup = Setup::parse(setup)?;
        }
        if let Some(mid) = audio.attr("mid") {
            inner.remote_mid_audio = mid.to_owned();
        }
        inner.remote_has_data = sdp.media("application").is_some();
        inner.remote_has_video = sdp.media("video").is_some();

        let mut candidates = vec![];
        for m in &sdp.media {
            for attr in m.all_attrs("candidate") {
                match Candidate::parse_attribute(attr) {
                    Ok(cand) => candidates.push(cand),
                    Err(err) => log::debug!("mediaflow: skipping candidate: {err}"),
                }
            }
        }

        let remote_lite = sdp.has_session_attr("ice-lite");
        Ok((ufrag, pwd, candidates, remote_lite))
    }

    /// handle_offer ingests the remote offer; only legal from Idle.
    pub async fn handle_offer(&self, raw: &str) -> Result<()> {
        let sdp = SessionDescription::parse(raw)?;
        let audio = sdp
            .media("audio")
            .ok_or_else(|| Error::ErrProtocol("offer without audio".to_owned()))?;

        let (ufrag, pwd, candidates, remote_lite) = {
            let mut inner = self.sdp.lock().await;
            if inner.state != SdpState::Idle {
                return Err(Error::ErrSdpState(format!(
                    "handle_offer in {:?}",
                    inner.state
                )));
            }
            inner.state = SdpState::HandledOffer;
            inner.sdp_offerer = false;
            inner.got_sdp = true;

            let out = Self::apply_remote_description(&mut inner, &sdp, audio)?;

            // the offer said actpass; we take active and initiate
            inner.local_setup = Setup::Active;
            out
        };

        self.agent.set_remote_credentials(ufrag, pwd).await;
        self.agent.set_remote_lite(remote_lite);
        for cand in candidates {
            self.agent.add_remote_candidate(cand).await;
        }

        self.verify_fingerprint_if_possible().await?;
        Ok(())
    }

    /// generate_answer renders the answer; only legal after
    /// handle_offer.
    pub async fn generate_answer(&self) -> Result<String> {
        {
            let mut inner = self.sdp.lock().await;
            if inner.state != SdpState::HandledOffer {
                return Err(Error::ErrSdpState(format!(
                    "generate_answer in {:?}",
                    inner.state
                )));
            }
            inner.state = SdpState::Done;
            inner.sent_sdp = true;
        }
        Ok(self.build_local_sdp(false).await)
    }

    /// handle_answer ingests the remote answer; only legal after
    /// generate_offer.
    pub async fn handle_answer(&self, raw: &str) -> Result<()> {
        let sdp = SessionDescription::parse(raw)?;
        let audio = sdp
            .media("audio")
            .ok_or_else(|| Error::ErrProtocol("answer without audio".to_owned()))?;

        let (ufrag, pwd, candidates, remote_lite) = {
            let mut inner = self.sdp.lock().await;
            if inner.state != SdpState::GatheredOffer {
                return Err(Error::ErrSdpState(format!(
                    "handle_answer in {:?}",
                    inner.state
                )));
            }
            inner.state = SdpState::Done;
            inner.got_sdp = true;

            let out = Self::apply_remote_description(&mut inner, &sdp, audio)?;

            // our role is the complement of the answer's choice
            inner.local_setup = match inner.remote_setup {
                Setup::Active => Setup::Passive,
                Setup::Passive => Setup::Active,
                Setup::ActPass => {
                    return Err(Error::ErrProtocol("answer with setup:actpass".to_owned()))
                }
            };
            out
        };

        self.agent.set_remote_credentials(ufrag, pwd).await;
        self.agent.set_remote_lite(remote_lite);
        for cand in candidates {
            self.agent.add_remote_candidate(cand).await;
        }

        self.verify_fingerprint_if_possible().await?;
        Ok(())
    }

    /// sdpstate_reset rewinds the offer/answer gate for an
    /// x-streamchange update that keeps the transport.
    pub async fn sdpstate_reset(&self) {
        let mut inner = self.sdp.lock().await;
        inner.state = SdpState::Idle;
        inner.got_sdp = false;
        inner.sent_sdp = false;
    }

    pub async fn is_sdp_offerer(&self) -> bool {
        self.sdp.lock().await.sdp_offerer
    }

    pub async fn got_sdp(&self) -> bool {
        self.sdp.lock().await.got_sdp
    }

    /// has_data says whether the remote advertised a data section;
    /// without one the call cannot run its signaling side-channel.
    pub async fn has_data(&self) -> bool {
        self.sdp.lock().await.remote_has_data
    }

    pub async fn has_video(&self) -> bool {
        self.sdp.lock().await.remote_has_video && self.enable_video
    }

    // --- establishment ----------------------------------------------

    /// start_ice launches connectivity checks and, on the first
    /// selected pair, the DTLS handshake in the role the SDP setup
    /// attribute dictates.
    pub async fn start_ice(self: &Arc<Self>) -> Result<()> {
        {
            let inner = self.sdp.lock().await;
            if inner.state != SdpState::Done {
                return Err(Error::ErrSdpState(format!(
                    "start_ice in {:?}",
                    inner.state
                )));
            }
        }

        self.agent.start_checks();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut selected = this.agent.selected_watch();
            loop {
                if selected.borrow().is_some() {
                    break;
                }
                if selected.changed().await.is_err() {
                    return;
                }
            }

            this.ice_ready.store(true, Ordering::SeqCst);
            {
                let mut timeline = this.timeline.lock().await;
                timeline.ice_estab = Some(Instant::now());
            }
            log::info!("mediaflow: ice established");

            if let Err(err) = this.establish_crypto().await {
                log::warn!("mediaflow: dtls establishment failed: {err}");
                this.shutdown(Arc::new(err)).await;
            }
        });

        Ok(())
    }

    async fn establish_crypto(self: &Arc<Self>) -> Result<()> {
        let is_client = {
            let inner = self.sdp.lock().await;
            match inner.local_setup {
                Setup::Active => true,
                Setup::Passive => false,
                Setup::ActPass => {
                    return Err(Error::ErrProtocol("dtls role unresolved".to_owned()))
                }
            }
        };

        let certificate = {
            let mut slot = self.certificate.lock().await;
            slot.take()
                .ok_or_else(|| Error::Other("certificate already consumed".to_owned()))?
        };

        let dtls_rx = {
            let mut slot = self.dtls_rx_slot.lock().await;
            slot.take()
                .ok_or_else(|| Error::Other("dtls transport already consumed".to_owned()))?
        };
        let mux_conn = Arc::new(MuxConn {
            agent: Arc::clone(&self.agent),
            rx: Mutex::new(dtls_rx),
        });

        let config = dtls::Config::new(certificate, is_client);
        let conn = Arc::new(dtls::DtlsConn::handshake(config, mux_conn).await?);

        {
            let mut timeline = self.timeline.lock().await;
            timeline.dtls_estab = Some(Instant::now());
        }

        // keys split by role per RFC 5764 section 4.2
        let profile = srtp::ProtectionProfile::from_id(conn.selected_srtp_profile())?;
        let material = conn.export_srtp_keying_material(profile.keying_material_len());
        let (tx_keys, rx_keys) =
            srtp::config::split_keying_material(profile, &material, is_client)?;

        {
            let mut srtp_tx = self.srtp_tx.lock().await;
            *srtp_tx = Some(srtp::Context::new(
                profile,
                &tx_keys.master_key,
                &tx_keys.master_salt,
            )?);
        }
        {
            let mut srtp_rx = self.srtp_rx.lock().await;
            *srtp_rx = Some(srtp::Context::new(
                profile,
                &rx_keys.master_key,
                &rx_keys.master_salt,
            )?);
        }

        {
            let mut slot = self.dtls_conn.lock().await;
            *slot = Some(Arc::clone(&conn));
        }
        self.crypto_ready.store(true, Ordering::SeqCst);

        // the fingerprint must match before any media is accepted
        self.verify_fingerprint_if_possible().await?;

        // consent freshness keeps re-proving the selected pair
        {
            let agent = Arc::clone(&self.agent);
            let this = Arc::clone(self);
            let consent = Consent::start(
                agent,
                Box::new(move |err| {
                    let this = Arc::clone(&this);
                    tokio::spawn(async move {
                        this.shutdown(Arc::new(Error::Ice(err))).await;
                    });
                }),
            );
            let mut slot = self.consent.lock().await;
            *slot = Some(consent);
        }

        // data channel rides the established connection; the offerer
        // opens it
        let is_offerer = self.is_sdp_offerer().await;
        self.datachan.attach(Arc::clone(&conn), is_offerer).await?;
        self.spawn_datachan_pump(Arc::clone(&conn));

        let _ = self.ready_tx.send(true);
        let crypto_name = profile.name().to_owned();
        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_media_estab.as_mut() {
            f(crypto_name).await;
        }

        Ok(())
    }

    /// verify_fingerprint_if_possible runs whenever either the SDP or
    /// the DTLS handshake lands; once both are present the digest
    /// must byte-match or the flow dies with an authentication error.
    async fn verify_fingerprint_if_possible(&self) -> Result<()> {
        let fingerprint = {
            let inner = self.sdp.lock().await;
            inner.remote_fingerprint.clone()
        };
        let conn = {
            let slot = self.dtls_conn.lock().await;
            slot.clone()
        };

        let (Some(fingerprint), Some(conn)) = (fingerprint, conn) else {
            return Ok(());
        };

        let digest: Vec<u8> = match fingerprint.hash.as_str() {
            "sha-256" => Sha256::digest(conn.peer_certificate()).to_vec(),
            "sha-1" => Sha1::digest(conn.peer_certificate()).to_vec(),
            other => {
                return Err(Error::ErrNotSupported(format!(
                    "fingerprint hash '{other}'"
                )))
            }
        };

        if digest != fingerprint.digest {
            log::warn!("mediaflow: dtls fingerprint mismatch");
            return Err(Error::ErrAuthentication);
        }

        self.crypto_verified.store(true, Ordering::SeqCst);
        log::info!("mediaflow: verified {} fingerprint OK", fingerprint.hash);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ice_ready.load(Ordering::SeqCst)
            && self.crypto_ready.load(Ordering::SeqCst)
            && self.crypto_verified.load(Ordering::SeqCst)
    }

    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    // --- receive path -----------------------------------------------

    async fn spawn_demux_pump(self: &Arc<Self>) {
        let Some(mut mux_rx) = self.agent.take_mux_receiver().await else {
            return;
        };
        let this = Arc::clone(self);

        tokio::spawn(async move {
            while let Some((packet, _src)) = mux_rx.recv().await {
                if this.closed.load(Ordering::SeqCst) {
                    break;
                }
                match classify(&packet) {
                    PacketKind::Dtls => {
                        let _ = this.dtls_tx.send(packet).await;
                    }
                    PacketKind::Rtp => this.recv_rtp(&packet).await,
                    PacketKind::Rtcp => this.recv_rtcp(&packet).await,
                    PacketKind::Stun => {
                        // checks are consumed inside the agent
                    }
                    PacketKind::Unknown => {
                        log::debug!("mediaflow: dropping unclassified packet");
                    }
                }
            }
        });
    }

    async fn recv_rtp(&self, packet: &[u8]) {
        if !self.is_ready() {
            self.n_srtp_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let unprotected = {
            let mut srtp_rx = self.srtp_rx.lock().await;
            let Some(ctx) = srtp_rx.as_mut() else {
                self.n_srtp_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            };
            match ctx.unprotect_rtp(packet) {
                Ok(p) => p,
                Err(err) => {
                    // single-packet failures only bump a counter
                    log::debug!("mediaflow: srtp unprotect failed: {err}");
                    self.n_srtp_error.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        };

        let seq = u16::from_be_bytes([unprotected[2], unprotected[3]]);
        {
            let mut stats = self.stats.lock().await;
            let lost = stats.note_received(unprotected.len(), seq);
            if lost > 0 {
                log::info!("mediaflow: {lost} rtp packets lost");
            }
        }

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_rtp.as_mut() {
            f(unprotected).await;
        }
    }

    async fn recv_rtcp(&self, packet: &[u8]) {
        if !self.is_ready() {
            return;
        }

        let unprotected = {
            let mut srtp_rx = self.srtp_rx.lock().await;
            let Some(ctx) = srtp_rx.as_mut() else {
                return;
            };
            match ctx.unprotect_rtcp(packet) {
                Ok(p) => p,
                Err(err) => {
                    log::debug!("mediaflow: srtcp unprotect failed: {err}");
                    self.n_srtp_error.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        };

        let mut stats = self.stats.lock().await;
        if let Some(sr) = SenderReport::parse(&unprotected) {
            for report in &sr.reports {
                stats.note_loss_up(report.fraction_lost);
            }
        } else if let Some(rr) = ReceiverReport::parse(&unprotected) {
            for report in &rr.reports {
                stats.note_loss_up(report.fraction_lost);
            }
        } else if let Some(bitrate) = parse_remb(&unprotected) {
            stats.bitrate_limit = Some(bitrate);
        }
    }

    fn spawn_datachan_pump(self: &Arc<Self>, conn: Arc<dtls::DtlsConn>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match conn.recv().await {
                    Ok(frame) => {
                        if let Err(err) = this.datachan.handle_frame(&frame).await {
                            log::warn!("mediaflow: datachan frame error: {err}");
                        }
                    }
                    Err(err) => {
                        log::debug!("mediaflow: dtls receive loop ends: {err}");
                        if !this.closed.load(Ordering::SeqCst) {
                            this.datachan.notify_closed().await;
                        }
                        break;
                    }
                }
            }
        });
    }

    // --- send path --------------------------------------------------

    /// send_rtp protects and routes one RTP packet. A relay path gets
    /// the Send-indication headroom so the envelope is written in
    /// place.
    pub async fn send_rtp(&self, packet: &[u8]) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::ErrNotReady);
        }

        let protected = {
            let mut srtp_tx = self.srtp_tx.lock().await;
            let ctx = srtp_tx.as_mut().ok_or(Error::ErrNotReady)?;
            match ctx.protect_rtp(packet) {
                Ok(p) => p,
                Err(err) => {
                    log::debug!("mediaflow: srtp protect failed: {err}");
                    self.n_srtp_error.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        };

        {
            let mut stats = self.stats.lock().await;
            stats.note_sent(protected.len());
        }

        self.route_outbound(protected).await
    }

    /// send_rtcp protects and routes one RTCP compound packet.
    pub async fn send_rtcp(&self, packet: &[u8]) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::ErrNotReady);
        }

        let protected = {
            let mut srtp_tx = self.srtp_tx.lock().await;
            let ctx = srtp_tx.as_mut().ok_or(Error::ErrNotReady)?;
            match ctx.protect_rtcp(packet) {
                Ok(p) => p,
                Err(err) => {
                    self.n_srtp_error.fetch_add(1, Ordering::Relaxed);
                    log::debug!("mediaflow: srtcp protect failed: {err}");
                    return Ok(());
                }
            }
        };

        self.route_outbound(protected).await
    }

    async fn route_outbound(&self, packet: Vec<u8>) -> Result<()> {
        match self.agent.send_path().await {
            Some(SendPath::Direct(_)) => {
                self.agent.send_to_selected(&packet).await?;
                Ok(())
            }
            Some(SendPath::Relay(client, peer)) => {
                let mut framed = Vec::with_capacity(SEND_INDICATION_OVERHEAD + packet.len());
                framed.resize(SEND_INDICATION_OVERHEAD, 0);
                framed.extend_from_slice(&packet);
                client.relay_send_headroom(&mut framed, peer).await?;
                Ok(())
            }
            None => Err(Error::ErrNotReady),
        }
    }

    // --- teardown and stats -----------------------------------------

    pub async fn stats(&self) -> MediaflowStats {
        let stats = self.stats.lock().await;
        let timeline = self.timeline.lock().await;
        let pair = self.agent.selected_pair();

        MediaflowStats {
            ice_ready: self.ice_ready.load(Ordering::SeqCst),
            crypto_ready: self.crypto_ready.load(Ordering::SeqCst),
            crypto_name: "AES_CM_128_HMAC_SHA1_80".to_owned(),
            local_cand: pair
                .as_ref()
                .map(|p| p.local.typ.to_string())
                .unwrap_or_default(),
            remote_cand: pair
                .as_ref()
                .map(|p| p.remote.typ.to_string())
                .unwrap_or_default(),
            packets_sent: stats.tx.packets,
            packets_recv: stats.rx.packets,
            bytes_sent: stats.tx.bytes,
            bytes_recv: stats.rx.bytes,
            avg_rtt_ms: stats.avg_rtt_ms(),
            max_rtt_ms: stats.max_rtt_ms,
            avg_loss_up: stats.avg_loss_up(),
            avg_loss_down: stats.avg_loss_down(),
            srtp_errors: self.n_srtp_error.load(Ordering::Relaxed),
            srtp_dropped: self.n_srtp_dropped.load(Ordering::Relaxed),
            turn_alloc_ms: None,
            nat_estab_ms: timeline
                .ice_estab
                .map(|t| t.duration_since(timeline.created).as_millis() as u64),
            dtls_estab_ms: timeline
                .dtls_estab
                .map(|t| t.duration_since(timeline.created).as_millis() as u64),
        }
    }

    pub fn srtp_error_count(&self) -> u64 {
        self.n_srtp_error.load(Ordering::Relaxed)
    }

    pub async fn selected_pair_types(&self) -> Option<(CandidateType, CandidateType)> {
        self.agent.selected_pair().map(|p| (p.local.typ, p.remote.typ))
    }

    async fn shutdown(self: &Arc<Self>, err: Arc<Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown().await;

        let mut handlers = self.handlers.lock().await;
        if let Some(f) = handlers.on_close.as_mut() {
            f(err).await;
        }
    }

    async fn teardown(&self) {
        {
            let mut consent = self.consent.lock().await;
            if let Some(consent) = consent.take() {
                consent.stop();
            }
        }
        self.datachan.notify_closed().await;
        {
            let conn = { self.dtls_conn.lock().await.clone() };
            if let Some(conn) = conn {
                let _ = conn.close().await;
            }
        }
        let _ = self.agent.close().await;
    }

    /// close tears the flow down without firing the close handler;
    /// the owner that asked does not need to hear back.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown().await;
    }
}

/// MuxConn adapts the agent's demultiplexed DTLS stream to the Conn
/// surface the handshake drives: reads come off the channel the
/// demux pump fills, writes go out the selected pair.
struct MuxConn {
    agent: Arc<Agent>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl Conn for MuxConn {
    async fn recv(&self, buf: &mut [u8]) -> util::Result<usize> {
        let mut rx = self.rx.lock().await;
        let packet = rx.recv().await.ok_or(util::Error::ErrClosed)?;
        if packet.len() > buf.len() {
            return Err(util::Error::ErrBufferTooShort);
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, "0.0.0.0:0".parse().unwrap()))
    }

    async fn send(&self, buf: &[u8]) -> util::Result<usize> {
        self.agent
            .send_to_selected(buf)
            .await
            .map_err(|e| util::Error::Other(e.to_string()))?;
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> util::Result<SocketAddr> {
        Ok("0.0.0.0:0".parse().unwrap())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> util::Result<()> {
        Ok(())
    }
}
