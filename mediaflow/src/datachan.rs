#[cfg(test)]
mod datachan_test;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use dtls::DtlsConn;
use portable_atomic::AtomicBool;
use tokio::sync::Mutex;

use crate::{Error, Result};

// Frame tags on the wire. OPEN and ACK are the DCEP message types
// (RFC 8832); DATA tags an ordinary payload frame. The channel rides
// directly on DTLS application data, so reliability is bounded by
// the transport underneath, which is all the signaling side-channel
// needs.
const FRAME_DATA: u8 = 0x01;
const FRAME_ACK: u8 = 0x02;
const FRAME_OPEN: u8 = 0x03;

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;

/// OpenMessage is the DCEP DATA_CHANNEL_OPEN body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub channel_type: u8,
    pub priority: u16,
    pub reliability: u32,
    pub label: String,
    pub protocol: String,
}

impl OpenMessage {
    pub fn new(label: &str) -> Self {
        OpenMessage {
            channel_type: CHANNEL_TYPE_RELIABLE,
            priority: 0,
            reliability: 0,
            label: label.to_owned(),
            protocol: String::new(),
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![FRAME_OPEN, self.channel_type];
        let mut fixed = [0u8; 10];
        BigEndian::write_u16(&mut fixed[0..2], self.priority);
        BigEndian::write_u32(&mut fixed[2..6], self.reliability);
        BigEndian::write_u16(&mut fixed[6..8], self.label.len() as u16);
        BigEndian::write_u16(&mut fixed[8..10], self.protocol.len() as u16);
        out.extend_from_slice(&fixed);
        out.extend_from_slice(self.label.as_bytes());
        out.extend_from_slice(self.protocol.as_bytes());
        out
    }

    pub fn parse(b: &[u8]) -> Result<OpenMessage> {
        // b excludes the frame tag
        if b.len() < 11 {
            return Err(Error::ErrProtocol("short DATA_CHANNEL_OPEN".to_owned()));
        }
        let channel_type = b[0];
        let priority = BigEndian::read_u16(&b[1..3]);
        let reliability = BigEndian::read_u32(&b[3..7]);
        let label_len = BigEndian::read_u16(&b[7..9]) as usize;
        let protocol_len = BigEndian::read_u16(&b[9..11]) as usize;

        if b.len() < 11 + label_len + protocol_len {
            return Err(Error::ErrProtocol("truncated DATA_CHANNEL_OPEN".to_owned()));
        }

        Ok(OpenMessage {
            channel_type,
            priority,
            reliability,
            label: String::from_utf8_lossy(&b[11..11 + label_len]).to_string(),
            protocol: String::from_utf8_lossy(&b[11 + label_len..11 + label_len + protocol_len])
                .to_string(),
        })
    }
}

type HdlrFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub type OnChanOpenHdlrFn = Box<dyn (FnMut(String) -> HdlrFuture) + Send + Sync>;
pub type OnChanMessageHdlrFn = Box<dyn (FnMut(Vec<u8>) -> HdlrFuture) + Send + Sync>;
pub type OnChanCloseHdlrFn = Box<dyn (FnMut() -> HdlrFuture) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_open: Option<OnChanOpenHdlrFn>,
    on_message: Option<OnChanMessageHdlrFn>,
    on_close: Option<OnChanCloseHdlrFn>,
}

/// DataChannel is the call's reliable side-channel: HANGUP and
/// PROPSYNC travel here once DTLS is up. The SDP offerer opens it.
pub struct DataChannel {
    label: String,
    dtls: Mutex<Option<Arc<DtlsConn>>>,
    open: AtomicBool,
    handlers: Mutex<Handlers>,
}

impl DataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(DataChannel {
            label: label.to_owned(),
            dtls: Mutex::new(None),
            open: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn on_open(&self, f: OnChanOpenHdlrFn) {
        self.handlers.lock().await.on_open = Some(f);
    }

    pub async fn on_message(&self, f: OnChanMessageHdlrFn) {
        self.handlers.lock().await.on_message = Some(f);
    }

    pub async fn on_close(&self, f: OnChanCloseHdlrFn) {
        self.handlers.lock().await.on_close = Some(f);
    }

    /// attach binds the channel to an established DTLS connection;
    /// the offerer immediately requests the open.
    pub async fn attach(&self, dtls: Arc<DtlsConn>, is_offerer: bool) -> Result<()> {
        {
            let mut slot = self.dtls.lock().await;
            *slot = Some(Arc::clone(&dtls));
        }

        if is_offerer {
            let open = OpenMessage::new(&self.label);
            dtls.send(&open.marshal()).await?;
        }
        Ok(())
    }

    /// handle_frame processes one DTLS application-data payload.
    pub async fn handle_frame(&self, frame: &[u8]) -> Result<()> {
        let Some((&tag, body)) = frame.split_first() else {
            return Ok(());
        };

        match tag {
            FRAME_OPEN => {
                let open = OpenMessage::parse(body)?;
                log::info!("datachan: open request, label '{}'", open.label);

                {
                    let dtls = self.dtls.lock().await;
                    if let Some(dtls) = dtls.as_ref() {
                        dtls.send(&[FRAME_ACK]).await?;
                    }
                }
                self.mark_open(open.label).await;
            }
            FRAME_ACK => {
                log::info!("datachan: open acknowledged");
                self.mark_open(self.label.clone()).await;
            }
            FRAME_DATA => {
                let payload = body.to_vec();
                // the handler may loop back into this channel (a
                // HANGUP response triggers teardown), so the lock
                // cannot be held across the call
                let taken = { self.handlers.lock().await.on_message.take() };
                if let Some(mut f) = taken {
                    f(payload).await;
                    let mut handlers = self.handlers.lock().await;
                    if handlers.on_message.is_none() {
                        handlers.on_message = Some(f);
                    }
                }
            }
            other => {
                log::debug!("datachan: unknown frame tag {other}");
            }
        }
        Ok(())
    }

    async fn mark_open(&self, label: String) {
        if self.open.swap(true, Ordering::SeqCst) {
            return;
        }
        let taken = { self.handlers.lock().await.on_open.take() };
        if let Some(mut f) = taken {
            f(label).await;
            let mut handlers = self.handlers.lock().await;
            if handlers.on_open.is_none() {
                handlers.on_open = Some(f);
            }
        }
    }

    /// send ships one message; the channel must be open.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ErrNotReady);
        }
        let dtls = {
            let slot = self.dtls.lock().await;
            slot.clone().ok_or(Error::ErrNotReady)?
        };

        let mut frame = Vec::with_capacity(1 + data.len());
        frame.push(FRAME_DATA);
        frame.extend_from_slice(data);
        dtls.send(&frame).await?;
        Ok(())
    }

    /// notify_closed fires the close handler once, on transport
    /// teardown.
    pub async fn notify_closed(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let taken = { self.handlers.lock().await.on_close.take() };
        if let Some(mut f) = taken {
            f().await;
        }
    }
}
