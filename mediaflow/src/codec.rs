/// Codec describes one registered media format the way the SDP
/// m-section advertises it. Concrete encoders and decoders live with
/// the host; the transport only needs the negotiation surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: u8,
    pub fmtp: Option<String>,
    pub kind: CodecKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Audio,
    Video,
}

impl Codec {
    pub fn opus() -> Self {
        Codec {
            payload_type: 111,
            name: "opus".to_owned(),
            clock_rate: 48000,
            channels: 2,
            fmtp: Some("minptime=10;useinbandfec=1".to_owned()),
            kind: CodecKind::Audio,
        }
    }

    pub fn vp8() -> Self {
        Codec {
            payload_type: 100,
            name: "VP8".to_owned(),
            clock_rate: 90000,
            channels: 0,
            fmtp: None,
            kind: CodecKind::Video,
        }
    }

    /// rtpmap value as it appears after `a=rtpmap:<pt> `
    pub fn rtpmap(&self) -> String {
        if self.channels > 0 {
            format!("{}/{}/{}", self.name, self.clock_rate, self.channels)
        } else {
            format!("{}/{}", self.name, self.clock_rate)
        }
    }
}
