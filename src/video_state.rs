use crate::{Error, Result};

/// VideoSendState is the negotiated `videosend` toggle. Values come
/// off the wire as property strings; anything unknown is rejected
/// explicitly instead of falling through to a default arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSendState {
    Stopped,
    Started,
}

impl VideoSendState {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "false" => Ok(VideoSendState::Stopped),
            "true" => Ok(VideoSendState::Started),
            other => {
                log::warn!("videosend: unknown state '{other}'");
                Err(Error::ErrInvalidArg)
            }
        }
    }

    pub fn as_property(&self) -> &'static str {
        match self {
            VideoSendState::Stopped => "false",
            VideoSendState::Started => "true",
        }
    }
}

#[cfg(test)]
mod video_state_test {
    use super::*;

    #[test]
    fn test_known_states() {
        assert_eq!(
            VideoSendState::parse("true").unwrap(),
            VideoSendState::Started
        );
        assert_eq!(
            VideoSendState::parse("false").unwrap(),
            VideoSendState::Stopped
        );
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!(VideoSendState::parse("paused").is_err());
        assert!(VideoSendState::parse("").is_err());
    }
}
