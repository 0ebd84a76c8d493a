use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// ErrInvalidArg indicates nonsensical caller input.
    #[error("invalid argument")]
    ErrInvalidArg,

    /// ErrProtocol indicates a syntactically valid message that
    /// violates protocol rules: wrong state, wrong version, missing
    /// mandatory field.
    #[error("protocol violation: {0}")]
    ErrProtocol(String),

    /// ErrUnsupportedType indicates an envelope whose `type` is
    /// unknown; distinguished so callers can ignore-and-log.
    #[error("unsupported message type: {0}")]
    ErrUnsupportedType(String),

    /// ErrVersionMismatch indicates an envelope from an incompatible
    /// protocol version.
    #[error("protocol version mismatch: {0}")]
    ErrVersionMismatch(String),

    /// ErrTimeout indicates the setup (Tp) or termination (Tt) timer
    /// fired.
    #[error("timed out")]
    ErrTimeout,

    /// ErrCancelled indicates a local or remote cancel.
    #[error("cancelled")]
    ErrCancelled,

    /// ErrAnsweredElsewhere indicates another client of the same user
    /// picked the call up.
    #[error("answered on another device")]
    ErrAnsweredElsewhere,

    /// ErrTransportFailed indicates the signaling transport could not
    /// deliver.
    #[error("signaling transport failed: {0}")]
    ErrTransportFailed(String),

    #[error("malformed message: {0}")]
    ErrBadMessage(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// numeric code carried in close metrics; zero is reserved for
    /// normal close
    pub fn code(&self) -> i32 {
        match self {
            Error::ErrInvalidArg => 22,
            Error::ErrProtocol(_) => 71,
            Error::ErrUnsupportedType(_) => 95,
            Error::ErrVersionMismatch(_) => 92,
            Error::ErrTimeout => 110,
            Error::ErrCancelled => 125,
            Error::ErrAnsweredElsewhere => 114,
            Error::ErrTransportFailed(_) => 32,
            Error::ErrBadMessage(_) => 74,
            Error::Other(_) => 5,
        }
    }
}
