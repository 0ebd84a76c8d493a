use thiserror::Error;

/// Error is the call-level failure surface. Layer errors converge
/// here; the numeric code is what the close metrics carry, with zero
/// reserved for a normal hangup.
#[derive(Debug, Error)]
pub enum Error {
    /// ErrInvalidArg indicates nonsensical caller input.
    #[error("invalid argument")]
    ErrInvalidArg,

    /// ErrProtocol indicates a well-formed message or SDP violating
    /// protocol rules (wrong state, bad version, bad field).
    #[error("protocol violation: {0}")]
    ErrProtocol(String),

    /// ErrAlreadyExists indicates a duplicate start on a live call.
    #[error("call already exists")]
    ErrAlreadyExists,

    /// ErrTimeout covers Tp/Tt expiry, the DTLS handshake budget and
    /// ICE consent expiry.
    #[error("timed out")]
    ErrTimeout,

    /// ErrAuthentication indicates a DTLS fingerprint mismatch.
    #[error("authentication failed")]
    ErrAuthentication,

    /// ErrCancelled indicates a local or remote cancel.
    #[error("cancelled")]
    ErrCancelled,

    /// ErrAnsweredElsewhere indicates another client of this user
    /// picked the call up.
    #[error("answered on another device")]
    ErrAnsweredElsewhere,

    /// ErrTransportClosed indicates the socket or TURN allocation
    /// died underneath the call.
    #[error("transport closed")]
    ErrTransportClosed,

    /// ErrNotSupported indicates a negotiated feature with no local
    /// counterpart (no common codec, no data channel).
    #[error("not supported: {0}")]
    ErrNotSupported(String),

    /// ErrInternal wraps everything that should not happen.
    #[error("internal: {0}")]
    ErrInternal(String),
}

impl Error {
    /// numeric error code for the metrics JSON; 0 means normal close
    pub fn code(&self) -> i32 {
        match self {
            Error::ErrInvalidArg => 22,
            Error::ErrProtocol(_) => 71,
            Error::ErrAlreadyExists => 17,
            Error::ErrTimeout => 110,
            Error::ErrAuthentication => 126,
            Error::ErrCancelled => 125,
            Error::ErrAnsweredElsewhere => 114,
            Error::ErrTransportClosed => 32,
            Error::ErrNotSupported(_) => 95,
            Error::ErrInternal(_) => 5,
        }
    }
}

impl From<econn::Error> for Error {
    fn from(e: econn::Error) -> Self {
        match e {
            econn::Error::ErrInvalidArg => Error::ErrInvalidArg,
            econn::Error::ErrTimeout => Error::ErrTimeout,
            econn::Error::ErrCancelled => Error::ErrCancelled,
            econn::Error::ErrAnsweredElsewhere => Error::ErrAnsweredElsewhere,
            econn::Error::ErrTransportFailed(_) => Error::ErrTransportClosed,
            econn::Error::ErrUnsupportedType(s) => Error::ErrNotSupported(s),
            other => Error::ErrProtocol(other.to_string()),
        }
    }
}

impl From<mediaflow::Error> for Error {
    fn from(e: mediaflow::Error) -> Self {
        match e {
            mediaflow::Error::ErrInvalidArg => Error::ErrInvalidArg,
            mediaflow::Error::ErrAuthentication => Error::ErrAuthentication,
            mediaflow::Error::ErrTransportClosed => Error::ErrTransportClosed,
            mediaflow::Error::ErrNotSupported(s) => Error::ErrNotSupported(s),
            mediaflow::Error::Dtls(dtls::Error::ErrHandshakeTimeout) => Error::ErrTimeout,
            mediaflow::Error::Ice(ice::Error::ErrConsentExpired) => Error::ErrTimeout,
            other => Error::ErrProtocol(other.to_string()),
        }
    }
}
