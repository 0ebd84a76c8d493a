use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// ErrInvalidArg indicates nonsensical caller input.
    #[error("invalid argument")]
    ErrInvalidArg,

    /// ErrSdpState indicates an offer/answer call out of order
    /// (answer without offer, double offer, ...).
    #[error("sdp exchange out of order: {0}")]
    ErrSdpState(String),

    /// ErrProtocol indicates remote SDP that violates what this
    /// stack requires (no rtcp-mux, no fingerprint, no data section).
    #[error("protocol violation: {0}")]
    ErrProtocol(String),

    /// ErrAuthentication indicates the DTLS certificate digest does
    /// not match the SDP fingerprint; media is never accepted.
    #[error("fingerprint verification failed")]
    ErrAuthentication,

    /// ErrNotSupported indicates a negotiated feature with no local
    /// counterpart (no common codec, unknown fingerprint hash).
    #[error("not supported: {0}")]
    ErrNotSupported(String),

    /// ErrTransportClosed indicates the socket or relay died under
    /// the call.
    #[error("media transport closed")]
    ErrTransportClosed,

    /// ErrNotReady indicates a media send before ICE and DTLS both
    /// completed.
    #[error("media path not established")]
    ErrNotReady,

    #[error("sdp parse error: {0}")]
    ErrSdpParse(String),

    #[error("ice: {0}")]
    Ice(#[from] ice::Error),

    #[error("dtls: {0}")]
    Dtls(#[from] dtls::Error),

    #[error("srtp: {0}")]
    Srtp(#[from] srtp::Error),

    #[error("turn: {0}")]
    Turn(#[from] turn::Error),

    #[error("util: {0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}
