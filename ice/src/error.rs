use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// ErrParseCandidate indicates a malformed `candidate:` attribute.
    #[error("cannot parse candidate attribute: {0}")]
    ErrParseCandidate(String),

    /// ErrUnknownCandidateType indicates a `typ` token outside
    /// host/srflx/prflx/relay.
    #[error("unknown candidate type: {0}")]
    ErrUnknownCandidateType(String),

    /// ErrClosed indicates an operation on a closed agent.
    #[error("agent is closed")]
    ErrClosed,

    /// ErrNoCandidatePairs indicates checks were started without any
    /// viable pair.
    #[error("no candidate pairs available")]
    ErrNoCandidatePairs,

    /// ErrConsentExpired indicates the peer stopped answering
    /// consent-freshness checks on the selected pair.
    #[error("consent freshness expired")]
    ErrConsentExpired,

    /// ErrFreshnessTimeout indicates the lite responder saw no
    /// traffic inside the freshness window.
    #[error("no traffic seen within freshness window")]
    ErrFreshnessTimeout,

    /// ErrGatherTimeout indicates no candidate could be gathered at
    /// all.
    #[error("gathering produced no candidates")]
    ErrGatherTimeout,

    #[error("stun: {0}")]
    Stun(#[from] stun::Error),

    #[error("turn: {0}")]
    Turn(#[from] turn::Error),

    #[error("util: {0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}
