use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// ErrShortSrtpPacket indicates a packet below the minimum
    /// header-plus-tag size.
    #[error("srtp packet too short")]
    ErrShortSrtpPacket,

    #[error("srtcp packet too short")]
    ErrShortSrtcpPacket,

    /// ErrAuthenticationFailed indicates a bad authentication tag;
    /// the caller counts it and drops the packet.
    #[error("srtp authentication failed")]
    ErrAuthenticationFailed,

    /// ErrDuplicated indicates a replayed sequence number inside the
    /// replay window.
    #[error("duplicated or replayed packet")]
    ErrDuplicated,

    /// ErrBadKeyLength indicates master keying material of the wrong
    /// size for the profile.
    #[error("invalid master key/salt length")]
    ErrBadKeyLength,

    /// ErrUnsupportedProfile indicates a profile this stack does not
    /// implement.
    #[error("unsupported srtp protection profile: {0:#06x}")]
    ErrUnsupportedProfile(u16),

    #[error("malformed rtp header")]
    ErrBadRtpHeader,

    #[error("{0}")]
    Other(String),
}
