use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum Error {
    /// ErrAttributeNotFound indicates a get on an attribute the
    /// message does not carry.
    #[error("attribute not found")]
    ErrAttributeNotFound,

    /// ErrUnexpectedHeaderEof indicates the buffer ended inside the
    /// fixed 20-byte message header.
    #[error("unexpected EOF: not enough bytes to read header")]
    ErrUnexpectedHeaderEof,

    /// ErrInvalidMagicCookie indicates the magic-cookie field did not
    /// contain 0x2112A442.
    #[error("bad magic cookie")]
    ErrInvalidMagicCookie,

    /// ErrAttributeSizeInvalid indicates a fixed-size attribute with
    /// the wrong length.
    #[error("attribute size is invalid")]
    ErrAttributeSizeInvalid,

    /// ErrAttributeSizeOverflow indicates a variable-size attribute
    /// above its maximum.
    #[error("attribute size overflow")]
    ErrAttributeSizeOverflow,

    #[error("buffer length invalid")]
    ErrBufferTooSmall,

    #[error("BadFormat for message/cookie")]
    ErrDecodeToNil,

    /// ErrIntegrityMismatch indicates a MESSAGE-INTEGRITY HMAC that
    /// does not match the credentials.
    #[error("integrity check failed")]
    ErrIntegrityMismatch,

    /// ErrFingerprintMismatch indicates a FINGERPRINT CRC that does
    /// not cover the preceding bytes.
    #[error("fingerprint check failed")]
    ErrFingerprintMismatch,

    /// ErrFingerprintBeforeIntegrity indicates an attempt to add
    /// MESSAGE-INTEGRITY after FINGERPRINT.
    #[error("FINGERPRINT before MESSAGE-INTEGRITY attribute")]
    ErrFingerprintBeforeIntegrity,

    /// ErrBadUnknownAttrsSize indicates UNKNOWN-ATTRIBUTES with an
    /// odd byte length.
    #[error("bad UNKNOWN-ATTRIBUTES size")]
    ErrBadUnknownAttrsSize,

    #[error("invalid address family value")]
    ErrBadAddressFamily,

    #[error("invalid error-code reason length")]
    ErrBadErrorCodeReason,

    #[error("unknown URI scheme: {0}")]
    ErrSchemeType(String),

    #[error("invalid stun/turn uri: {0}")]
    ErrInvalidUrl(String),

    #[error("{0}")]
    Other(String),
}
