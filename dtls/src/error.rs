use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// ErrHandshakeTimeout indicates the bounded retransmit budget
    /// ran out before the handshake completed.
    #[error("dtls handshake timed out")]
    ErrHandshakeTimeout,

    /// ErrUnexpectedMessage indicates a handshake message arriving
    /// out of the expected order.
    #[error("unexpected handshake message: got {got}, want {want}")]
    ErrUnexpectedMessage { got: u8, want: u8 },

    /// ErrUnsupportedProtocolVersion indicates a record or hello with
    /// a version other than DTLS 1.2.
    #[error("unsupported protocol version")]
    ErrUnsupportedProtocolVersion,

    /// ErrNoSharedCipherSuite indicates the peer did not offer the
    /// one suite this stack speaks.
    #[error("no shared cipher suite")]
    ErrNoSharedCipherSuite,

    /// ErrNoSrtpProfile indicates use_srtp negotiation failed.
    #[error("no common srtp protection profile")]
    ErrNoSrtpProfile,

    /// ErrVerifyDataMismatch indicates a bad Finished MAC.
    #[error("finished verify_data mismatch")]
    ErrVerifyDataMismatch,

    /// ErrSignatureInvalid indicates a bad ServerKeyExchange or
    /// CertificateVerify signature.
    #[error("peer signature verification failed")]
    ErrSignatureInvalid,

    /// ErrNoCertificate indicates the peer sent no certificate; this
    /// stack requires mutual certificates for fingerprint checks.
    #[error("peer presented no certificate")]
    ErrNoCertificate,

    /// ErrDecryption indicates a record failed authenticated
    /// decryption.
    #[error("record decryption failed")]
    ErrDecryption,

    /// ErrCookieMismatch indicates a ClientHello retry without the
    /// server's cookie.
    #[error("cookie mismatch")]
    ErrCookieMismatch,

    /// ErrConnClosed indicates i/o after close.
    #[error("dtls connection closed")]
    ErrConnClosed,

    /// ErrAlert carries a fatal alert from the peer.
    #[error("received fatal alert: {0}")]
    ErrAlert(u8),

    #[error("malformed {0}")]
    ErrBufferTooSmall(&'static str),

    #[error("certificate generation failed: {0}")]
    ErrCertificate(String),

    #[error("util: {0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}
