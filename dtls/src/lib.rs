#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod config;
pub mod conn;
pub mod crypto;
mod error;
pub mod handshake;
pub mod record;

pub use config::{Certificate, Config};
pub use conn::DtlsConn;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// PROTOCOL_VERSION is DTLS 1.2 on the wire ({254, 253}).
pub const PROTOCOL_VERSION: u16 = 0xfefd;

/// The one cipher suite this stack speaks:
/// TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256.
pub const CIPHER_SUITE_ID: u16 = 0xc02b;

/// The one SRTP protection profile negotiated through use_srtp:
/// SRTP_AES128_CM_HMAC_SHA1_80.
pub const SRTP_PROFILE_AES128_CM_SHA1_80: u16 = 0x0001;

/// RFC 5705 exporter label for DTLS-SRTP keying material.
pub const EXTRACTOR_LABEL: &str = "EXTRACTOR-dtls_srtp";
