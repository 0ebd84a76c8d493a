#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! peercall is a peer-to-peer 1:1 calling stack: JSON signaling with
//! glare resolution (econn), an orchestrator binding signaling to
//! media (ecall), and a media transport doing trickle ICE, TURN,
//! DTLS-SRTP and a reliable data channel (mediaflow). A small TURN
//! server ships alongside for the tests.

pub mod ecall;
mod error;
pub mod stats;
pub mod video_state;

pub use ecall::{Ecall, EcallConfig, EcallTransport};
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Version string reported in the close metrics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
