#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod codec;
pub mod datachan;
pub mod demux;
mod error;
pub mod flow;
pub mod rtp_stats;
pub mod sdp;

pub use codec::Codec;
pub use datachan::DataChannel;
pub use error::Error;
pub use flow::{Mediaflow, MediaflowConfig, MediaflowStats};

pub type Result<T> = std::result::Result<T, Error>;
