#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod econn;
mod error;
pub mod msg;
pub mod props;

pub use econn::{Econn, EconnConfig, EconnDir, EconnState, SignalingTransport};
pub use error::Error;
pub use msg::{EconnMessage, IceServer, MsgContent, MsgType};
pub use props::Properties;

pub type Result<T> = std::result::Result<T, Error>;

/// The protocol version every envelope carries; anything else is
/// rejected before dispatch.
pub const PROTO_VERSION: &str = "3.0";
