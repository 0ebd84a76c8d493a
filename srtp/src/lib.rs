#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod config;
pub mod context;
mod error;
pub mod protection_profile;

pub use config::SessionKeys;
pub use context::Context;
pub use error::Error;
pub use protection_profile::ProtectionProfile;

pub type Result<T> = std::result::Result<T, Error>;
