#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod addr;
pub mod attributes;
pub mod checks;
pub mod error_code;
mod error;
pub mod fingerprint;
pub mod integrity;
pub mod message;
pub mod textattrs;
pub mod uattrs;
pub mod uri;
pub mod xoraddr;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
