#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod allocation;
pub mod auth;
pub mod client;
mod error;
pub mod proto;
pub mod server;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
