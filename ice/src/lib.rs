#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod agent;
pub mod candidate;
pub mod consent;
mod error;
pub mod icelite;
pub mod rand_creds;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
