#[cfg(test)]
mod auth_test;

use std::net::SocketAddr;

use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::Result;

/// AuthHandler resolves a username to its long-term-credential key.
/// The server calls it for every authenticated request.
pub trait AuthHandler {
    fn auth_handle(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Result<Vec<u8>>;
}

/// generate_auth_key derives the long-term credential key,
/// md5(username ":" realm ":" password) (RFC 5389 section 15.4).
pub fn generate_auth_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let s = format!("{username}:{realm}:{password}");

    let mut h = Md5::new();
    h.update(s.as_bytes());
    h.finalize().as_slice().to_vec()
}

/// generate_nonce produces the opaque NONCE text for 401 challenges.
pub fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
