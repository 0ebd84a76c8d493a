#[cfg(test)]
mod integrity_test;

use std::fmt;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::attributes::*;
use crate::message::*;
use crate::{Error, Result};

// separator for long-term credentials.
pub(crate) const CREDENTIALS_SEP: &str = ":";

pub(crate) const MESSAGE_INTEGRITY_SIZE: usize = 20;

fn new_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(key).expect("hmac-sha1 accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// MessageIntegrity is the MESSAGE-INTEGRITY attribute: an HMAC-SHA1
/// over the message up to (and excluding) the attribute itself, with
/// the length field patched to include it (RFC 5389 section 15.4).
#[derive(Default, Clone)]
pub struct MessageIntegrity(pub Vec<u8>);

impl fmt::Display for MessageIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KEY: 0x{:x?}", self.0)
    }
}

impl MessageIntegrity {
    /// new_long_term_integrity derives the long-term credential key,
    /// md5(username ":" realm ":" password).
    pub fn new_long_term_integrity(username: String, realm: String, password: String) -> Self {
        let s = [username, realm, password].join(CREDENTIALS_SEP);

        let mut h = Md5::new();
        h.update(s.as_bytes());

        MessageIntegrity(h.finalize().as_slice().to_vec())
    }

    /// new_short_term_integrity uses the password directly as key.
    pub fn new_short_term_integrity(password: String) -> Self {
        MessageIntegrity(password.into_bytes())
    }
}

impl Setter for MessageIntegrity {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        for a in &m.attributes.0 {
            // FINGERPRINT must stay the last attribute
            if a.typ == ATTR_FINGERPRINT {
                return Err(Error::ErrFingerprintBeforeIntegrity);
            }
        }

        // The HMAC input is the message including the header, with the
        // length adjusted as if MESSAGE-INTEGRITY were already present.
        let length = m.length;
        m.length += (MESSAGE_INTEGRITY_SIZE + ATTRIBUTE_HEADER_SIZE) as u32;
        m.write_length();
        let v = new_hmac(&self.0, &m.raw);
        m.length = length;

        m.append(ATTR_MESSAGE_INTEGRITY, &v);
        Ok(())
    }
}

impl Checker for MessageIntegrity {
    fn check(&self, m: &Message) -> Result<()> {
        let offset = m
            .attr_offset(ATTR_MESSAGE_INTEGRITY)
            .ok_or(Error::ErrAttributeNotFound)?;
        let expected = m.get(ATTR_MESSAGE_INTEGRITY)?;

        // hash over everything before the attribute, with the length
        // field rewritten to end right after it
        let mut input = m.raw[..offset].to_vec();
        let patched_len =
            offset - MESSAGE_HEADER_SIZE + ATTRIBUTE_HEADER_SIZE + MESSAGE_INTEGRITY_SIZE;
        input[2..4].copy_from_slice(&(patched_len as u16).to_be_bytes());

        let actual = new_hmac(&self.0, &input);
        if actual != expected {
            return Err(Error::ErrIntegrityMismatch);
        }

        Ok(())
    }
}
