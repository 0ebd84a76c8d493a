use crate::protection_profile::ProtectionProfile;
use crate::{Error, Result};

/// SessionKeys is one direction's master key and salt.
#[derive(Clone)]
pub struct SessionKeys {
    pub master_key: Vec<u8>,
    pub master_salt: Vec<u8>,
}

/// split_keying_material cuts the DTLS-SRTP exporter block into the
/// local and remote halves per RFC 5764 section 4.2: client-write
/// material protects what the DTLS client sends.
pub fn split_keying_material(
    profile: ProtectionProfile,
    material: &[u8],
    is_client: bool,
) -> Result<(SessionKeys, SessionKeys)> {
    let key_len = profile.key_len();
    let salt_len = profile.salt_len();
    if material.len() < profile.keying_material_len() {
        return Err(Error::ErrBadKeyLength);
    }

    let client_key = &material[..key_len];
    let server_key = &material[key_len..2 * key_len];
    let client_salt = &material[2 * key_len..2 * key_len + salt_len];
    let server_salt = &material[2 * key_len + salt_len..2 * key_len + 2 * salt_len];

    let client = SessionKeys {
        master_key: client_key.to_vec(),
        master_salt: client_salt.to_vec(),
    };
    let server = SessionKeys {
        master_key: server_key.to_vec(),
        master_salt: server_salt.to_vec(),
    };

    // (tx, rx) from the local point of view
    if is_client {
        Ok((client, server))
    } else {
        Ok((server, client))
    }
}
