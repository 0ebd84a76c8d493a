use crate::{Error, Result};

/// ProtectionProfile pins cipher and tag parameters, mirroring the
/// use_srtp negotiation ids. Only AES_CM_128_HMAC_SHA1_80 is spoken
/// here.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ProtectionProfile {
    #[default]
    Aes128CmHmacSha1_80,
}

pub const PROFILE_ID_AES128_CM_SHA1_80: u16 = 0x0001;

impl ProtectionProfile {
    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            PROFILE_ID_AES128_CM_SHA1_80 => Ok(ProtectionProfile::Aes128CmHmacSha1_80),
            other => Err(Error::ErrUnsupportedProfile(other)),
        }
    }

    pub fn id(&self) -> u16 {
        PROFILE_ID_AES128_CM_SHA1_80
    }

    pub fn key_len(&self) -> usize {
        16
    }

    pub fn salt_len(&self) -> usize {
        14
    }

    pub fn auth_tag_len(&self) -> usize {
        10
    }

    pub fn auth_key_len(&self) -> usize {
        20
    }

    /// keying material consumed from the DTLS exporter:
    /// two keys plus two salts.
    pub fn keying_material_len(&self) -> usize {
        2 * (self.key_len() + self.salt_len())
    }

    /// descriptive name as the metrics JSON reports it
    pub fn name(&self) -> &'static str {
        "AES_CM_128_HMAC_SHA1_80"
    }
}
