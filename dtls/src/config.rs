use p256::ecdsa::SigningKey;
use p256::pkcs8::DecodePrivateKey;

use crate::crypto::{sha1_fingerprint_of, sha256_fingerprint_of};
use crate::{Error, Result, SRTP_PROFILE_AES128_CM_SHA1_80};

/// Certificate is a self-signed ECDSA P-256 identity. The DER is what
/// goes on the wire and what the SDP fingerprint digests.
pub struct Certificate {
    pub der: Vec<u8>,
    pub signing_key: SigningKey,
}

impl Certificate {
    /// generate_self_signed mints a fresh identity per call, the way
    /// WebRTC endpoints do.
    pub fn generate_self_signed() -> Result<Self> {
        let mut params = rcgen::CertificateParams::new(vec!["peercall".to_owned()]);
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;

        let cert = rcgen::Certificate::from_params(params)
            .map_err(|e| Error::ErrCertificate(e.to_string()))?;

        let der = cert
            .serialize_der()
            .map_err(|e| Error::ErrCertificate(e.to_string()))?;
        let key_der = cert.serialize_private_key_der();

        let signing_key = SigningKey::from_pkcs8_der(&key_der)
            .map_err(|e| Error::ErrCertificate(e.to_string()))?;

        Ok(Certificate { der, signing_key })
    }

    pub fn sha256_fingerprint(&self) -> String {
        sha256_fingerprint_of(&self.der)
    }

    pub fn sha1_fingerprint(&self) -> String {
        sha1_fingerprint_of(&self.der)
    }
}

/// Config parameterizes one handshake.
pub struct Config {
    pub certificate: Certificate,
    /// is_client mirrors the SDP setup attribute: active initiates.
    pub is_client: bool,
    pub srtp_profiles: Vec<u16>,
}

impl Config {
    pub fn new(certificate: Certificate, is_client: bool) -> Self {
        Config {
            certificate,
            is_client,
            srtp_profiles: vec![SRTP_PROFILE_AES128_CM_SHA1_80],
        }
    }
}
