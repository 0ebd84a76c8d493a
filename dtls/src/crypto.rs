#[cfg(test)]
mod crypto_test;

use hmac::{Hmac, Mac};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

pub const MASTER_SECRET_LENGTH: usize = 48;
pub const VERIFY_DATA_LENGTH: usize = 12;

// AES-128-GCM key block: two 16-byte keys, two 4-byte implicit IVs.
pub const KEY_LENGTH: usize = 16;
pub const IV_LENGTH: usize = 4;

type HmacSha256 = Hmac<Sha256>;

/// prf is the TLS 1.2 pseudo-random function, P_SHA256 only
/// (RFC 5246 section 5).
pub fn prf(secret: &[u8], label: &str, seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut label_seed = label.as_bytes().to_vec();
    label_seed.extend_from_slice(seed);

    let hmac_run = |key: &[u8], data: &[u8]| -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    };

    let mut out = Vec::with_capacity(out_len);
    let mut a = hmac_run(secret, &label_seed); // A(1)

    while out.len() < out_len {
        let mut block_input = a.clone();
        block_input.extend_from_slice(&label_seed);
        out.extend_from_slice(&hmac_run(secret, &block_input));
        a = hmac_run(secret, &a); // A(i+1)
    }

    out.truncate(out_len);
    out
}

/// master_secret from the ECDHE premaster (RFC 5246 section 8.1).
pub fn master_secret(pre_master: &[u8], client_random: &[u8], server_random: &[u8]) -> Vec<u8> {
    let mut seed = client_random.to_vec();
    seed.extend_from_slice(server_random);
    prf(pre_master, "master secret", &seed, MASTER_SECRET_LENGTH)
}

/// KeyBlock is the expanded traffic keying material. Note the seed
/// order flips to server_random || client_random for expansion.
pub struct KeyBlock {
    pub client_write_key: [u8; KEY_LENGTH],
    pub server_write_key: [u8; KEY_LENGTH],
    pub client_write_iv: [u8; IV_LENGTH],
    pub server_write_iv: [u8; IV_LENGTH],
}

pub fn key_block(master: &[u8], client_random: &[u8], server_random: &[u8]) -> KeyBlock {
    let mut seed = server_random.to_vec();
    seed.extend_from_slice(client_random);
    let material = prf(master, "key expansion", &seed, 2 * KEY_LENGTH + 2 * IV_LENGTH);

    let mut kb = KeyBlock {
        client_write_key: [0u8; KEY_LENGTH],
        server_write_key: [0u8; KEY_LENGTH],
        client_write_iv: [0u8; IV_LENGTH],
        server_write_iv: [0u8; IV_LENGTH],
    };
    kb.client_write_key.copy_from_slice(&material[..16]);
    kb.server_write_key.copy_from_slice(&material[16..32]);
    kb.client_write_iv.copy_from_slice(&material[32..36]);
    kb.server_write_iv.copy_from_slice(&material[36..40]);
    kb
}

/// verify_data for the Finished message over the transcript hash.
pub fn verify_data(master: &[u8], label: &str, transcript: &[u8]) -> Vec<u8> {
    let hash = Sha256::digest(transcript);
    prf(master, label, &hash, VERIFY_DATA_LENGTH)
}

/// export_keying_material per RFC 5705 (no context).
pub fn export_keying_material(
    master: &[u8],
    label: &str,
    client_random: &[u8],
    server_random: &[u8],
    out_len: usize,
) -> Vec<u8> {
    let mut seed = client_random.to_vec();
    seed.extend_from_slice(server_random);
    prf(master, label, &seed, out_len)
}

/// sign_ecdsa produces a DER signature over sha256(data).
pub fn sign_ecdsa(key: &SigningKey, data: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(data);
    signature.to_der().as_bytes().to_vec()
}

/// verify_ecdsa checks a DER signature with a SEC1 public key.
pub fn verify_ecdsa(public_key_sec1: &[u8], data: &[u8], signature_der: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_sec1_bytes(public_key_sec1)
        .map_err(|_| Error::ErrSignatureInvalid)?;
    let signature =
        Signature::from_der(signature_der).map_err(|_| Error::ErrSignatureInvalid)?;
    key.verify(data, &signature)
        .map_err(|_| Error::ErrSignatureInvalid)
}

/// certificate_public_key pulls the SEC1 point out of a DER
/// certificate's SubjectPublicKeyInfo.
pub fn certificate_public_key(cert_der: &[u8]) -> Result<Vec<u8>> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| Error::ErrCertificate(e.to_string()))?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

/// fingerprint renders a digest as uppercase colon-separated hex,
/// the form SDP carries.
pub fn format_fingerprint(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// sha256_fingerprint_of digests a DER certificate the way
/// `a=fingerprint:sha-256` expects.
pub fn sha256_fingerprint_of(cert_der: &[u8]) -> String {
    format_fingerprint(&Sha256::digest(cert_der))
}

/// sha1_fingerprint_of is kept for interoperability on receive.
pub fn sha1_fingerprint_of(cert_der: &[u8]) -> String {
    use sha1::Sha1;
    format_fingerprint(&Sha1::digest(cert_der))
}
