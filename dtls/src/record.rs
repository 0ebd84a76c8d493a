#[cfg(test)]
mod record_test;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};

use crate::{Error, Result, PROTOCOL_VERSION};

pub const RECORD_HEADER_SIZE: usize = 13;
pub const GCM_TAG_LENGTH: usize = 16;
pub const GCM_EXPLICIT_NONCE_LENGTH: usize = 8;

/// ContentType of a DTLS record (RFC 5246 section 6.2.1).
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
}

impl ContentType {
    pub fn value(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
        }
    }

    pub fn from_value(v: u8) -> Result<Self> {
        match v {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            _ => Err(Error::ErrBufferTooSmall("record content type")),
        }
    }
}

/// is_dtls_record is the demultiplexer test: first byte in [20, 63]
/// (RFC 5764 section 5.1.2).
pub fn is_dtls_record(b: &[u8]) -> bool {
    !b.is_empty() && (20..=63).contains(&b[0])
}

/// Record is one DTLS record, payload still encrypted or already
/// plaintext depending on the epoch it was read with.
#[derive(Debug, Clone)]
pub struct Record {
    pub content_type: ContentType,
    pub epoch: u16,
    pub sequence: u64, // 48 bits on the wire
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(content_type: ContentType, epoch: u16, sequence: u64, payload: Vec<u8>) -> Self {
        Record {
            content_type,
            epoch,
            sequence,
            payload,
        }
    }

    /// marshal renders header plus payload.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + self.payload.len());
        out.push(self.content_type.value());
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes()[2..]); // low 48 bits
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// unmarshal_all splits one datagram into its records.
    pub fn unmarshal_all(datagram: &[u8]) -> Result<Vec<Record>> {
        let mut records = vec![];
        let mut offset = 0;

        while offset < datagram.len() {
            if datagram.len() - offset < RECORD_HEADER_SIZE {
                return Err(Error::ErrBufferTooSmall("record header"));
            }
            let b = &datagram[offset..];

            let content_type = ContentType::from_value(b[0])?;
            let version = u16::from_be_bytes([b[1], b[2]]);
            if version != PROTOCOL_VERSION {
                return Err(Error::ErrUnsupportedProtocolVersion);
            }
            let epoch = u16::from_be_bytes([b[3], b[4]]);
            let mut seq_bytes = [0u8; 8];
            seq_bytes[2..].copy_from_slice(&b[5..11]);
            let sequence = u64::from_be_bytes(seq_bytes);
            let len = u16::from_be_bytes([b[11], b[12]]) as usize;

            if b.len() < RECORD_HEADER_SIZE + len {
                return Err(Error::ErrBufferTooSmall("record payload"));
            }

            records.push(Record {
                content_type,
                epoch,
                sequence,
                payload: b[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len].to_vec(),
            });
            offset += RECORD_HEADER_SIZE + len;
        }

        Ok(records)
    }
}

/// CipherState protects one direction of the epoch-1 channel with
/// AES-128-GCM: 4-byte implicit salt plus the 8-byte explicit nonce
/// carried in front of each ciphertext (RFC 5288).
pub struct CipherState {
    cipher: Aes128Gcm,
    fixed_iv: [u8; 4],
}

impl CipherState {
    pub fn new(key: &[u8], fixed_iv: &[u8]) -> Result<Self> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::ErrBufferTooSmall("gcm key"))?;
        let mut iv = [0u8; 4];
        iv.copy_from_slice(fixed_iv);
        Ok(CipherState {
            cipher,
            fixed_iv: iv,
        })
    }

    fn nonce(&self, explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed_iv);
        nonce[4..].copy_from_slice(explicit);
        nonce
    }

    fn aad(record: &Record, plaintext_len: usize) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[..2].copy_from_slice(&record.epoch.to_be_bytes());
        aad[2..8].copy_from_slice(&record.sequence.to_be_bytes()[2..]);
        aad[8] = record.content_type.value();
        aad[9..11].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        aad[11..13].copy_from_slice(&(plaintext_len as u16).to_be_bytes());
        aad
    }

    /// encrypt replaces the record payload with
    /// explicit_nonce || ciphertext || tag.
    pub fn encrypt(&self, record: &mut Record) -> Result<()> {
        let mut explicit = [0u8; GCM_EXPLICIT_NONCE_LENGTH];
        explicit[..2].copy_from_slice(&record.epoch.to_be_bytes());
        explicit[2..].copy_from_slice(&record.sequence.to_be_bytes()[2..]);

        let nonce = self.nonce(&explicit);
        let aad = Self::aad(record, record.payload.len());

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &record.payload,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::ErrDecryption)?;

        let mut payload = Vec::with_capacity(GCM_EXPLICIT_NONCE_LENGTH + ciphertext.len());
        payload.extend_from_slice(&explicit);
        payload.extend_from_slice(&ciphertext);
        record.payload = payload;
        Ok(())
    }

    /// decrypt strips the explicit nonce and authenticates the rest.
    pub fn decrypt(&self, record: &mut Record) -> Result<()> {
        if record.payload.len() < GCM_EXPLICIT_NONCE_LENGTH + GCM_TAG_LENGTH {
            return Err(Error::ErrBufferTooSmall("gcm record"));
        }

        let explicit = record.payload[..GCM_EXPLICIT_NONCE_LENGTH].to_vec();
        let ciphertext = record.payload[GCM_EXPLICIT_NONCE_LENGTH..].to_vec();
        let nonce = self.nonce(&explicit);

        let plaintext_len = ciphertext.len() - GCM_TAG_LENGTH;
        let aad = Self::aad(record, plaintext_len);

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::ErrDecryption)?;

        record.payload = plaintext;
        Ok(())
    }
}
