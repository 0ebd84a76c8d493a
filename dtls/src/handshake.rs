#[cfg(test)]
mod handshake_test;

use crate::{Error, Result, CIPHER_SUITE_ID, PROTOCOL_VERSION, SRTP_PROFILE_AES128_CM_SHA1_80};

pub const HANDSHAKE_HEADER_SIZE: usize = 12;
pub const RANDOM_LENGTH: usize = 32;

pub const TYPE_CLIENT_HELLO: u8 = 1;
pub const TYPE_SERVER_HELLO: u8 = 2;
pub const TYPE_HELLO_VERIFY_REQUEST: u8 = 3;
pub const TYPE_CERTIFICATE: u8 = 11;
pub const TYPE_SERVER_KEY_EXCHANGE: u8 = 12;
pub const TYPE_CERTIFICATE_REQUEST: u8 = 13;
pub const TYPE_SERVER_HELLO_DONE: u8 = 14;
pub const TYPE_CERTIFICATE_VERIFY: u8 = 15;
pub const TYPE_CLIENT_KEY_EXCHANGE: u8 = 16;
pub const TYPE_FINISHED: u8 = 20;

// extension ids
const EXT_USE_SRTP: u16 = 14;
const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_EC_POINT_FORMATS: u16 = 11;
const EXT_SIGNATURE_ALGORITHMS: u16 = 13;

const NAMED_GROUP_P256: u16 = 23;
const SIG_SCHEME_ECDSA_P256_SHA256: u16 = 0x0403;

/// Header is the 12-byte DTLS handshake header. This stack keeps
/// every message in one fragment (MTU permitting; all of ours fit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub typ: u8,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

impl Header {
    pub fn marshal(&self) -> [u8; HANDSHAKE_HEADER_SIZE] {
        let mut out = [0u8; HANDSHAKE_HEADER_SIZE];
        out[0] = self.typ;
        out[1..4].copy_from_slice(&self.length.to_be_bytes()[1..]);
        out[4..6].copy_from_slice(&self.message_seq.to_be_bytes());
        out[6..9].copy_from_slice(&self.fragment_offset.to_be_bytes()[1..]);
        out[9..12].copy_from_slice(&self.fragment_length.to_be_bytes()[1..]);
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() < HANDSHAKE_HEADER_SIZE {
            return Err(Error::ErrBufferTooSmall("handshake header"));
        }
        Ok(Header {
            typ: b[0],
            length: u32::from_be_bytes([0, b[1], b[2], b[3]]),
            message_seq: u16::from_be_bytes([b[4], b[5]]),
            fragment_offset: u32::from_be_bytes([0, b[6], b[7], b[8]]),
            fragment_length: u32::from_be_bytes([0, b[9], b[10], b[11]]),
        })
    }
}

/// Message is one complete handshake message (header + body bytes).
#[derive(Debug, Clone)]
pub struct Message {
    pub typ: u8,
    pub message_seq: u16,
    pub body: Vec<u8>,
}

impl Message {
    /// marshal renders the single-fragment wire form; this is also
    /// exactly what enters the Finished transcript (RFC 6347
    /// section 4.2.6).
    pub fn marshal(&self) -> Vec<u8> {
        let header = Header {
            typ: self.typ,
            length: self.body.len() as u32,
            message_seq: self.message_seq,
            fragment_offset: 0,
            fragment_length: self.body.len() as u32,
        };
        let mut out = header.marshal().to_vec();
        out.extend_from_slice(&self.body);
        out
    }

    /// unmarshal_all parses the handshake messages inside one record
    /// payload. Fragmented messages are rejected; nothing this stack
    /// sends needs fragmentation and reassembly.
    pub fn unmarshal_all(payload: &[u8]) -> Result<Vec<Message>> {
        let mut out = vec![];
        let mut offset = 0;

        while offset < payload.len() {
            let header = Header::unmarshal(&payload[offset..])?;
            if header.fragment_offset != 0 || header.fragment_length != header.length {
                return Err(Error::ErrBufferTooSmall("fragmented handshake message"));
            }
            let start = offset + HANDSHAKE_HEADER_SIZE;
            let end = start + header.length as usize;
            if payload.len() < end {
                return Err(Error::ErrBufferTooSmall("handshake body"));
            }
            out.push(Message {
                typ: header.typ,
                message_seq: header.message_seq,
                body: payload[start..end].to_vec(),
            });
            offset = end;
        }

        Ok(out)
    }
}

// --- reader helpers -------------------------------------------------

struct Reader<'a> {
    b: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(b: &'a [u8]) -> Self {
        Reader { b, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.b.len() - self.pos < n {
            return Err(Error::ErrBufferTooSmall("handshake field"));
        }
        let out = &self.b[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn vec8(&mut self) -> Result<Vec<u8>> {
        let n = self.u8()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    fn vec16(&mut self) -> Result<Vec<u8>> {
        let n = self.u16()? as usize;
        Ok(self.take(n)?.to_vec())
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_u24(out: &mut Vec<u8>, v: usize) {
    out.extend_from_slice(&(v as u32).to_be_bytes()[1..]);
}

// --- hello extensions ----------------------------------------------

/// the extension block both hellos carry: use_srtp with the one
/// profile, P-256, uncompressed points, ecdsa_secp256r1_sha256
fn marshal_extensions(include_offer_only: bool) -> Vec<u8> {
    let mut ext = vec![];

    // use_srtp: profile list + empty MKI
    push_u16(&mut ext, EXT_USE_SRTP);
    push_u16(&mut ext, 2 + 2 + 1);
    push_u16(&mut ext, 2);
    push_u16(&mut ext, SRTP_PROFILE_AES128_CM_SHA1_80);
    ext.push(0);

    if include_offer_only {
        // supported groups
        push_u16(&mut ext, EXT_SUPPORTED_GROUPS);
        push_u16(&mut ext, 4);
        push_u16(&mut ext, 2);
        push_u16(&mut ext, NAMED_GROUP_P256);

        // signature algorithms
        push_u16(&mut ext, EXT_SIGNATURE_ALGORITHMS);
        push_u16(&mut ext, 4);
        push_u16(&mut ext, 2);
        push_u16(&mut ext, SIG_SCHEME_ECDSA_P256_SHA256);
    }

    // ec point formats: uncompressed
    push_u16(&mut ext, EXT_EC_POINT_FORMATS);
    push_u16(&mut ext, 2);
    ext.push(1);
    ext.push(0);

    ext
}

/// returns true when the peer's extension block offers (or confirms)
/// our SRTP profile
fn extensions_carry_srtp_profile(ext: &[u8]) -> bool {
    let mut r = Reader::new(ext);
    while let Ok(id) = r.u16() {
        let body = match r.vec16() {
            Ok(b) => b,
            Err(_) => return false,
        };
        if id == EXT_USE_SRTP {
            let mut er = Reader::new(&body);
            if let Ok(profiles) = er.vec16() {
                for chunk in profiles.chunks_exact(2) {
                    if u16::from_be_bytes([chunk[0], chunk[1]])
                        == SRTP_PROFILE_AES128_CM_SHA1_80
                    {
                        return true;
                    }
                }
            }
        }
    }
    false
}

// --- message bodies -------------------------------------------------

/// ClientHello (RFC 5246 section 7.4.1.2 with the DTLS cookie).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; RANDOM_LENGTH],
    pub cookie: Vec<u8>,
}

impl ClientHello {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        push_u16(&mut out, PROTOCOL_VERSION);
        out.extend_from_slice(&self.random);
        out.push(0); // session id
        out.push(self.cookie.len() as u8);
        out.extend_from_slice(&self.cookie);
        push_u16(&mut out, 2); // one cipher suite
        push_u16(&mut out, CIPHER_SUITE_ID);
        out.push(1); // one compression method: null
        out.push(0);

        let ext = marshal_extensions(true);
        push_u16(&mut out, ext.len() as u16);
        out.extend_from_slice(&ext);
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        let mut r = Reader::new(b);
        let version = r.u16()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::ErrUnsupportedProtocolVersion);
        }

        let mut random = [0u8; RANDOM_LENGTH];
        random.copy_from_slice(r.take(RANDOM_LENGTH)?);

        let _session = r.vec8()?;
        let cookie = r.vec8()?;

        let suites = r.vec16()?;
        let offered = suites
            .chunks_exact(2)
            .any(|c| u16::from_be_bytes([c[0], c[1]]) == CIPHER_SUITE_ID);
        if !offered {
            return Err(Error::ErrNoSharedCipherSuite);
        }

        let _compressions = r.vec8()?;
        let ext = r.vec16().unwrap_or_default();
        if !extensions_carry_srtp_profile(&ext) {
            return Err(Error::ErrNoSrtpProfile);
        }

        Ok(ClientHello { random, cookie })
    }
}

/// HelloVerifyRequest carries the stateless cookie (RFC 6347
/// section 4.2.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub cookie: Vec<u8>,
}

impl HelloVerifyRequest {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        push_u16(&mut out, PROTOCOL_VERSION);
        out.push(self.cookie.len() as u8);
        out.extend_from_slice(&self.cookie);
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        let mut r = Reader::new(b);
        let _version = r.u16()?;
        let cookie = r.vec8()?;
        Ok(HelloVerifyRequest { cookie })
    }
}

/// ServerHello pinned to the one suite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_LENGTH],
}

impl ServerHello {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        push_u16(&mut out, PROTOCOL_VERSION);
        out.extend_from_slice(&self.random);
        out.push(0); // session id
        push_u16(&mut out, CIPHER_SUITE_ID);
        out.push(0); // null compression

        let ext = marshal_extensions(false);
        push_u16(&mut out, ext.len() as u16);
        out.extend_from_slice(&ext);
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        let mut r = Reader::new(b);
        let version = r.u16()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::ErrUnsupportedProtocolVersion);
        }

        let mut random = [0u8; RANDOM_LENGTH];
        random.copy_from_slice(r.take(RANDOM_LENGTH)?);

        let _session = r.vec8()?;
        let suite = r.u16()?;
        if suite != CIPHER_SUITE_ID {
            return Err(Error::ErrNoSharedCipherSuite);
        }
        let _compression = r.u8()?;

        let ext = r.vec16().unwrap_or_default();
        if !extensions_carry_srtp_profile(&ext) {
            return Err(Error::ErrNoSrtpProfile);
        }

        Ok(ServerHello { random })
    }
}

/// Certificate carries one self-signed DER certificate; trust is the
/// SDP fingerprint, not a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMsg {
    pub certificate: Vec<u8>,
}

impl CertificateMsg {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        push_u24(&mut out, self.certificate.len() + 3);
        push_u24(&mut out, self.certificate.len());
        out.extend_from_slice(&self.certificate);
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        let mut r = Reader::new(b);
        let total = r.u24()? as usize;
        if total == 0 {
            return Err(Error::ErrNoCertificate);
        }
        let len = r.u24()? as usize;
        let certificate = r.take(len)?.to_vec();
        Ok(CertificateMsg { certificate })
    }
}

/// ServerKeyExchange: named-curve ECDHE params plus an ECDSA
/// signature over client_random || server_random || params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl ServerKeyExchange {
    /// params_bytes is the signed portion.
    pub fn params_bytes(public_key: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        out.push(3); // named_curve
        push_u16(&mut out, NAMED_GROUP_P256);
        out.push(public_key.len() as u8);
        out.extend_from_slice(public_key);
        out
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Self::params_bytes(&self.public_key);
        push_u16(&mut out, SIG_SCHEME_ECDSA_P256_SHA256);
        push_u16(&mut out, self.signature.len() as u16);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        let mut r = Reader::new(b);
        let curve_type = r.u8()?;
        let group = r.u16()?;
        if curve_type != 3 || group != NAMED_GROUP_P256 {
            return Err(Error::ErrBufferTooSmall("unexpected ecdhe group"));
        }
        let public_key = r.vec8()?;
        let scheme = r.u16()?;
        if scheme != SIG_SCHEME_ECDSA_P256_SHA256 {
            return Err(Error::ErrSignatureInvalid);
        }
        let signature = r.vec16()?;
        Ok(ServerKeyExchange {
            public_key,
            signature,
        })
    }
}

/// CertificateRequest asking for an ECDSA client certificate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertificateRequest;

impl CertificateRequest {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        out.push(1); // one certificate type
        out.push(64); // ecdsa_sign
        push_u16(&mut out, 2);
        push_u16(&mut out, SIG_SCHEME_ECDSA_P256_SHA256);
        push_u16(&mut out, 0); // no CA names
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        let mut r = Reader::new(b);
        let _types = r.vec8()?;
        let _schemes = r.vec16()?;
        let _cas = r.vec16()?;
        Ok(CertificateRequest)
    }
}

/// ClientKeyExchange: the client's ephemeral ECDH point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKeyExchange {
    pub public_key: Vec<u8>,
}

impl ClientKeyExchange {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        out.push(self.public_key.len() as u8);
        out.extend_from_slice(&self.public_key);
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        let mut r = Reader::new(b);
        let public_key = r.vec8()?;
        Ok(ClientKeyExchange { public_key })
    }
}

/// CertificateVerify: ECDSA over the running transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    pub signature: Vec<u8>,
}

impl CertificateVerify {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        push_u16(&mut out, SIG_SCHEME_ECDSA_P256_SHA256);
        push_u16(&mut out, self.signature.len() as u16);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        let mut r = Reader::new(b);
        let scheme = r.u16()?;
        if scheme != SIG_SCHEME_ECDSA_P256_SHA256 {
            return Err(Error::ErrSignatureInvalid);
        }
        let signature = r.vec16()?;
        Ok(CertificateVerify { signature })
    }
}

/// Finished carries the 12-byte verify_data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub verify_data: Vec<u8>,
}

impl Finished {
    pub fn marshal(&self) -> Vec<u8> {
        self.verify_data.clone()
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        Ok(Finished {
            verify_data: b.to_vec(),
        })
    }
}
