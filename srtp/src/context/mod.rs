#[cfg(test)]
mod context_test;

use std::collections::HashMap;

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::protection_profile::ProtectionProfile;
use crate::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

const LABEL_SRTP_ENCRYPTION: u8 = 0x00;
const LABEL_SRTP_AUTH: u8 = 0x01;
const LABEL_SRTP_SALT: u8 = 0x02;
const LABEL_SRTCP_ENCRYPTION: u8 = 0x03;
const LABEL_SRTCP_AUTH: u8 = 0x04;
const LABEL_SRTCP_SALT: u8 = 0x05;

const RTP_FIXED_HEADER_LEN: usize = 12;
const RTCP_HEADER_LEN: usize = 8;
const SRTCP_INDEX_SIZE: usize = 4;
const REPLAY_WINDOW: u64 = 64;
const SEQ_MAX: u32 = 1 << 16;

/// aes_cm_key_derivation is the RFC 3711 section 4.3 KDF with a key
/// derivation rate of zero.
fn aes_cm_key_derivation(
    label: u8,
    master_key: &[u8],
    master_salt: &[u8],
    out_len: usize,
) -> Vec<u8> {
    let mut prf_in = [0u8; 16];
    prf_in[..master_salt.len()].copy_from_slice(master_salt);
    prf_in[7] ^= label;

    let cipher = Aes128::new_from_slice(master_key).expect("aes-128 key is 16 bytes");

    let n_blocks = out_len.div_ceil(16);
    let mut out = Vec::with_capacity(n_blocks * 16);
    for i in 0..n_blocks {
        let mut block = prf_in;
        BigEndian::write_u16(&mut block[14..], i as u16);
        let mut ga = aes::cipher::generic_array::GenericArray::from(block);
        cipher.encrypt_block(&mut ga);
        out.extend_from_slice(&ga);
    }
    out.truncate(out_len);
    out
}

struct SessionKeysDerived {
    srtp_key: Vec<u8>,
    srtp_salt: Vec<u8>,
    srtp_auth: HmacSha1,
    srtcp_key: Vec<u8>,
    srtcp_salt: Vec<u8>,
    srtcp_auth: HmacSha1,
}

struct SrtpStream {
    rollover_counter: u32,
    highest_seq: u16,
    started: bool,
    replay_mask: u64,
}

impl SrtpStream {
    fn new() -> Self {
        SrtpStream {
            rollover_counter: 0,
            highest_seq: 0,
            started: false,
            replay_mask: 0,
        }
    }

    /// guess_roc implements the index estimation of RFC 3711
    /// Appendix A against the highest sequence seen.
    fn guess_roc(&self, seq: u16) -> u32 {
        if !self.started {
            return 0;
        }
        let s_l = self.highest_seq as u32;
        let seq = seq as u32;

        if s_l < SEQ_MAX / 2 {
            if seq > s_l + SEQ_MAX / 2 {
                self.rollover_counter.wrapping_sub(1)
            } else {
                self.rollover_counter
            }
        } else if seq < s_l.wrapping_sub(SEQ_MAX / 2) {
            self.rollover_counter.wrapping_add(1)
        } else {
            self.rollover_counter
        }
    }

    fn update(&mut self, seq: u16, roc: u32) {
        if !self.started {
            self.started = true;
            self.highest_seq = seq;
            self.rollover_counter = roc;
            return;
        }
        if roc > self.rollover_counter
            || (roc == self.rollover_counter && seq > self.highest_seq)
        {
            self.highest_seq = seq;
            self.rollover_counter = roc;
        }
    }

    /// check_replay tracks a 64-packet sliding window over the
    /// 48-bit index.
    fn check_replay(&mut self, index: u64) -> Result<()> {
        let latest =
            ((self.rollover_counter as u64) << 16) | self.highest_seq as u64;

        if !self.started || index > latest {
            self.replay_mask = if !self.started || index - latest >= REPLAY_WINDOW {
                1
            } else {
                (self.replay_mask << (index - latest)) | 1
            };
            return Ok(());
        }

        let diff = latest - index;
        if diff >= REPLAY_WINDOW {
            return Err(Error::ErrDuplicated);
        }
        if self.replay_mask & (1 << diff) != 0 {
            return Err(Error::ErrDuplicated);
        }
        self.replay_mask |= 1 << diff;
        Ok(())
    }
}

/// Context protects one direction of one call's media. Hold one for
/// sending with the local keys and one for receiving with the
/// remote's (RFC 3711).
pub struct Context {
    profile: ProtectionProfile,
    keys: SessionKeysDerived,
    srtp_streams: HashMap<u32, SrtpStream>,
    srtcp_index: u32,
    srtcp_replay: HashMap<u32, (u32, u64)>, // ssrc -> (highest index, mask)
}

impl Context {
    pub fn new(
        profile: ProtectionProfile,
        master_key: &[u8],
        master_salt: &[u8],
    ) -> Result<Self> {
        if master_key.len() != profile.key_len() || master_salt.len() != profile.salt_len() {
            return Err(Error::ErrBadKeyLength);
        }

        let srtp_key =
            aes_cm_key_derivation(LABEL_SRTP_ENCRYPTION, master_key, master_salt, 16);
        let srtp_salt = aes_cm_key_derivation(LABEL_SRTP_SALT, master_key, master_salt, 14);
        let srtp_auth_key = aes_cm_key_derivation(
            LABEL_SRTP_AUTH,
            master_key,
            master_salt,
            profile.auth_key_len(),
        );
        let srtcp_key =
            aes_cm_key_derivation(LABEL_SRTCP_ENCRYPTION, master_key, master_salt, 16);
        let srtcp_salt = aes_cm_key_derivation(LABEL_SRTCP_SALT, master_key, master_salt, 14);
        let srtcp_auth_key = aes_cm_key_derivation(
            LABEL_SRTCP_AUTH,
            master_key,
            master_salt,
            profile.auth_key_len(),
        );

        Ok(Context {
            profile,
            keys: SessionKeysDerived {
                srtp_key,
                srtp_salt,
                srtp_auth: Mac::new_from_slice(&srtp_auth_key)
                    .expect("hmac accepts any key length"),
                srtcp_key,
                srtcp_salt,
                srtcp_auth: Mac::new_from_slice(&srtcp_auth_key)
                    .expect("hmac accepts any key length"),
            },
            srtp_streams: HashMap::new(),
            srtcp_index: 0,
            srtcp_replay: HashMap::new(),
        })
    }

    fn stream(&mut self, ssrc: u32) -> &mut SrtpStream {
        self.srtp_streams.entry(ssrc).or_insert_with(SrtpStream::new)
    }

    /// ctr_iv builds the AES-CM IV: salt xor (ssrc << 64) xor
    /// (index << 16).
    fn ctr_iv(salt: &[u8], ssrc: u32, index: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..14].copy_from_slice(salt);

        let mut x = [0u8; 16];
        BigEndian::write_u32(&mut x[4..8], ssrc);
        BigEndian::write_u48(&mut x[8..14], index);
        for i in 0..16 {
            iv[i] ^= x[i];
        }
        iv
    }

    fn rtp_header_len(packet: &[u8]) -> Result<usize> {
        if packet.len() < RTP_FIXED_HEADER_LEN {
            return Err(Error::ErrBadRtpHeader);
        }
        let cc = (packet[0] & 0x0f) as usize;
        let has_ext = packet[0] & 0x10 != 0;
        let mut len = RTP_FIXED_HEADER_LEN + 4 * cc;

        if has_ext {
            if packet.len() < len + 4 {
                return Err(Error::ErrBadRtpHeader);
            }
            let ext_words = BigEndian::read_u16(&packet[len + 2..len + 4]) as usize;
            len += 4 + 4 * ext_words;
        }
        if packet.len() < len {
            return Err(Error::ErrBadRtpHeader);
        }
        Ok(len)
    }

    fn rtp_auth_tag(&mut self, data: &[u8], roc: u32) -> Vec<u8> {
        let mut roc_buf = [0u8; 4];
        BigEndian::write_u32(&mut roc_buf, roc);

        self.keys.srtp_auth.reset();
        self.keys.srtp_auth.update(data);
        self.keys.srtp_auth.update(&roc_buf);
        let full = self.keys.srtp_auth.finalize_reset().into_bytes();
        full[..self.profile.auth_tag_len()].to_vec()
    }

    /// protect_rtp encrypts the payload in place logic-wise and
    /// appends the truncated tag.
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let header_len = Self::rtp_header_len(packet)?;
        let ssrc = BigEndian::read_u32(&packet[8..12]);
        let seq = BigEndian::read_u16(&packet[2..4]);

        let (roc, index) = {
            let stream = self.stream(ssrc);
            let roc = stream.guess_roc(seq);
            stream.update(seq, roc);
            (roc, ((roc as u64) << 16) | seq as u64)
        };

        let mut out = packet.to_vec();
        let iv = Self::ctr_iv(&self.keys.srtp_salt, ssrc, index);
        let mut cipher = Aes128Ctr::new_from_slices(&self.keys.srtp_key, &iv)
            .map_err(|_| Error::ErrBadKeyLength)?;
        cipher.apply_keystream(&mut out[header_len..]);

        let tag = self.rtp_auth_tag(&out, roc);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// unprotect_rtp authenticates, replays-checks and decrypts.
    pub fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.profile.auth_tag_len();
        if packet.len() < RTP_FIXED_HEADER_LEN + tag_len {
            return Err(Error::ErrShortSrtpPacket);
        }

        let (body, tag) = packet.split_at(packet.len() - tag_len);
        let header_len = Self::rtp_header_len(body)?;
        let ssrc = BigEndian::read_u32(&body[8..12]);
        let seq = BigEndian::read_u16(&body[2..4]);

        let roc = self.stream(ssrc).guess_roc(seq);
        let index = ((roc as u64) << 16) | seq as u64;

        let expected = self.rtp_auth_tag(body, roc);
        if expected.ct_eq(tag).unwrap_u8() != 1 {
            return Err(Error::ErrAuthenticationFailed);
        }

        {
            let stream = self.stream(ssrc);
            stream.check_replay(index)?;
            stream.update(seq, roc);
        }

        let mut out = body.to_vec();
        let iv = Self::ctr_iv(&self.keys.srtp_salt, ssrc, index);
        let mut cipher = Aes128Ctr::new_from_slices(&self.keys.srtp_key, &iv)
            .map_err(|_| Error::ErrBadKeyLength)?;
        cipher.apply_keystream(&mut out[header_len..]);
        Ok(out)
    }

    /// protect_rtcp encrypts everything after the first 8 bytes and
    /// appends E-bit, index and tag (RFC 3711 section 3.4).
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < RTCP_HEADER_LEN {
            return Err(Error::ErrShortSrtcpPacket);
        }
        let ssrc = BigEndian::read_u32(&packet[4..8]);

        self.srtcp_index = (self.srtcp_index + 1) & 0x7fff_ffff;
        let index = self.srtcp_index;

        let mut out = packet.to_vec();
        let iv = Self::ctr_iv(&self.keys.srtcp_salt, ssrc, index as u64);
        let mut cipher = Aes128Ctr::new_from_slices(&self.keys.srtcp_key, &iv)
            .map_err(|_| Error::ErrBadKeyLength)?;
        cipher.apply_keystream(&mut out[RTCP_HEADER_LEN..]);

        let mut index_word = [0u8; SRTCP_INDEX_SIZE];
        BigEndian::write_u32(&mut index_word, index | 0x8000_0000); // E bit
        out.extend_from_slice(&index_word);

        self.keys.srtcp_auth.reset();
        self.keys.srtcp_auth.update(&out);
        let full = self.keys.srtcp_auth.finalize_reset().into_bytes();
        out.extend_from_slice(&full[..self.profile.auth_tag_len()]);
        Ok(out)
    }

    /// unprotect_rtcp verifies tag and replay, then decrypts.
    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.profile.auth_tag_len();
        let min = RTCP_HEADER_LEN + SRTCP_INDEX_SIZE + tag_len;
        if packet.len() < min {
            return Err(Error::ErrShortSrtcpPacket);
        }

        let (authed, tag) = packet.split_at(packet.len() - tag_len);

        self.keys.srtcp_auth.reset();
        self.keys.srtcp_auth.update(authed);
        let full = self.keys.srtcp_auth.finalize_reset().into_bytes();
        if full[..tag_len].ct_eq(tag).unwrap_u8() != 1 {
            return Err(Error::ErrAuthenticationFailed);
        }

        let index_word = BigEndian::read_u32(&authed[authed.len() - SRTCP_INDEX_SIZE..]);
        let encrypted = index_word & 0x8000_0000 != 0;
        let index = index_word & 0x7fff_ffff;
        let ssrc = BigEndian::read_u32(&packet[4..8]);

        // replay per sender ssrc
        let entry = self.srtcp_replay.entry(ssrc).or_insert((0, 0));
        let (highest, mask) = *entry;
        if index > highest {
            let shift = (index - highest) as u64;
            *entry = (
                index,
                if shift >= REPLAY_WINDOW {
                    1
                } else {
                    (mask << shift) | 1
                },
            );
        } else {
            let diff = (highest - index) as u64;
            if diff >= REPLAY_WINDOW || mask & (1 << diff) != 0 {
                return Err(Error::ErrDuplicated);
            }
            entry.1 |= 1 << diff;
        }

        let mut out = authed[..authed.len() - SRTCP_INDEX_SIZE].to_vec();
        if encrypted {
            let iv = Self::ctr_iv(&self.keys.srtcp_salt, ssrc, index as u64);
            let mut cipher = Aes128Ctr::new_from_slices(&self.keys.srtcp_key, &iv)
                .map_err(|_| Error::ErrBadKeyLength)?;
            cipher.apply_keystream(&mut out[RTCP_HEADER_LEN..]);
        }
        Ok(out)
    }
}
