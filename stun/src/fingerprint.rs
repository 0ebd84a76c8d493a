#[cfg(test)]
mod fingerprint_test;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::attributes::*;
use crate::message::*;
use crate::{Error, Result};

/// FINGERPRINT is crc32 of the preceding bytes xored with 0x5354554e
/// (RFC 5389 section 15.5). It must be the last attribute.
#[derive(Default, Debug, Clone, Copy)]
pub struct FingerprintAttr;

pub const FINGERPRINT: FingerprintAttr = FingerprintAttr;

pub const FINGERPRINT_XOR_VALUE: u32 = 0x5354554e;
pub const FINGERPRINT_SIZE: usize = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn fingerprint_value(b: &[u8]) -> u32 {
    CRC32.checksum(b) ^ FINGERPRINT_XOR_VALUE
}

impl Setter for FingerprintAttr {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let length = m.length;
        m.length += (FINGERPRINT_SIZE + ATTRIBUTE_HEADER_SIZE) as u32;
        m.write_length();
        let v = fingerprint_value(&m.raw);
        m.length = length;

        m.append(ATTR_FINGERPRINT, &v.to_be_bytes());
        Ok(())
    }
}

impl Checker for FingerprintAttr {
    fn check(&self, m: &Message) -> Result<()> {
        let offset = m
            .attr_offset(ATTR_FINGERPRINT)
            .ok_or(Error::ErrAttributeNotFound)?;
        let b = m.get(ATTR_FINGERPRINT)?;
        if b.len() != FINGERPRINT_SIZE {
            return Err(Error::ErrAttributeSizeInvalid);
        }

        let val = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);

        let mut input = m.raw[..offset].to_vec();
        let patched_len = offset - MESSAGE_HEADER_SIZE + ATTRIBUTE_HEADER_SIZE + FINGERPRINT_SIZE;
        input[2..4].copy_from_slice(&(patched_len as u16).to_be_bytes());

        if fingerprint_value(&input) != val {
            return Err(Error::ErrFingerprintMismatch);
        }

        Ok(())
    }
}
