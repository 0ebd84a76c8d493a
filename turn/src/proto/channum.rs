use std::fmt;

use stun::attributes::ATTR_CHANNEL_NUMBER;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

use crate::{Error, Result};

pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;
pub const MAX_CHANNEL_NUMBER: u16 = 0x7FFF;

const CHANNEL_NUMBER_SIZE: usize = 4;

/// ChannelNumber is the CHANNEL-NUMBER attribute; valid values are
/// confined to 0x4000..=0x7FFF (RFC 5766 section 11).
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone, Hash, PartialOrd, Ord)]
pub struct ChannelNumber(pub u16);

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CN 0x{:x}", self.0)
    }
}

impl ChannelNumber {
    pub fn valid(&self) -> bool {
        (MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&self.0)
    }
}

impl Setter for ChannelNumber {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        let mut v = [0u8; CHANNEL_NUMBER_SIZE];
        v[..2].copy_from_slice(&self.0.to_be_bytes());
        // the second half is RFFU, zero on send
        m.append(ATTR_CHANNEL_NUMBER, &v);
        Ok(())
    }
}

impl Getter for ChannelNumber {
    fn get_from(&mut self, m: &Message) -> stun::Result<()> {
        let v = m.get(ATTR_CHANNEL_NUMBER)?;
        check_size(ATTR_CHANNEL_NUMBER, v.len(), CHANNEL_NUMBER_SIZE)?;
        self.0 = u16::from_be_bytes([v[0], v[1]]);
        Ok(())
    }
}

impl ChannelNumber {
    /// checked_from validates the range on top of parsing.
    pub fn checked_from(m: &Message) -> Result<Self> {
        let mut n = ChannelNumber::default();
        n.get_from(m).map_err(Error::Stun)?;
        if !n.valid() {
            return Err(Error::ErrChannelNumberOutOfRange);
        }
        Ok(n)
    }
}
