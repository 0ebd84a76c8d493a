use std::fmt;

use stun::attributes::ATTR_EVEN_PORT;
use stun::message::{Getter, Message, Setter};

/// EvenPort is the EVEN-PORT attribute: request an even relay port,
/// optionally reserving the next (odd) one for a follow-up Allocate.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct EvenPort {
    /// reserve_port is the R bit.
    pub reserve_port: bool,
}

impl fmt::Display for EvenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reserve_port {
            write!(f, "reserve: true")
        } else {
            write!(f, "reserve: false")
        }
    }
}

impl Setter for EvenPort {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        let v = [if self.reserve_port { 0x80u8 } else { 0x00 }];
        m.append(ATTR_EVEN_PORT, &v);
        Ok(())
    }
}

impl Getter for EvenPort {
    fn get_from(&mut self, m: &Message) -> stun::Result<()> {
        let v = m.get(ATTR_EVEN_PORT)?;
        if v.is_empty() {
            return Err(stun::Error::ErrAttributeSizeInvalid);
        }
        self.reserve_port = v[0] & 0x80 != 0;
        Ok(())
    }
}
