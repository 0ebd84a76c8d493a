use std::fmt;
use std::time::Duration;

use stun::attributes::ATTR_LIFETIME;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

const LIFETIME_SIZE: usize = 4;

/// DEFAULT_LIFETIME is the allocation lifetime handed out when the
/// client does not ask for one.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

/// Lifetime is the LIFETIME attribute, whole seconds on the wire.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct Lifetime(pub Duration);

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0.as_secs())
    }
}

impl Setter for Lifetime {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        let v = (self.0.as_secs() as u32).to_be_bytes();
        m.append(ATTR_LIFETIME, &v);
        Ok(())
    }
}

impl Getter for Lifetime {
    fn get_from(&mut self, m: &Message) -> stun::Result<()> {
        let v = m.get(ATTR_LIFETIME)?;
        check_size(ATTR_LIFETIME, v.len(), LIFETIME_SIZE)?;
        let secs = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        self.0 = Duration::from_secs(secs as u64);
        Ok(())
    }
}
