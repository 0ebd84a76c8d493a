use std::fmt;

use stun::attributes::ATTR_REQUESTED_ADDRESS_FAMILY;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

pub const REQUESTED_FAMILY_IPV4: RequestedAddressFamily = RequestedAddressFamily(0x01);
pub const REQUESTED_FAMILY_IPV6: RequestedAddressFamily = RequestedAddressFamily(0x02);

const REQUESTED_ADDRESS_FAMILY_SIZE: usize = 4;

/// RequestedAddressFamily is the REQUESTED-ADDRESS-FAMILY attribute
/// (RFC 6156); a Refresh carrying a family other than the
/// allocation's is answered with 443.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct RequestedAddressFamily(pub u8);

impl fmt::Display for RequestedAddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            REQUESTED_FAMILY_IPV4 => "IPv4",
            REQUESTED_FAMILY_IPV6 => "IPv6",
            _ => "unknown",
        };
        write!(f, "{s}")
    }
}

impl Setter for RequestedAddressFamily {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        let v = [self.0, 0, 0, 0];
        m.append(ATTR_REQUESTED_ADDRESS_FAMILY, &v);
        Ok(())
    }
}

impl Getter for RequestedAddressFamily {
    fn get_from(&mut self, m: &Message) -> stun::Result<()> {
        let v = m.get(ATTR_REQUESTED_ADDRESS_FAMILY)?;
        check_size(
            ATTR_REQUESTED_ADDRESS_FAMILY,
            v.len(),
            REQUESTED_ADDRESS_FAMILY_SIZE,
        )?;
        self.0 = v[0];
        Ok(())
    }
}
