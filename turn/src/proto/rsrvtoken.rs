use stun::attributes::ATTR_RESERVATION_TOKEN;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

const RESERVATION_TOKEN_SIZE: usize = 8;

/// ReservationToken is the RESERVATION-TOKEN attribute: an opaque
/// 8-byte handle to a port reservation made with EVEN-PORT.
#[derive(Default, PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub struct ReservationToken(pub [u8; RESERVATION_TOKEN_SIZE]);

impl Setter for ReservationToken {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        m.append(ATTR_RESERVATION_TOKEN, &self.0);
        Ok(())
    }
}

impl Getter for ReservationToken {
    fn get_from(&mut self, m: &Message) -> stun::Result<()> {
        let v = m.get(ATTR_RESERVATION_TOKEN)?;
        check_size(ATTR_RESERVATION_TOKEN, v.len(), RESERVATION_TOKEN_SIZE)?;
        self.0.copy_from_slice(&v);
        Ok(())
    }
}
