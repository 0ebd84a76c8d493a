use stun::attributes::ATTR_DATA;
use stun::message::{Getter, Message, Setter};

/// Data is the DATA attribute: the raw datagram inside Send and Data
/// indications.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Data(pub Vec<u8>);

impl Setter for Data {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        m.append(ATTR_DATA, &self.0);
        Ok(())
    }
}

impl Getter for Data {
    fn get_from(&mut self, m: &Message) -> stun::Result<()> {
        self.0 = m.get(ATTR_DATA)?;
        Ok(())
    }
}
