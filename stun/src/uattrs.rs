use std::fmt;

use crate::attributes::*;
use crate::message::*;
use crate::{Error, Result};

/// UnknownAttributes is the UNKNOWN-ATTRIBUTES attribute carried in
/// 420 error responses.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct UnknownAttributes(pub Vec<AttrType>);

impl fmt::Display for UnknownAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<nil>")
        } else {
            let mut s = vec![];
            for t in &self.0 {
                s.push(t.to_string());
            }
            write!(f, "{}", s.join(", "))
        }
    }
}

impl Setter for UnknownAttributes {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let mut v = Vec::with_capacity(self.0.len() * 2);
        for t in &self.0 {
            v.extend_from_slice(&t.value().to_be_bytes());
        }
        m.append(ATTR_UNKNOWN_ATTRIBUTES, &v);
        Ok(())
    }
}

impl Getter for UnknownAttributes {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_UNKNOWN_ATTRIBUTES)?;
        if v.len() % 2 != 0 {
            return Err(Error::ErrBadUnknownAttrsSize);
        }
        self.0.clear();
        for chunk in v.chunks_exact(2) {
            self.0.push(AttrType(u16::from_be_bytes([chunk[0], chunk[1]])));
        }
        Ok(())
    }
}
