use std::fmt;

use crate::attributes::*;
use crate::checks::*;
use crate::message::*;
use crate::Result;

const MAX_USERNAME_B: usize = 513;
const MAX_REALM_B: usize = 763;
const MAX_SOFTWARE_B: usize = 763;
const MAX_NONCE_B: usize = 763;

/// TextAttribute is a textual STUN attribute; type aliases below pin
/// the attribute type per RFC 5389 section 15.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct TextAttribute {
    pub attr: AttrType,
    pub text: String,
}

/// Username is the USERNAME attribute.
pub type Username = TextAttribute;
/// Realm is the REALM attribute.
pub type Realm = TextAttribute;
/// Nonce is the NONCE attribute.
pub type Nonce = TextAttribute;
/// Software is the SOFTWARE attribute.
pub type Software = TextAttribute;

impl fmt::Display for TextAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl Setter for TextAttribute {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let max_len = match self.attr {
            ATTR_USERNAME => MAX_USERNAME_B,
            ATTR_REALM => MAX_REALM_B,
            ATTR_SOFTWARE => MAX_SOFTWARE_B,
            ATTR_NONCE => MAX_NONCE_B,
            _ => usize::MAX,
        };

        check_overflow(self.attr, self.text.len(), max_len)?;
        m.append(self.attr, self.text.as_bytes());
        Ok(())
    }
}

impl TextAttribute {
    pub fn new(attr: AttrType, text: String) -> Self {
        TextAttribute { attr, text }
    }

    /// get_from_as reads the attribute of type t as UTF-8 text.
    pub fn get_from_as(m: &Message, t: AttrType) -> Result<Self> {
        let v = m.get(t)?;
        let text = String::from_utf8_lossy(&v).to_string();
        Ok(TextAttribute { attr: t, text })
    }
}
