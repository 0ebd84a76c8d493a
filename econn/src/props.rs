#[cfg(test)]
mod props_test;

use std::fmt;

use serde_json::{Map, Value};

/// Properties is the string-keyed bag SETUP and PROPSYNC carry for
/// in-call toggles (`videosend`, `audiocbr`, ...). Insertion order is
/// preserved so serialization stays deterministic, and keys this
/// stack does not know survive a round-trip untouched.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Properties {
    dict: Map<String, Value>,
}

impl Properties {
    pub fn new() -> Self {
        Properties { dict: Map::new() }
    }

    /// add appends a key; an existing key keeps its position and gets
    /// the new value.
    pub fn add(&mut self, key: &str, val: &str) {
        self.dict
            .insert(key.to_owned(), Value::String(val.to_owned()));
    }

    /// update is add with the original's name; both C-era call sites
    /// survive.
    pub fn update(&mut self, key: &str, val: &str) {
        self.add(key, val);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.dict.get(key).and_then(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    /// iter yields entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.dict.iter()
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Object(self.dict.clone())
    }

    pub(crate) fn from_value(v: &Value) -> Option<Self> {
        v.as_object().map(|dict| Properties { dict: dict.clone() })
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.dict.clone()))
    }
}
