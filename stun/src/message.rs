
use std::fmt;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::Rng;

use crate::attributes::*;
use crate::{Error, Result};

/// The magic cookie separates STUN from everything else sharing the
/// port; fixed to 0x2112A442 in network order (RFC 5389 section 6).
pub const MAGIC_COOKIE: u32 = 0x2112A442;
pub const ATTRIBUTE_HEADER_SIZE: usize = 4;
pub const MESSAGE_HEADER_SIZE: usize = 20;
pub const TRANSACTION_ID_SIZE: usize = 12;

/// Setter writes an attribute (or header field) into a Message.
pub trait Setter: Send + Sync {
    fn add_to(&self, m: &mut Message) -> Result<()>;
}

/// Getter parses an attribute out of a Message.
pub trait Getter {
    fn get_from(&mut self, m: &Message) -> Result<()>;
}

/// Checker validates a Message property (integrity, fingerprint).
pub trait Checker {
    fn check(&self, m: &Message) -> Result<()>;
}

/// is_message is the demultiplexer test: long enough for a header
/// and carrying the cookie. It promises nothing about decodability.
pub fn is_message(b: &[u8]) -> bool {
    b.len() >= MESSAGE_HEADER_SIZE && u32::from_be_bytes([b[4], b[5], b[6], b[7]]) == MAGIC_COOKIE
}

#[derive(Default, Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct TransactionId(pub [u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    /// new returns a random 96-bit transaction id.
    pub fn new() -> Self {
        let mut id = TransactionId([0u8; TRANSACTION_ID_SIZE]);
        rand::thread_rng().fill(&mut id.0);
        id
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl Setter for TransactionId {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.transaction_id = *self;
        m.write_transaction_id();
        Ok(())
    }
}

/// MessageClass is the 2-bit request/indication/response class.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct MessageClass(pub u8);

pub const CLASS_REQUEST: MessageClass = MessageClass(0x00);
pub const CLASS_INDICATION: MessageClass = MessageClass(0x01);
pub const CLASS_SUCCESS_RESPONSE: MessageClass = MessageClass(0x02);
pub const CLASS_ERROR_RESPONSE: MessageClass = MessageClass(0x03);

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            CLASS_REQUEST => "request",
            CLASS_INDICATION => "indication",
            CLASS_SUCCESS_RESPONSE => "success response",
            CLASS_ERROR_RESPONSE => "error response",
            _ => "unknown class",
        })
    }
}

/// Method is the 12-bit STUN method.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct Method(pub u16);

pub const METHOD_BINDING: Method = Method(0x001);
pub const METHOD_ALLOCATE: Method = Method(0x003);
pub const METHOD_REFRESH: Method = Method(0x004);
pub const METHOD_SEND: Method = Method(0x006);
pub const METHOD_DATA: Method = Method(0x007);
pub const METHOD_CREATE_PERMISSION: Method = Method(0x008);
pub const METHOD_CHANNEL_BIND: Method = Method(0x009);

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            METHOD_BINDING => f.write_str("Binding"),
            METHOD_ALLOCATE => f.write_str("Allocate"),
            METHOD_REFRESH => f.write_str("Refresh"),
            METHOD_SEND => f.write_str("Send"),
            METHOD_DATA => f.write_str("Data"),
            METHOD_CREATE_PERMISSION => f.write_str("CreatePermission"),
            METHOD_CHANNEL_BIND => f.write_str("ChannelBind"),
            other => write!(f, "0x{:x}", other.0),
        }
    }
}

// The class bits C1/C0 interleave into the method at positions 8 and
// 4 of the encoded 14-bit type (RFC 5389 section 6).
const M_A: u16 = 0b0000_1111_1000_0000;
const M_B: u16 = 0b0000_0000_0111_0000;
const M_D: u16 = 0b0000_0000_0000_1111;

/// MessageType is method plus class.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

pub const BINDING_REQUEST: MessageType = MessageType {
    method: METHOD_BINDING,
    class: CLASS_REQUEST,
};
pub const BINDING_SUCCESS: MessageType = MessageType {
    method: METHOD_BINDING,
    class: CLASS_SUCCESS_RESPONSE,
};
pub const BINDING_ERROR: MessageType = MessageType {
    method: METHOD_BINDING,
    class: CLASS_ERROR_RESPONSE,
};

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.class)
    }
}

impl Setter for MessageType {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.set_type(*self);
        Ok(())
    }
}

impl MessageType {
    pub fn new(method: Method, class: MessageClass) -> Self {
        MessageType { method, class }
    }

    /// value encodes method and class into the 16-bit wire form.
    pub fn value(&self) -> u16 {
        let m = self.method.0;
        let class = self.class.0 as u16;

        ((m & M_A) << 2)
            | ((m & M_B) << 1)
            | (m & M_D)
            | ((class & 0x1) << 4)
            | ((class & 0x2) << 7)
    }

    /// read_value is the inverse of value().
    pub fn read_value(&mut self, v: u16) {
        let c0 = (v >> 4) & 0x1;
        let c1 = (v >> 7) & 0x2;
        self.class = MessageClass((c0 | c1) as u8);
        self.method = Method(((v >> 2) & M_A) | ((v >> 1) & M_B) | (v & M_D));
    }
}

const INITIAL_RAW_CAPACITY: usize = 120;

/// Message is one STUN packet. The raw wire image is kept in lockstep
/// with the parsed attribute list, because MESSAGE-INTEGRITY and
/// FINGERPRINT hash the exact bytes that precede them.
#[derive(Default, Debug, Clone)]
pub struct Message {
    pub typ: MessageType,
    pub length: u32, // attribute bytes, header excluded
    pub transaction_id: TransactionId,
    pub attributes: Attributes,
    pub raw: Vec<u8>,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} l={} attrs={} id={}",
            self.typ,
            self.length,
            self.attributes.0.len(),
            self.transaction_id
        )
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        // raw is a cache, not identity
        self.typ == other.typ
            && self.transaction_id == other.transaction_id
            && self.length == other.length
            && self.attributes == other.attributes
    }
}

impl Setter for Message {
    /// Copying a request into a response seeds its transaction id.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.transaction_id = self.transaction_id;
        m.write_transaction_id();
        Ok(())
    }
}

impl Message {
    pub fn new() -> Self {
        let mut raw = Vec::with_capacity(INITIAL_RAW_CAPACITY);
        raw.resize(MESSAGE_HEADER_SIZE, 0);
        Message {
            raw,
            ..Default::default()
        }
    }

    pub fn new_transaction_id(&mut self) {
        self.transaction_id = TransactionId::new();
        self.write_transaction_id();
    }

    /// reset empties the message back to a zeroed header.
    pub fn reset(&mut self) {
        self.raw.clear();
        self.raw.resize(MESSAGE_HEADER_SIZE, 0);
        self.length = 0;
        self.typ = MessageType::default();
        self.transaction_id = TransactionId::default();
        self.attributes.0.clear();
    }

    /// append adds one attribute TLV, padding the value out to the
    /// 4-byte boundary the wire format demands.
    pub fn append(&mut self, t: AttrType, value: &[u8]) {
        let offset = MESSAGE_HEADER_SIZE + self.length as usize;
        let padded = nearest_padded_value_length(value.len());

        self.raw.resize(offset + ATTRIBUTE_HEADER_SIZE + padded, 0);
        self.raw[offset..offset + 2].copy_from_slice(&t.value().to_be_bytes());
        self.raw[offset + 2..offset + 4].copy_from_slice(&(value.len() as u16).to_be_bytes());
        self.raw[offset + ATTRIBUTE_HEADER_SIZE..offset + ATTRIBUTE_HEADER_SIZE + value.len()]
            .copy_from_slice(value);

        self.length += (ATTRIBUTE_HEADER_SIZE + padded) as u32;
        self.write_length();

        self.attributes.0.push(RawAttribute {
            typ: t,
            length: value.len() as u16,
            value: value.to_vec(),
        });
    }

    /// get returns a copy of the first value of type t.
    pub fn get(&self, t: AttrType) -> Result<Vec<u8>> {
        self.attributes
            .get(t)
            .map(|a| a.value.clone())
            .ok_or(Error::ErrAttributeNotFound)
    }

    pub fn contains(&self, t: AttrType) -> bool {
        self.attributes.contains(t)
    }

    /// build resets the message and applies the setters in order.
    pub fn build(&mut self, setters: &[Box<dyn Setter>]) -> Result<()> {
        self.reset();
        self.write_header();
        for s in setters {
            s.add_to(self)?;
        }
        Ok(())
    }

    pub fn write_length(&mut self) {
        self.raw[2..4].copy_from_slice(&(self.length as u16).to_be_bytes());
    }

    pub fn write_type(&mut self) {
        self.raw[..2].copy_from_slice(&self.typ.value().to_be_bytes());
    }

    pub fn set_type(&mut self, t: MessageType) {
        self.typ = t;
        self.write_type();
    }

    pub fn write_transaction_id(&mut self) {
        self.raw[8..MESSAGE_HEADER_SIZE].copy_from_slice(&self.transaction_id.0);
    }

    pub fn write_header(&mut self) {
        if self.raw.len() < MESSAGE_HEADER_SIZE {
            self.raw.resize(MESSAGE_HEADER_SIZE, 0);
        }
        self.write_type();
        self.write_length();
        self.raw[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        self.write_transaction_id();
    }

    /// encode refreshes the header bytes; append keeps the rest in
    /// sync as it goes.
    pub fn encode(&mut self) {
        self.write_header();
    }

    /// read_from replaces this message with the decoded content of
    /// data.
    pub fn read_from(&mut self, data: &[u8]) -> Result<()> {
        self.raw.clear();
        self.raw.extend_from_slice(data);
        self.decode()
    }

    /// decode parses self.raw into the typed fields.
    pub fn decode(&mut self) -> Result<()> {
        if self.raw.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::ErrUnexpectedHeaderEof);
        }

        let cookie = u32::from_be_bytes([self.raw[4], self.raw[5], self.raw[6], self.raw[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::ErrInvalidMagicCookie);
        }

        let typ = u16::from_be_bytes([self.raw[0], self.raw[1]]);
        let length = u16::from_be_bytes([self.raw[2], self.raw[3]]) as usize;
        if self.raw.len() < MESSAGE_HEADER_SIZE + length {
            return Err(Error::ErrBufferTooSmall);
        }

        self.typ.read_value(typ);
        self.length = length as u32;
        self.transaction_id
            .0
            .copy_from_slice(&self.raw[8..MESSAGE_HEADER_SIZE]);
        self.attributes.0.clear();

        let body = &self.raw[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + length];
        let mut pos = 0;
        while pos < length {
            if length - pos < ATTRIBUTE_HEADER_SIZE {
                return Err(Error::ErrBufferTooSmall);
            }
            let typ = AttrType(u16::from_be_bytes([body[pos], body[pos + 1]]));
            let value_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
            let padded = nearest_padded_value_length(value_len);

            pos += ATTRIBUTE_HEADER_SIZE;
            if padded > length - pos {
                return Err(Error::ErrBufferTooSmall);
            }

            self.attributes.0.push(RawAttribute {
                typ,
                length: value_len as u16,
                value: body[pos..pos + value_len].to_vec(),
            });
            pos += padded;
        }

        Ok(())
    }

    /// attr_offset locates the first attribute of type t inside raw,
    /// for the checks that hash everything before it.
    pub(crate) fn attr_offset(&self, t: AttrType) -> Option<usize> {
        let length = self.length as usize;
        let body = &self.raw[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + length];
        let mut pos = 0;

        while pos + ATTRIBUTE_HEADER_SIZE <= length {
            let typ = AttrType(u16::from_be_bytes([body[pos], body[pos + 1]]));
            if typ == t {
                return Some(MESSAGE_HEADER_SIZE + pos);
            }
            let value_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
            pos += ATTRIBUTE_HEADER_SIZE + nearest_padded_value_length(value_len);
        }

        None
    }
}

pub(crate) fn nearest_padded_value_length(l: usize) -> usize {
    (l + 3) & !3
}
