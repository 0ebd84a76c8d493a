#[cfg(test)]
mod error_code_test;

use std::fmt;

use crate::attributes::*;
use crate::checks::*;
use crate::message::*;
use crate::{Error, Result};

const ERROR_CODE_MODULO: u16 = 100;
const MAX_REASON_B: usize = 763;

/// ErrorCode is a STUN error code with its class/number wire split
/// (RFC 5389 section 15.6).
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct ErrorCode(pub u16);

pub const CODE_TRY_ALTERNATE: ErrorCode = ErrorCode(300);
pub const CODE_BAD_REQUEST: ErrorCode = ErrorCode(400);
pub const CODE_UNAUTHORIZED: ErrorCode = ErrorCode(401);
pub const CODE_UNKNOWN_ATTRIBUTE: ErrorCode = ErrorCode(420);
pub const CODE_STALE_NONCE: ErrorCode = ErrorCode(438);
pub const CODE_ROLE_CONFLICT: ErrorCode = ErrorCode(487);
pub const CODE_SERVER_ERROR: ErrorCode = ErrorCode(500);

// TURN error codes, RFC 5766 section 15.
pub const CODE_FORBIDDEN: ErrorCode = ErrorCode(403);
pub const CODE_ALLOC_MISMATCH: ErrorCode = ErrorCode(437);
pub const CODE_WRONG_CREDENTIALS: ErrorCode = ErrorCode(441);
pub const CODE_UNSUPPORTED_TRANS_PROTO: ErrorCode = ErrorCode(442);
pub const CODE_PEER_ADDR_FAMILY_MISMATCH: ErrorCode = ErrorCode(443);
pub const CODE_ALLOC_QUOTA_REACHED: ErrorCode = ErrorCode(486);
pub const CODE_INSUFFICIENT_CAPACITY: ErrorCode = ErrorCode(508);

impl ErrorCode {
    pub fn default_reason(&self) -> &'static str {
        match *self {
            CODE_TRY_ALTERNATE => "Try Alternate",
            CODE_BAD_REQUEST => "Bad Request",
            CODE_UNAUTHORIZED => "Unauthorized",
            CODE_UNKNOWN_ATTRIBUTE => "Unknown Attribute",
            CODE_STALE_NONCE => "Stale Nonce",
            CODE_ROLE_CONFLICT => "Role Conflict",
            CODE_SERVER_ERROR => "Server Error",
            CODE_FORBIDDEN => "Forbidden",
            CODE_ALLOC_MISMATCH => "Allocation Mismatch",
            CODE_WRONG_CREDENTIALS => "Wrong Credentials",
            CODE_UNSUPPORTED_TRANS_PROTO => "Unsupported Transport Protocol",
            CODE_PEER_ADDR_FAMILY_MISMATCH => "Peer Address Family Mismatch",
            CODE_ALLOC_QUOTA_REACHED => "Allocation Quota Reached",
            CODE_INSUFFICIENT_CAPACITY => "Insufficient Capacity",
            _ => "Unknown Error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.default_reason())
    }
}

/// ErrorCodeAttribute is the ERROR-CODE attribute value.
#[derive(Default, PartialEq, Eq, Debug, Clone)]
pub struct ErrorCodeAttribute {
    pub code: ErrorCode,
    pub reason: String,
}

impl ErrorCodeAttribute {
    pub fn new(code: ErrorCode) -> Self {
        ErrorCodeAttribute {
            code,
            reason: code.default_reason().to_owned(),
        }
    }
}

impl fmt::Display for ErrorCodeAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.0, self.reason)
    }
}

impl Setter for ErrorCodeAttribute {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        check_overflow(ATTR_ERROR_CODE, self.reason.len() + 4, MAX_REASON_B + 4)?;

        let mut value: Vec<u8> = Vec::with_capacity(4 + self.reason.len());
        let number = (self.code.0 % ERROR_CODE_MODULO) as u8;
        let class = (self.code.0 / ERROR_CODE_MODULO) as u8;
        value.extend_from_slice(&[0, 0, class, number]);
        value.extend_from_slice(self.reason.as_bytes());

        m.append(ATTR_ERROR_CODE, &value);
        Ok(())
    }
}

impl Getter for ErrorCodeAttribute {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_ERROR_CODE)?;
        if v.len() < 4 {
            return Err(Error::ErrAttributeSizeInvalid);
        }

        let class = v[2] as u16;
        let number = v[3] as u16;
        self.code = ErrorCode(class * ERROR_CODE_MODULO + number);
        self.reason = String::from_utf8(v[4..].to_vec())
            .map_err(|_| Error::ErrBadErrorCodeReason)?;

        Ok(())
    }
}
