#[cfg(test)]
mod uri_test;

use std::fmt;

use crate::{Error, Result};

/// SchemeType is the scheme of a STUN or TURN server URI.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum SchemeType {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl SchemeType {
    pub fn is_secure(&self) -> bool {
        matches!(self, SchemeType::Stuns | SchemeType::Turns)
    }
}

impl std::str::FromStr for SchemeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stun" => Ok(SchemeType::Stun),
            "stuns" => Ok(SchemeType::Stuns),
            "turn" => Ok(SchemeType::Turn),
            "turns" => Ok(SchemeType::Turns),
            _ => Err(Error::ErrSchemeType(s.to_owned())),
        }
    }
}

impl fmt::Display for SchemeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchemeType::Stun => "stun",
            SchemeType::Stuns => "stuns",
            SchemeType::Turn => "turn",
            SchemeType::Turns => "turns",
        };
        write!(f, "{s}")
    }
}

/// ProtoType is the transport carried in the `?transport=` parameter.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum ProtoType {
    Udp,
    Tcp,
}

impl fmt::Display for ProtoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoType::Udp => write!(f, "udp"),
            ProtoType::Tcp => write!(f, "tcp"),
        }
    }
}

/// Uri is a parsed `stun:` / `stuns:` / `turn:` / `turns:` URI
/// (RFC 7064 / RFC 7065).
#[derive(Debug, Clone)]
pub struct Uri {
    pub scheme: SchemeType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub proto: ProtoType,
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains("::") {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        write!(f, "{}:{}:{}", self.scheme, host, self.port)?;
        if matches!(self.scheme, SchemeType::Turn | SchemeType::Turns) {
            write!(f, "?transport={}", self.proto)?;
        }
        Ok(())
    }
}

impl Uri {
    /// parse_uri accepts the RFC 7064/7065 forms; credentials are
    /// never part of the URI and come from configuration.
    pub fn parse_uri(raw: &str) -> Result<Uri> {
        // work around url::Url treating `stun:` as opaque
        let (scheme_str, rest) = raw
            .split_once(':')
            .ok_or_else(|| Error::ErrInvalidUrl(raw.to_owned()))?;
        let scheme: SchemeType = scheme_str.parse()?;

        let parsed = url::Url::parse(&format!("scheme://{rest}"))
            .map_err(|_| Error::ErrInvalidUrl(raw.to_owned()))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::ErrInvalidUrl(raw.to_owned()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();

        let port = parsed.port().unwrap_or(match scheme {
            SchemeType::Stun | SchemeType::Turn => 3478,
            SchemeType::Stuns | SchemeType::Turns => 5349,
        });

        let mut proto = if scheme.is_secure() {
            ProtoType::Tcp
        } else {
            ProtoType::Udp
        };
        for (k, v) in parsed.query_pairs() {
            if k == "transport" {
                proto = match &*v {
                    "udp" => ProtoType::Udp,
                    "tcp" => ProtoType::Tcp,
                    _ => return Err(Error::ErrInvalidUrl(raw.to_owned())),
                };
            }
        }

        Ok(Uri {
            scheme,
            host,
            port,
            username: String::new(),
            password: String::new(),
            proto,
        })
    }
}
