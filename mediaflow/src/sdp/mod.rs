#[cfg(test)]
mod sdp_test;

use std::fmt;
use std::net::IpAddr;

use crate::{Error, Result};

/// Setup is the DTLS role attribute: offers say actpass, answers
/// pick active (default here) or passive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Setup {
    #[default]
    ActPass,
    Active,
    Passive,
}

impl Setup {
    pub fn name(&self) -> &'static str {
        match self {
            Setup::ActPass => "actpass",
            Setup::Active => "active",
            Setup::Passive => "passive",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "actpass" => Ok(Setup::ActPass),
            "active" => Ok(Setup::Active),
            "passive" => Ok(Setup::Passive),
            other => Err(Error::ErrSdpParse(format!("setup '{other}'"))),
        }
    }
}

impl fmt::Display for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Fingerprint is the certificate digest advertised in SDP. sha-256
/// is what we emit; sha-1 is still accepted on receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: String,
    pub digest: Vec<u8>,
}

impl Fingerprint {
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace();
        let hash = parts
            .next()
            .ok_or_else(|| Error::ErrSdpParse("empty fingerprint".to_owned()))?
            .to_ascii_lowercase();
        let hex_part = parts
            .next()
            .ok_or_else(|| Error::ErrSdpParse("fingerprint without digest".to_owned()))?;

        let digest: Vec<u8> = hex_part
            .split(':')
            .map(|b| u8::from_str_radix(b, 16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::ErrSdpParse("bad fingerprint hex".to_owned()))?;

        Ok(Fingerprint { hash, digest })
    }
}

/// MediaSection is one m= block with its attributes in order.
#[derive(Debug, Clone, Default)]
pub struct MediaSection {
    pub kind: String,
    pub port: u16,
    pub proto: String,
    pub formats: Vec<String>,
    pub connection: Option<String>,
    pub attrs: Vec<(String, Option<String>)>,
}

impl MediaSection {
    pub fn new(kind: &str, port: u16, proto: &str) -> Self {
        MediaSection {
            kind: kind.to_owned(),
            port,
            proto: proto.to_owned(),
            ..Default::default()
        }
    }

    pub fn add_attr(&mut self, name: &str, value: Option<&str>) {
        self.attrs
            .push((name.to_owned(), value.map(str::to_owned)));
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|(n, _)| n == name)
    }

    pub fn all_attrs(&self, name: &str) -> Vec<&str> {
        self.attrs
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
            .collect()
    }
}

/// SessionDescription is a compact RFC 4566 model: enough structure
/// for one audio section, an optional video section and the data
/// section, with every unknown attribute preserved in order.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    pub origin_addr: String,
    pub session_id: u64,
    pub session_attrs: Vec<(String, Option<String>)>,
    pub media: Vec<MediaSection>,
}

impl SessionDescription {
    pub fn new(origin_addr: IpAddr, session_id: u64) -> Self {
        SessionDescription {
            origin_addr: origin_addr.to_string(),
            session_id,
            ..Default::default()
        }
    }

    pub fn add_session_attr(&mut self, name: &str, value: Option<&str>) {
        self.session_attrs
            .push((name.to_owned(), value.map(str::to_owned)));
    }

    pub fn session_attr(&self, name: &str) -> Option<&str> {
        self.session_attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn has_session_attr(&self, name: &str) -> bool {
        self.session_attrs.iter().any(|(n, _)| n == name)
    }

    pub fn media(&self, kind: &str) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.kind == kind)
    }

    /// session_or_media_attr looks in the media section first, then
    /// at session level; ufrag/pwd/fingerprint may live at either.
    pub fn session_or_media_attr<'a>(&'a self, m: &'a MediaSection, name: &str) -> Option<&'a str> {
        m.attr(name).or_else(|| self.session_attr(name))
    }

    pub fn parse(raw: &str) -> Result<SessionDescription> {
        let mut sdp = SessionDescription::default();
        let mut current: Option<MediaSection> = None;

        for line in raw.lines() {
            let line = line.trim_end_matches('\r');
            if line.len() < 2 || line.as_bytes().get(1) != Some(&b'=') {
                continue;
            }
            let (kind, value) = (line.as_bytes()[0], &line[2..]);

            match kind {
                b'o' => {
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    if fields.len() >= 6 {
                        sdp.session_id = fields[1].parse().unwrap_or(0);
                        sdp.origin_addr = fields[5].to_owned();
                    }
                }
                b'm' => {
                    if let Some(section) = current.take() {
                        sdp.media.push(section);
                    }
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    if fields.len() < 3 {
                        return Err(Error::ErrSdpParse(format!("m-line '{value}'")));
                    }
                    let mut section = MediaSection::new(
                        fields[0],
                        fields[1]
                            .parse()
                            .map_err(|_| Error::ErrSdpParse(format!("m-line port '{value}'")))?,
                        fields[2],
                    );
                    section.formats = fields[3..].iter().map(|s| s.to_string()).collect();
                    current = Some(section);
                }
                b'c' => {
                    if let Some(section) = current.as_mut() {
                        section.connection = Some(value.to_owned());
                    }
                }
                b'a' => {
                    let (name, attr_value) = match value.split_once(':') {
                        Some((n, v)) => (n, Some(v)),
                        None => (value, None),
                    };
                    match current.as_mut() {
                        Some(section) => section.add_attr(name, attr_value),
                        None => sdp.add_session_attr(name, attr_value),
                    }
                }
                _ => {}
            }
        }

        if let Some(section) = current.take() {
            sdp.media.push(section);
        }
        Ok(sdp)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = if self.origin_addr.is_empty() {
            "127.0.0.1"
        } else {
            &self.origin_addr
        };
        let ip_kind = if addr.contains(':') { "IP6" } else { "IP4" };

        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o=- {} 2 IN {ip_kind} {addr}\r\n",
            self.session_id
        )?;
        write!(f, "s=-\r\n")?;
        write!(f, "t=0 0\r\n")?;

        for (name, value) in &self.session_attrs {
            match value {
                Some(v) => write!(f, "a={name}:{v}\r\n")?,
                None => write!(f, "a={name}\r\n")?,
            }
        }

        for m in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                m.kind,
                m.port,
                m.proto,
                m.formats.join(" ")
            )?;
            if let Some(c) = &m.connection {
                write!(f, "c={c}\r\n")?;
            }
            for (name, value) in &m.attrs {
                match value {
                    Some(v) => write!(f, "a={name}:{v}\r\n")?,
                    None => write!(f, "a={name}\r\n")?,
                }
            }
        }
        Ok(())
    }
}
