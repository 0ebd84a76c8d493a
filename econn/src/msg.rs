#[cfg(test)]
mod msg_test;

use std::fmt;

use serde_json::{json, Map, Value};

use crate::props::Properties;
use crate::{Error, Result, PROTO_VERSION};

/// MsgType tags the envelope; the first block travels via the
/// backend, HANGUP and PROPSYNC go peer-to-peer over the data
/// channel once it is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Setup,
    Cancel,
    Update,
    Hangup,
    Reject,
    Propsync,
    Alert,
    Ping,
    GroupStart,
    GroupLeave,
    GroupCheck,
    ConfConn,
}

impl MsgType {
    pub fn name(&self) -> &'static str {
        match self {
            MsgType::Setup => "SETUP",
            MsgType::Cancel => "CANCEL",
            MsgType::Update => "UPDATE",
            MsgType::Hangup => "HANGUP",
            MsgType::Reject => "REJECT",
            MsgType::Propsync => "PROPSYNC",
            MsgType::Alert => "ALERT",
            MsgType::Ping => "PING",
            MsgType::GroupStart => "GROUPSTART",
            MsgType::GroupLeave => "GROUPLEAVE",
            MsgType::GroupCheck => "GROUPCHECK",
            MsgType::ConfConn => "CONFCONN",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "SETUP" => Ok(MsgType::Setup),
            "CANCEL" => Ok(MsgType::Cancel),
            "UPDATE" => Ok(MsgType::Update),
            "HANGUP" => Ok(MsgType::Hangup),
            "REJECT" => Ok(MsgType::Reject),
            "PROPSYNC" => Ok(MsgType::Propsync),
            "ALERT" => Ok(MsgType::Alert),
            "PING" => Ok(MsgType::Ping),
            "GROUPSTART" => Ok(MsgType::GroupStart),
            "GROUPLEAVE" => Ok(MsgType::GroupLeave),
            "GROUPCHECK" => Ok(MsgType::GroupCheck),
            "CONFCONN" => Ok(MsgType::ConfConn),
            _ => Err(Error::ErrUnsupportedType(name.to_owned())),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// IceServer is one entry of a CONFCONN ice-server list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// MsgContent carries the type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgContent {
    Setup {
        sdp: String,
        props: Option<Properties>,
    },
    Update {
        sdp: String,
        props: Option<Properties>,
    },
    Cancel,
    Hangup,
    Reject,
    Propsync {
        props: Properties,
    },
    Alert {
        level: u32,
        descr: String,
    },
    Ping,
    GroupStart {
        props: Option<Properties>,
    },
    GroupLeave,
    GroupCheck,
    ConfConn {
        ice_servers: Vec<IceServer>,
        update: bool,
        tool: String,
        toolver: String,
    },
}

impl MsgContent {
    pub fn msg_type(&self) -> MsgType {
        match self {
            MsgContent::Setup { .. } => MsgType::Setup,
            MsgContent::Update { .. } => MsgType::Update,
            MsgContent::Cancel => MsgType::Cancel,
            MsgContent::Hangup => MsgType::Hangup,
            MsgContent::Reject => MsgType::Reject,
            MsgContent::Propsync { .. } => MsgType::Propsync,
            MsgContent::Alert { .. } => MsgType::Alert,
            MsgContent::Ping => MsgType::Ping,
            MsgContent::GroupStart { .. } => MsgType::GroupStart,
            MsgContent::GroupLeave => MsgType::GroupLeave,
            MsgContent::GroupCheck => MsgType::GroupCheck,
            MsgContent::ConfConn { .. } => MsgType::ConfConn,
        }
    }
}

/// EconnMessage is one signaling envelope. `sessid_sender` is the
/// sender's random session-id; `resp` distinguishes request from
/// response of the same type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EconnMessage {
    pub sessid_sender: String,
    pub resp: bool,
    pub src_userid: String,
    pub src_clientid: String,
    pub dest_userid: String,
    pub dest_clientid: String,
    /// sender wall-clock in whole seconds, as relayed by the host
    pub time: u64,
    /// seconds the message spent in flight, clamped at zero
    pub age: u64,
    pub content: MsgContent,
}

impl EconnMessage {
    pub fn new(sessid: &str, content: MsgContent) -> Self {
        EconnMessage {
            sessid_sender: sessid.to_owned(),
            resp: false,
            src_userid: String::new(),
            src_clientid: String::new(),
            dest_userid: String::new(),
            dest_clientid: String::new(),
            time: 0,
            age: 0,
            content,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        self.content.msg_type()
    }

    pub fn is_request(&self) -> bool {
        !self.resp
    }

    /// brief is the one-line trace form.
    pub fn brief(&self) -> String {
        format!(
            "{}|{} sessid={} src={}.{}",
            self.msg_type(),
            if self.resp { "resp" } else { "req" },
            self.sessid_sender,
            self.src_userid,
            self.src_clientid
        )
    }
}

fn put_opt_str(obj: &mut Map<String, Value>, key: &str, val: &str) {
    if !val.is_empty() {
        obj.insert(key.to_owned(), Value::String(val.to_owned()));
    }
}

/// encode renders the envelope as its self-describing JSON text.
pub fn encode(msg: &EconnMessage) -> Result<String> {
    let mut obj = Map::new();
    obj.insert("version".to_owned(), json!(PROTO_VERSION));
    obj.insert("type".to_owned(), json!(msg.msg_type().name()));
    obj.insert("sessid".to_owned(), json!(msg.sessid_sender));

    put_opt_str(&mut obj, "src_userid", &msg.src_userid);
    put_opt_str(&mut obj, "src_clientid", &msg.src_clientid);
    put_opt_str(&mut obj, "dest_userid", &msg.dest_userid);
    put_opt_str(&mut obj, "dest_clientid", &msg.dest_clientid);

    obj.insert("resp".to_owned(), json!(msg.resp));

    match &msg.content {
        MsgContent::Setup { sdp, props } | MsgContent::Update { sdp, props } => {
            obj.insert("sdp".to_owned(), json!(sdp));
            if let Some(props) = props {
                obj.insert("props".to_owned(), props.to_value());
            }
        }
        MsgContent::Propsync { props } => {
            obj.insert("props".to_owned(), props.to_value());
        }
        MsgContent::Alert { level, descr } => {
            obj.insert("level".to_owned(), json!(level));
            obj.insert("descr".to_owned(), json!(descr));
        }
        MsgContent::GroupStart { props } => {
            if let Some(props) = props {
                obj.insert("props".to_owned(), props.to_value());
            }
        }
        MsgContent::ConfConn {
            ice_servers,
            update,
            tool,
            toolver,
        } => {
            if !ice_servers.is_empty() {
                let servers: Vec<Value> = ice_servers
                    .iter()
                    .map(|s| {
                        let mut o = Map::new();
                        o.insert("urls".to_owned(), json!(s.urls));
                        if let Some(u) = &s.username {
                            o.insert("username".to_owned(), json!(u));
                        }
                        if let Some(c) = &s.credential {
                            o.insert("credential".to_owned(), json!(c));
                        }
                        Value::Object(o)
                    })
                    .collect();
                obj.insert("ice_servers".to_owned(), Value::Array(servers));
            }
            obj.insert("update".to_owned(), json!(update));
            obj.insert("tool".to_owned(), json!(tool));
            obj.insert("toolver".to_owned(), json!(toolver));
        }
        MsgContent::Cancel
        | MsgContent::Hangup
        | MsgContent::Reject
        | MsgContent::Ping
        | MsgContent::GroupLeave
        | MsgContent::GroupCheck => {}
    }

    serde_json::to_string(&Value::Object(obj)).map_err(|e| Error::ErrBadMessage(e.to_string()))
}

fn str_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned()
}

fn required_str(obj: &Map<String, Value>, key: &str) -> Result<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::ErrBadMessage(format!("missing '{key}' field")))
}

/// decode parses the envelope, rejecting unknown types and foreign
/// versions, and computes the message age from the supplied clocks
/// (whole seconds).
pub fn decode(raw: &str, curr_time: u64, msg_time: u64) -> Result<EconnMessage> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| Error::ErrBadMessage(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| Error::ErrBadMessage("not an object".to_owned()))?;

    let typ = required_str(obj, "type")?;
    let version = required_str(obj, "version")?;
    if !version.eq_ignore_ascii_case(PROTO_VERSION) {
        return Err(Error::ErrVersionMismatch(version));
    }

    let msg_type = MsgType::from_name(&typ)?;

    let sessid = required_str(obj, "sessid")?;
    let resp = obj
        .get("resp")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| Error::ErrBadMessage("missing 'resp' field".to_owned()))?;

    let props_of = |obj: &Map<String, Value>| -> Option<Properties> {
        obj.get("props").and_then(Properties::from_value)
    };

    let content = match msg_type {
        MsgType::Setup => MsgContent::Setup {
            sdp: required_str(obj, "sdp")?,
            props: props_of(obj),
        },
        MsgType::Update => MsgContent::Update {
            sdp: required_str(obj, "sdp")?,
            props: props_of(obj),
        },
        MsgType::Cancel => MsgContent::Cancel,
        MsgType::Hangup => MsgContent::Hangup,
        MsgType::Reject => MsgContent::Reject,
        MsgType::Propsync => MsgContent::Propsync {
            props: props_of(obj)
                .ok_or_else(|| Error::ErrBadMessage("propsync without props".to_owned()))?,
        },
        MsgType::Alert => MsgContent::Alert {
            level: obj.get("level").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            descr: str_field(obj, "descr"),
        },
        MsgType::Ping => MsgContent::Ping,
        MsgType::GroupStart => MsgContent::GroupStart {
            props: props_of(obj),
        },
        MsgType::GroupLeave => MsgContent::GroupLeave,
        MsgType::GroupCheck => MsgContent::GroupCheck,
        MsgType::ConfConn => {
            let mut ice_servers = vec![];
            if let Some(servers) = obj.get("ice_servers").and_then(|v| v.as_array()) {
                for server in servers {
                    let Some(server) = server.as_object() else {
                        continue;
                    };
                    let urls = match server.get("urls") {
                        Some(Value::Array(urls)) => urls
                            .iter()
                            .filter_map(|u| u.as_str())
                            .map(str::to_owned)
                            .collect(),
                        Some(Value::String(url)) => vec![url.clone()],
                        _ => vec![],
                    };
                    ice_servers.push(IceServer {
                        urls,
                        username: server
                            .get("username")
                            .and_then(|v| v.as_str())
                            .map(str::to_owned),
                        credential: server
                            .get("credential")
                            .and_then(|v| v.as_str())
                            .map(str::to_owned),
                    });
                }
            }
            MsgContent::ConfConn {
                ice_servers,
                update: obj.get("update").and_then(|v| v.as_bool()).unwrap_or(false),
                tool: str_field(obj, "tool"),
                toolver: str_field(obj, "toolver"),
            }
        }
    };

    Ok(EconnMessage {
        sessid_sender: sessid,
        resp,
        src_userid: str_field(obj, "src_userid"),
        src_clientid: str_field(obj, "src_clientid"),
        dest_userid: str_field(obj, "dest_userid"),
        dest_clientid: str_field(obj, "dest_clientid"),
        time: msg_time,
        age: curr_time.saturating_sub(msg_time),
        content,
    })
}
