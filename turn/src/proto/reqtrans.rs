use std::fmt;

use stun::attributes::ATTR_REQUESTED_TRANSPORT;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

use super::{Protocol, PROTO_UDP};

const REQUESTED_TRANSPORT_SIZE: usize = 4;

/// RequestedTransport is the REQUESTED-TRANSPORT attribute; TURN
/// only defines UDP.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct RequestedTransport {
    pub protocol: Protocol,
}

impl Default for RequestedTransport {
    fn default() -> Self {
        RequestedTransport {
            protocol: PROTO_UDP,
        }
    }
}

impl fmt::Display for RequestedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol: {}", self.protocol)
    }
}

impl Setter for RequestedTransport {
    fn add_to(&self, m: &mut Message) -> stun::Result<()> {
        let v = [self.protocol.0, 0, 0, 0]; // 3 bytes RFFU
        m.append(ATTR_REQUESTED_TRANSPORT, &v);
        Ok(())
    }
}

impl Getter for RequestedTransport {
    fn get_from(&mut self, m: &Message) -> stun::Result<()> {
        let v = m.get(ATTR_REQUESTED_TRANSPORT)?;
        check_size(ATTR_REQUESTED_TRANSPORT, v.len(), REQUESTED_TRANSPORT_SIZE)?;
        self.protocol = Protocol(v[0]);
        Ok(())
    }
}
