//! Identity assignment along the chain.
//!
//! The core broadcasts `ID_ASSIGN "TTII"`. The first unidentified satellite of
//! type `TT` claims index `II`, answers HELLO upstream and forwards
//! `ID_ASSIGN "TT(II+1)"` downstream, so every node of that type ends up with
//! a unique index in chain order.

use tracing::{debug, info, warn};

use crate::message::{parse_type_prefix, Destination, Message, Payload, SatelliteId, MAX_ID_PART};
use crate::protocol::{Command, ProtocolError};
use crate::registry::{type_name, TypeName};

/// Indices travel as two decimal digits.
pub const MAX_ASSIGNABLE_INDEX: u8 = MAX_ID_PART;

/// Broadcast asking satellites of `sat_type` to number themselves from `start`.
pub fn id_assign(sat_type: u8, start: u8) -> Message {
    Message::new(
        Destination::All,
        Command::IdAssign,
        Payload::Text(format!("{:02}{:02}", sat_type, start)),
    )
}

/// Split an ID_ASSIGN payload into `(type, index)`.
pub fn parse_assignment(payload: &str) -> Result<(u8, u8), ProtocolError> {
    let invalid = || ProtocolError::InvalidSatelliteId(payload.to_string());
    if payload.len() != 4 || !payload.is_ascii() {
        return Err(invalid());
    }
    let sat_type = parse_type_prefix(&payload[..2]).map_err(|_| invalid())?;
    let index = payload[2..]
        .parse::<u8>()
        .ok()
        .filter(|_| payload[2..].bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(invalid)?;
    Ok((sat_type, index))
}

/// What a node must send after handling one ID_ASSIGN.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentOutcome {
    /// HELLO for upstream, when this node holds an identity of the carried type
    pub reply: Option<Message>,
    /// ID_ASSIGN for downstream
    pub forward: Option<Message>,
    /// this call moved the node from unidentified to identified
    pub claimed: bool,
}

#[derive(Debug, Clone)]
pub struct Discovery {
    sat_type: u8,
    type_name: TypeName,
    identity: Option<SatelliteId>,
}

impl Discovery {
    pub fn new(sat_type: u8, name: &str) -> Result<Self, ProtocolError> {
        // validates the type
        SatelliteId::new(sat_type, 0)?;
        Ok(Self {
            sat_type,
            type_name: type_name(name),
            identity: None,
        })
    }

    pub fn sat_type(&self) -> u8 {
        self.sat_type
    }

    pub fn type_prefix(&self) -> String {
        format!("{:02}", self.sat_type)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn identity(&self) -> Option<SatelliteId> {
        self.identity
    }

    pub fn is_identified(&self) -> bool {
        self.identity.is_some()
    }

    pub fn reset(&mut self) {
        self.identity = None;
    }

    /// NEW_SAT announcement to send while unidentified.
    pub fn announcement(&self) -> Option<Message> {
        if self.identity.is_some() {
            return None;
        }
        let placeholder = SatelliteId::new(self.sat_type, 0).ok()?;
        Some(Message::new(
            placeholder,
            Command::NewSat,
            Payload::Text(self.type_prefix()),
        ))
    }

    fn hello(&self, id: SatelliteId) -> Message {
        Message::new(id, Command::Hello, Payload::Text(self.type_name.to_string()))
    }

    fn forward_from(&self, index: u8) -> Option<Message> {
        let next = index.checked_add(1).filter(|n| *n <= MAX_ASSIGNABLE_INDEX);
        match next {
            Some(next) => Some(id_assign(self.sat_type, next)),
            None => {
                warn!("ID_ASSIGN for type {:02} exhausted at index {}", self.sat_type, index);
                None
            }
        }
    }

    pub fn on_id_assign(&mut self, payload: &str) -> AssignmentOutcome {
        let (sat_type, index) = match parse_assignment(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("ignoring ID_ASSIGN: {}", e);
                return AssignmentOutcome::default();
            }
        };

        if sat_type != self.sat_type {
            debug!("ID_ASSIGN {} is for another type, passing through", payload);
            return AssignmentOutcome {
                forward: Some(id_assign(sat_type, index)),
                ..AssignmentOutcome::default()
            };
        }

        match self.identity {
            None => {
                let Ok(id) = SatelliteId::new(sat_type, index) else {
                    warn!("ID_ASSIGN index {} out of range", index);
                    return AssignmentOutcome::default();
                };
                self.identity = Some(id);
                info!("claimed identity {}", id);
                AssignmentOutcome {
                    reply: Some(self.hello(id)),
                    forward: self.forward_from(index),
                    claimed: true,
                }
            }
            Some(id) => AssignmentOutcome {
                reply: Some(self.hello(id)),
                forward: self.forward_from(id.index()),
                claimed: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assignment_payload() {
        assert_eq!(parse_assignment("0100").unwrap(), (1, 0));
        assert_eq!(parse_assignment("0342").unwrap(), (3, 42));
        assert!(parse_assignment("0000").is_err());
        assert!(parse_assignment("01").is_err());
        assert!(parse_assignment("01+1").is_err());
    }

    #[test]
    fn claims_and_forwards_next_index() {
        let mut d = Discovery::new(1, "INDUSTRIAL").unwrap();
        let out = d.on_id_assign("0100");
        assert!(out.claimed);
        assert_eq!(d.identity().unwrap().to_string(), "0100");

        let reply = out.reply.unwrap();
        assert_eq!(reply.command(), Command::Hello);
        assert_eq!(reply.destination().to_string(), "0100");
        assert_eq!(reply.payload().as_text(), Some("INDUSTRIAL"));
        assert_eq!(out.forward.unwrap(), id_assign(1, 1));
    }

    #[test]
    fn identified_node_forwards_own_index_plus_one() {
        let mut d = Discovery::new(1, "INDUSTRIAL").unwrap();
        d.on_id_assign("0104");
        let out = d.on_id_assign("0100");
        assert!(!out.claimed);
        assert_eq!(d.identity().unwrap().index(), 4);
        assert_eq!(out.forward.unwrap(), id_assign(1, 5));
        assert!(out.reply.is_some());
    }

    #[test]
    fn other_types_pass_through_unchanged() {
        let mut d = Discovery::new(2, "ARCADE").unwrap();
        let out = d.on_id_assign("0107");
        assert!(out.reply.is_none());
        assert!(!d.is_identified());
        assert_eq!(out.forward.unwrap().payload().as_text(), Some("0107"));
    }

    #[test]
    fn announcement_only_while_unidentified() {
        let mut d = Discovery::new(1, "INDUSTRIAL").unwrap();
        let msg = d.announcement().unwrap();
        assert_eq!(msg.command(), Command::NewSat);
        assert_eq!(msg.destination().to_string(), "0100");
        assert_eq!(msg.payload().as_text(), Some("01"));
        d.on_id_assign("0100");
        assert!(d.announcement().is_none());
    }

    #[test]
    fn last_index_is_not_forwarded() {
        let mut d = Discovery::new(1, "INDUSTRIAL").unwrap();
        let out = d.on_id_assign("0199");
        assert!(out.claimed);
        assert!(out.forward.is_none());
    }
}
