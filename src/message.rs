use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::{Command, ProtocolError};

/// Largest type or index that still prints as two decimal digits.
pub const MAX_ID_PART: u8 = 99;

/// A node identity: two decimal digits of type followed by two of index ("0102").
///
/// Type 00 is reserved and never assigned. Both halves are capped at
/// `MAX_ID_PART` so the text form is always four characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SatelliteId {
    sat_type: u8,
    index: u8,
}

impl SatelliteId {
    pub fn new(sat_type: u8, index: u8) -> Result<Self, ProtocolError> {
        if sat_type == 0 || sat_type > MAX_ID_PART || index > MAX_ID_PART {
            return Err(ProtocolError::InvalidSatelliteId(format!(
                "{:02}{:02}",
                sat_type, index
            )));
        }
        Ok(Self { sat_type, index })
    }

    pub fn sat_type(&self) -> u8 {
        self.sat_type
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Two-digit type prefix, e.g. "01".
    pub fn type_prefix(&self) -> String {
        format!("{:02}", self.sat_type)
    }

    pub fn with_index(&self, index: u8) -> Result<Self, ProtocolError> {
        Self::new(self.sat_type, index)
    }
}

impl fmt::Display for SatelliteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{:02}", self.sat_type, self.index)
    }
}

impl FromStr for SatelliteId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidSatelliteId(s.to_string());
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let sat_type = s[..2].parse::<u8>().map_err(|_| invalid())?;
        let index = s[2..].parse::<u8>().map_err(|_| invalid())?;
        Self::new(sat_type, index).map_err(|_| invalid())
    }
}

/// Parse a two-digit type prefix ("01") into its numeric type.
pub fn parse_type_prefix(prefix: &str) -> Result<u8, ProtocolError> {
    let invalid = || ProtocolError::InvalidSatelliteId(prefix.to_string());
    if prefix.len() != 2 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let sat_type = prefix.parse::<u8>().map_err(|_| invalid())?;
    if sat_type == 0 || sat_type > MAX_ID_PART {
        return Err(invalid());
    }
    Ok(sat_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// every node processes and relays
    All,
    /// every satellite, core excluded
    Satellites,
    Node(SatelliteId),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::All => f.write_str("ALL"),
            Destination::Satellites => f.write_str("SAT"),
            Destination::Node(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Destination {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALL" => Ok(Destination::All),
            "SAT" => Ok(Destination::Satellites),
            other => other
                .parse::<SatelliteId>()
                .map(Destination::Node)
                .map_err(|_| ProtocolError::InvalidDestination(other.to_string())),
        }
    }
}

impl From<SatelliteId> for Destination {
    fn from(id: SatelliteId) -> Self {
        Destination::Node(id)
    }
}

/// Payload shapes a command can carry. The command's schema picks the wire layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Words(Vec<u16>),
    Floats(Vec<f32>),
    Raw(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Raw(Vec::new())
    }

    pub fn text(s: impl Into<String>) -> Self {
        Payload::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) | Payload::Raw(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            Payload::Floats(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(s) => s.is_empty(),
            Payload::Bytes(b) | Payload::Raw(b) => b.is_empty(),
            Payload::Words(w) => w.is_empty(),
            Payload::Floats(f) => f.is_empty(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Text(s) => write!(f, "{:?}", s),
            Payload::Bytes(b) => write!(f, "{:?}", b),
            Payload::Words(w) => write!(f, "{:?}", w),
            Payload::Floats(v) => write!(f, "{:?}", v),
            Payload::Raw(b) => {
                f.write_str("0x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// One protocol exchange. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    destination: Destination,
    command: Command,
    payload: Payload,
}

impl Message {
    pub fn new(destination: impl Into<Destination>, command: Command, payload: Payload) -> Self {
        Self {
            destination: destination.into(),
            command,
            payload,
        }
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Identity carried in the destination field, if it names a node.
    pub fn node(&self) -> Option<SatelliteId> {
        match self.destination {
            Destination::Node(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} {}", self.command, self.destination, self.payload)
    }
}
