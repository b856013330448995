use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

use crate::message::Destination;

pub const MAX_INDEX_VALUE: u8 = 100;
pub const BROADCAST_ALL: u8 = 0xFF;
pub const BROADCAST_SATELLITES: u8 = 0xFE;
pub const FRAME_TERMINATOR: u8 = 0x00;

pub const MAX_PAYLOAD_SIZE: usize = 256;
// dest (up to 2) + command + payload + checksum
pub const MAX_RAW_FRAME_SIZE: usize = 2 + 1 + MAX_PAYLOAD_SIZE + 1;
// COBS adds one code byte per 254 data bytes (plus one), then the terminator
pub const MAX_FRAME_SIZE: usize = MAX_RAW_FRAME_SIZE + MAX_RAW_FRAME_SIZE / 254 + 1 + 1;

// A reserved token must never be mistaken for the first byte of a node identity.
const_assert!(BROADCAST_ALL > MAX_INDEX_VALUE);
const_assert!(BROADCAST_SATELLITES > MAX_INDEX_VALUE);
const_assert!(BROADCAST_ALL != BROADCAST_SATELLITES);

/// The fixed command set shared by every node on the chain.
///
/// `Unknown` only ever comes off the wire: a frame whose command byte is not in
/// the table still decodes (payload as raw bytes) so older firmware can coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    // System & discovery
    Ping,
    Ack,
    Nack,
    IdAssign,
    NewSat,
    Status,
    Error,
    Log,
    SyncFrame,
    Power,
    Reboot,
    Mode,
    Hello,

    // LED
    Led,
    LedFlash,
    LedBreath,
    LedCylon,
    LedCentri,
    LedRainbow,
    LedGlitch,

    // Display
    Dsp,
    DspCorrupt,
    DspMatrix,

    // Encoder
    SetEnc,

    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandCategory {
    System,
    Led,
    Display,
    Encoder,
    Unknown,
}

const NAMED_COMMANDS: [Command; 24] = [
    Command::Ping,
    Command::Ack,
    Command::Nack,
    Command::IdAssign,
    Command::NewSat,
    Command::Status,
    Command::Error,
    Command::Log,
    Command::SyncFrame,
    Command::Power,
    Command::Reboot,
    Command::Mode,
    Command::Hello,
    Command::Led,
    Command::LedFlash,
    Command::LedBreath,
    Command::LedCylon,
    Command::LedCentri,
    Command::LedRainbow,
    Command::LedGlitch,
    Command::Dsp,
    Command::DspCorrupt,
    Command::DspMatrix,
    Command::SetEnc,
];

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::IdAssign => "ID_ASSIGN",
            Command::NewSat => "NEW_SAT",
            Command::Status => "STATUS",
            Command::Error => "ERROR",
            Command::Log => "LOG",
            Command::SyncFrame => "SYNC_FRAME",
            Command::Power => "POWER",
            Command::Reboot => "REBOOT",
            Command::Mode => "MODE",
            Command::Hello => "HELLO",
            Command::Led => "LED",
            Command::LedFlash => "LEDFLASH",
            Command::LedBreath => "LEDBREATH",
            Command::LedCylon => "LEDCYLON",
            Command::LedCentri => "LEDCENTRI",
            Command::LedRainbow => "LEDRAINBOW",
            Command::LedGlitch => "LEDGLITCH",
            Command::Dsp => "DSP",
            Command::DspCorrupt => "DSPCORRUPT",
            Command::DspMatrix => "DSPMATRIX",
            Command::SetEnc => "SETENC",
            Command::Unknown(_) => "UNKNOWN",
        }
    }

    pub fn category(&self) -> CommandCategory {
        match self {
            Command::Led
            | Command::LedFlash
            | Command::LedBreath
            | Command::LedCylon
            | Command::LedCentri
            | Command::LedRainbow
            | Command::LedGlitch => CommandCategory::Led,
            Command::Dsp | Command::DspCorrupt | Command::DspMatrix => CommandCategory::Display,
            Command::SetEnc => CommandCategory::Encoder,
            Command::Unknown(_) => CommandCategory::Unknown,
            _ => CommandCategory::System,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unknown(code) => write!(f, "UNKNOWN(0x{:02X})", code),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NAMED_COMMANDS
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| ProtocolError::UnknownCommand(s.to_string()))
    }
}

/// How a command's payload is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// UTF-8 bytes, preserved exactly (never parsed as a number)
    Text,
    /// one unsigned byte per value
    Bytes,
    /// little-endian u16 per value
    Words,
    /// little-endian IEEE-754 f32 per value
    Floats,
    /// opaque bytes
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSchema {
    pub encoding: Encoding,
    /// Exact number of values, or `None` for variable length
    pub count: Option<usize>,
}

impl PayloadSchema {
    pub const fn variable(encoding: Encoding) -> Self {
        Self { encoding, count: None }
    }

    pub const fn fixed(encoding: Encoding, count: usize) -> Self {
        Self { encoding, count: Some(count) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: Command,
    pub code: u8,
    pub schema: Option<PayloadSchema>,
}

const fn entry(command: Command, code: u8, schema: Option<PayloadSchema>) -> CommandSpec {
    CommandSpec { command, code, schema }
}

const TEXT: Option<PayloadSchema> = Some(PayloadSchema::variable(Encoding::Text));
const BYTES: Option<PayloadSchema> = Some(PayloadSchema::variable(Encoding::Bytes));

pub const STANDARD_COMMANDS: &[CommandSpec] = &[
    // System & discovery 0x01-0x0F
    entry(Command::Ping, 0x01, None),
    entry(Command::Ack, 0x02, None),
    entry(Command::Nack, 0x03, None),
    entry(Command::IdAssign, 0x04, TEXT),
    entry(Command::NewSat, 0x05, TEXT),
    entry(Command::Status, 0x06, BYTES),
    entry(Command::Error, 0x07, TEXT),
    entry(Command::Log, 0x08, TEXT),
    entry(Command::SyncFrame, 0x09, Some(PayloadSchema::fixed(Encoding::Floats, 2))),
    entry(Command::Power, 0x0A, Some(PayloadSchema::fixed(Encoding::Floats, 3))),
    entry(Command::Reboot, 0x0B, TEXT),
    entry(Command::Mode, 0x0C, TEXT),
    entry(Command::Hello, 0xAA, TEXT),
    // LED 0x10-0x1F
    entry(Command::Led, 0x10, BYTES),
    entry(Command::LedFlash, 0x11, BYTES),
    entry(Command::LedBreath, 0x12, BYTES),
    entry(Command::LedCylon, 0x13, BYTES),
    entry(Command::LedCentri, 0x14, BYTES),
    entry(Command::LedRainbow, 0x15, BYTES),
    entry(Command::LedGlitch, 0x16, BYTES),
    // Display 0x20-0x2F
    entry(Command::Dsp, 0x20, TEXT),
    entry(Command::DspCorrupt, 0x21, BYTES),
    entry(Command::DspMatrix, 0x22, BYTES),
    // Encoder 0x30-0x3F
    entry(Command::SetEnc, 0x30, Some(PayloadSchema::variable(Encoding::Words))),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationSpec {
    pub destination: Destination,
    pub token: &'static str,
    pub code: u8,
}

pub const STANDARD_DESTINATIONS: &[DestinationSpec] = &[
    DestinationSpec { destination: Destination::All, token: "ALL", code: BROADCAST_ALL },
    DestinationSpec { destination: Destination::Satellites, token: "SAT", code: BROADCAST_SATELLITES },
];

/// The three tables every node must agree on: command codes, reserved
/// destination codes and per-command payload schemas.
#[derive(Debug, Clone)]
pub struct Protocol {
    commands: Vec<CommandSpec>,
    destinations: Vec<DestinationSpec>,
    max_index: u8,
}

impl Protocol {
    pub fn standard() -> Self {
        Self {
            commands: STANDARD_COMMANDS.to_vec(),
            destinations: STANDARD_DESTINATIONS.to_vec(),
            max_index: MAX_INDEX_VALUE,
        }
    }

    /// Build a protocol from custom tables, rejecting any non-injective mapping.
    pub fn new(
        commands: &[CommandSpec],
        destinations: &[DestinationSpec],
    ) -> Result<Self, ProtocolError> {
        for (i, a) in commands.iter().enumerate() {
            for b in &commands[i + 1..] {
                if a.code == b.code || a.command == b.command {
                    return Err(ProtocolError::DuplicateCommandCode(b.code));
                }
            }
        }

        for (i, a) in destinations.iter().enumerate() {
            if a.code <= MAX_INDEX_VALUE {
                return Err(ProtocolError::ReservedCodeInIndexRange(a.code));
            }
            for b in &destinations[i + 1..] {
                if a.code == b.code || a.token == b.token || a.destination == b.destination {
                    return Err(ProtocolError::DuplicateDestinationCode(b.code));
                }
            }
        }

        Ok(Self {
            commands: commands.to_vec(),
            destinations: destinations.to_vec(),
            max_index: MAX_INDEX_VALUE,
        })
    }

    pub fn max_index(&self) -> u8 {
        self.max_index
    }

    pub fn command_code(&self, command: Command) -> Result<u8, ProtocolError> {
        self.commands
            .iter()
            .find(|s| s.command == command)
            .map(|s| s.code)
            .ok_or_else(|| ProtocolError::UnknownCommand(command.to_string()))
    }

    pub fn command_for_code(&self, code: u8) -> Command {
        self.commands
            .iter()
            .find(|s| s.code == code)
            .map_or(Command::Unknown(code), |s| s.command)
    }

    pub fn schema(&self, command: Command) -> Option<&PayloadSchema> {
        self.commands
            .iter()
            .find(|s| s.command == command)
            .and_then(|s| s.schema.as_ref())
    }

    pub fn reserved_code(&self, destination: &Destination) -> Option<u8> {
        self.destinations
            .iter()
            .find(|s| s.destination == *destination)
            .map(|s| s.code)
    }

    pub fn reserved_destination(&self, code: u8) -> Option<Destination> {
        self.destinations
            .iter()
            .find(|s| s.code == code)
            .map(|s| s.destination)
    }

    pub fn destination_for_token(&self, token: &str) -> Option<Destination> {
        self.destinations
            .iter()
            .find(|s| s.token == token)
            .map(|s| s.destination)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::standard()
    }
}

/// Encode-side failures. These are caller defects, never wire conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("destination '{0}' has no wire encoding")]
    InvalidDestination(String),
    #[error("invalid satellite id '{0}'")]
    InvalidSatelliteId(String),
    #[error("payload does not fit {expected:?} schema of {command}")]
    PayloadMismatch { command: Command, expected: Encoding },
    #[error("{command} expects {expected} values, got {actual}")]
    FieldCount { command: Command, expected: usize, actual: usize },
    #[error("payload of {0} bytes exceeds frame capacity")]
    PayloadTooLarge(usize),
    #[error("command code 0x{0:02X} is not unique")]
    DuplicateCommandCode(u8),
    #[error("destination code 0x{0:02X} is not unique")]
    DuplicateDestinationCode(u8),
    #[error("reserved destination code 0x{0:02X} collides with node index range")]
    ReservedCodeInIndexRange(u8),
}
