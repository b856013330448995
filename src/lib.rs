//! # Satellite Chain Protocol
//!
//! Wire protocol and network coordination for a core controller and the
//! satellite boxes daisy-chained behind it on point-to-point serial links.
//!
//! ## Features
//!
//! - **Framing**: COBS byte stuffing with a `0x00` terminator and a CRC-8 checksum
//! - **Schema-driven payloads**: text, bytes, little-endian words and floats per command
//! - **Transport**: single-writer send queue, validated receive, raw multi-hop relay
//! - **Discovery**: self-organizing identity assignment along the chain
//! - **Network manager**: registry, command dispatch, link watchdog, throttled feedback
//! - **Satellite firmware base**: relay, telemetry, power monitoring, local commands
//!
//! ## Quick Start
//!
//! ```rust
//! use satchain::{codec, Command, Message, Payload, Protocol, SatelliteId};
//!
//! let protocol = Protocol::standard();
//! let id: SatelliteId = "0101".parse().unwrap();
//! let msg = Message::new(id, Command::Led, Payload::Bytes(vec![0, 255, 0, 128]));
//!
//! let frame = codec::encode_frame(&msg, &protocol).unwrap();
//! assert_eq!(frame.last(), Some(&0x00));
//! assert_eq!(codec::decode_frame(&frame, &protocol).unwrap(), msg);
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - command, destination and payload-schema tables
//! - [`message`] - messages, payloads and node identities
//! - [`codec`] - checksum, stuffing and frame encode/decode
//! - [`transport`] - one serial link: send queue, receive, relay
//! - [`discovery`] - identity assignment state machine
//! - [`registry`] - per-satellite liveness and telemetry
//! - [`side_effects`] - display/audio collaborators and task throttling
//! - [`network`] - core-side satellite network manager
//! - [`satellite`] - satellite firmware base
//! - [`fault_injection`] - deterministic link damage for testing

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod codec;
pub mod discovery;
pub mod fault_injection;
pub mod message;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod satellite;
pub mod side_effects;
pub mod transport;

// Re-export main public types for convenience
pub use codec::{decode_frame, encode_frame, FrameAccumulator, FrameError};
pub use discovery::Discovery;
pub use message::{Destination, Message, Payload, SatelliteId};
pub use network::{LinkEvent, NetworkConfig, NetworkHandle, SatelliteNetworkManager};
pub use protocol::{Command, Encoding, PayloadSchema, Protocol, ProtocolError};
pub use registry::{PowerReading, SatelliteRegistry};
pub use satellite::{OperatingMode, Satellite, SatelliteConfig, SatelliteHardware};
pub use side_effects::{AudioChannel, AudioPlayer, StatusDisplay, TaskSlot};
pub use transport::{Transport, TransportConfig, TransportStatsSnapshot};
