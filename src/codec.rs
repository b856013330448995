//! Frame codec: CRC-8 checksum, COBS stuffing and schema-driven payload packing.
//!
//! Wire layout before stuffing: `dest (1 or 2 bytes) | command | payload | crc8`.
//! After stuffing the frame is terminated by a single `0x00`.

use std::collections::VecDeque;

use crc::{Crc, CRC_8_SMBUS};
use thiserror::Error;

use crate::message::{Destination, Message, Payload, SatelliteId};
use crate::protocol::{
    Command, Encoding, PayloadSchema, Protocol, ProtocolError, FRAME_TERMINATOR,
    MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
};

/// Polynomial 0x07, init 0x00, no reflection, no xor-out.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Shortest decoded frame: one destination byte, command, checksum.
pub const MIN_DECODED_LEN: usize = 3;

/// Wire conditions. Receivers discard the frame and keep scanning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed COBS stuffing")]
    Stuffing,
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },
    #[error("unknown destination code 0x{0:02X}")]
    UnknownDestination(u8),
    #[error("payload of {command} does not match its schema: {reason}")]
    InvalidPayload { command: Command, reason: &'static str },
}

pub fn checksum(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

/// COBS-stuff `raw` and append the terminator.
pub fn stuff(raw: &[u8]) -> Vec<u8> {
    let mut out = cobs::encode_vec(raw);
    out.push(FRAME_TERMINATOR);
    out
}

/// Reverse `stuff`. A trailing terminator is accepted; any other zero byte is not.
pub fn unstuff(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    let body = match frame.split_last() {
        Some((&FRAME_TERMINATOR, body)) => body,
        _ => frame,
    };
    if body.is_empty() {
        return Err(FrameError::Truncated(0));
    }
    if body.contains(&FRAME_TERMINATOR) {
        return Err(FrameError::Stuffing);
    }
    let mut raw = body.to_vec();
    let len = cobs::decode_in_place(&mut raw).map_err(|_| FrameError::Stuffing)?;
    raw.truncate(len);
    Ok(raw)
}

pub fn encode_destination(
    destination: &Destination,
    protocol: &Protocol,
    out: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    match destination {
        Destination::Node(id) => {
            out.push(id.sat_type());
            out.push(id.index());
            Ok(())
        }
        reserved => {
            let code = protocol
                .reserved_code(reserved)
                .ok_or_else(|| ProtocolError::InvalidDestination(reserved.to_string()))?;
            out.push(code);
            Ok(())
        }
    }
}

/// Returns the destination and how many bytes it occupied.
fn decode_destination(bytes: &[u8], protocol: &Protocol) -> Result<(Destination, usize), FrameError> {
    let first = *bytes.first().ok_or(FrameError::Truncated(bytes.len()))?;
    if first <= protocol.max_index() {
        let index = *bytes.get(1).ok_or(FrameError::Truncated(bytes.len()))?;
        let id = SatelliteId::new(first, index).map_err(|_| FrameError::UnknownDestination(first))?;
        return Ok((Destination::Node(id), 2));
    }
    protocol
        .reserved_destination(first)
        .map(|d| (d, 1))
        .ok_or(FrameError::UnknownDestination(first))
}

/// Numeric view of a payload, for coercion into numeric schemas.
fn numeric_values(payload: &Payload) -> Option<Vec<f64>> {
    match payload {
        Payload::Bytes(b) | Payload::Raw(b) => Some(b.iter().map(|&v| f64::from(v)).collect()),
        Payload::Words(w) => Some(w.iter().map(|&v| f64::from(v)).collect()),
        Payload::Floats(f) => Some(f.iter().map(|&v| f64::from(v)).collect()),
        Payload::Text(s) => {
            if s.trim().is_empty() {
                return Some(Vec::new());
            }
            s.split(',').map(|part| part.trim().parse::<f64>().ok()).collect()
        }
    }
}

fn to_integer(value: f64, max: f64) -> Option<f64> {
    if value.fract() == 0.0 && (0.0..=max).contains(&value) {
        Some(value)
    } else {
        None
    }
}

/// Serialize a payload per the command's schema.
pub fn encode_payload(
    command: Command,
    payload: &Payload,
    schema: Option<&PayloadSchema>,
) -> Result<Vec<u8>, ProtocolError> {
    let Some(schema) = schema else {
        return within_frame(encode_schemaless(payload));
    };

    let mismatch = || ProtocolError::PayloadMismatch {
        command,
        expected: schema.encoding,
    };

    let bytes = match schema.encoding {
        Encoding::Text => match payload {
            Payload::Text(s) => s.as_bytes().to_vec(),
            Payload::Raw(b) if core::str::from_utf8(b).is_ok() => b.clone(),
            _ => return Err(mismatch()),
        },
        Encoding::Raw => match payload {
            Payload::Raw(b) | Payload::Bytes(b) => b.clone(),
            Payload::Text(s) => s.as_bytes().to_vec(),
            _ => return Err(mismatch()),
        },
        numeric => {
            let values = numeric_values(payload).ok_or_else(mismatch)?;
            if let Some(expected) = schema.count {
                if values.len() != expected {
                    return Err(ProtocolError::FieldCount {
                        command,
                        expected,
                        actual: values.len(),
                    });
                }
            }
            let mut out = Vec::with_capacity(values.len() * 4);
            for value in values {
                match numeric {
                    Encoding::Bytes => {
                        let v = to_integer(value, f64::from(u8::MAX)).ok_or_else(mismatch)?;
                        out.push(v as u8);
                    }
                    Encoding::Words => {
                        let v = to_integer(value, f64::from(u16::MAX)).ok_or_else(mismatch)?;
                        out.extend_from_slice(&(v as u16).to_le_bytes());
                    }
                    _ => {
                        if value.is_finite() && value.abs() > f64::from(f32::MAX) {
                            return Err(mismatch());
                        }
                        out.extend_from_slice(&(value as f32).to_le_bytes());
                    }
                }
            }
            out
        }
    };

    within_frame(bytes)
}

fn within_frame(bytes: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Commands without a schema: bytes pass through, comma-separated numbers become bytes.
fn encode_schemaless(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Raw(b) | Payload::Bytes(b) => b.clone(),
        Payload::Words(w) => w.iter().flat_map(|v| v.to_le_bytes()).collect(),
        Payload::Floats(f) => f.iter().flat_map(|v| v.to_le_bytes()).collect(),
        Payload::Text(s) => {
            let parsed: Option<Vec<u8>> = s.split(',').map(|p| p.trim().parse::<u8>().ok()).collect();
            match parsed {
                Some(bytes) if !s.is_empty() => bytes,
                _ => s.as_bytes().to_vec(),
            }
        }
    }
}

/// Inverse of `encode_payload`. No schema yields the raw bytes untouched.
pub fn decode_payload(
    command: Command,
    bytes: &[u8],
    schema: Option<&PayloadSchema>,
) -> Result<Payload, FrameError> {
    let Some(schema) = schema else {
        return Ok(Payload::Raw(bytes.to_vec()));
    };

    let invalid = |reason| FrameError::InvalidPayload { command, reason };
    let check_count = |n: usize| match schema.count {
        Some(expected) if expected != n => Err(invalid("field count")),
        _ => Ok(()),
    };

    match schema.encoding {
        Encoding::Text => String::from_utf8(bytes.to_vec())
            .map(Payload::Text)
            .map_err(|_| invalid("text is not UTF-8")),
        Encoding::Raw => Ok(Payload::Raw(bytes.to_vec())),
        Encoding::Bytes => {
            check_count(bytes.len())?;
            Ok(Payload::Bytes(bytes.to_vec()))
        }
        Encoding::Words => {
            if bytes.len() % 2 != 0 {
                return Err(invalid("odd length for u16 words"));
            }
            check_count(bytes.len() / 2)?;
            Ok(Payload::Words(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ))
        }
        Encoding::Floats => {
            if bytes.len() % 4 != 0 {
                return Err(invalid("length not a multiple of 4 for f32"));
            }
            check_count(bytes.len() / 4)?;
            Ok(Payload::Floats(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ))
        }
    }
}

/// Build a complete, stuffed, terminated frame.
pub fn encode_frame(message: &Message, protocol: &Protocol) -> Result<Vec<u8>, ProtocolError> {
    let command = message.command();
    let code = protocol.command_code(command)?;
    let payload = encode_payload(command, message.payload(), protocol.schema(command))?;

    let mut raw = Vec::with_capacity(payload.len() + 4);
    encode_destination(&message.destination(), protocol, &mut raw)?;
    raw.push(code);
    raw.extend_from_slice(&payload);
    raw.push(checksum(&raw));

    Ok(stuff(&raw))
}

/// Parse one frame (terminator optional). Never panics on arbitrary input.
pub fn decode_frame(frame: &[u8], protocol: &Protocol) -> Result<Message, FrameError> {
    let raw = unstuff(frame)?;
    if raw.len() < MIN_DECODED_LEN {
        return Err(FrameError::Truncated(raw.len()));
    }

    let (body, crc) = raw.split_at(raw.len() - 1);
    let expected = checksum(body);
    if crc[0] != expected {
        return Err(FrameError::Checksum {
            expected,
            actual: crc[0],
        });
    }

    let (destination, used) = decode_destination(body, protocol)?;
    let rest = &body[used..];
    let (&code, payload_bytes) = rest.split_first().ok_or(FrameError::Truncated(raw.len()))?;

    let command = protocol.command_for_code(code);
    let payload = decode_payload(command, payload_bytes, protocol.schema(command))?;

    Ok(Message::new(destination, command, payload))
}

/// Splits a byte stream into terminated frames.
///
/// Frames are kept stuffed and include their terminator so they can be relayed
/// verbatim. A run longer than `max_len` without a terminator is dropped up to
/// the next terminator.
#[derive(Debug)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    max_len: usize,
    in_overflow: bool,
    overflows: u64,
}

impl FrameAccumulator {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len),
            max_len,
            in_overflow: false,
            overflows: 0,
        }
    }

    /// Feed received bytes, appending every completed frame to `frames`.
    /// Returns the number of frames completed by this call.
    pub fn feed(&mut self, input: &[u8], frames: &mut VecDeque<Vec<u8>>) -> usize {
        let mut completed = 0;
        for &byte in input {
            if byte == FRAME_TERMINATOR {
                if self.in_overflow {
                    self.in_overflow = false;
                } else if !self.buf.is_empty() {
                    let mut frame = core::mem::take(&mut self.buf);
                    frame.push(FRAME_TERMINATOR);
                    frames.push_back(frame);
                    completed += 1;
                }
                self.buf.clear();
                continue;
            }

            if self.in_overflow {
                continue;
            }
            if self.buf.len() >= self.max_len {
                self.buf.clear();
                self.in_overflow = true;
                self.overflows += 1;
                continue;
            }
            self.buf.push(byte);
        }
        completed
    }

    /// Bytes of the frame currently being assembled.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.in_overflow = false;
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_check_value() {
        assert_eq!(checksum(b"123456789"), 0xF4);
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn unstuff_rejects_embedded_zero() {
        assert_eq!(unstuff(&[0x02, 0x00, 0x01, 0x00]), Err(FrameError::Stuffing));
    }

    #[test]
    fn accumulator_splits_and_skips_empty_frames() {
        let mut acc = FrameAccumulator::new(16);
        let mut frames = VecDeque::new();
        assert_eq!(acc.feed(&[0x00, 0x02, 0x05], &mut frames), 0);
        assert_eq!(acc.pending(), 2);
        assert_eq!(acc.feed(&[0x00, 0x00, 0x01, 0x00], &mut frames), 2);
        assert_eq!(frames.pop_front().unwrap(), vec![0x02, 0x05, 0x00]);
        assert_eq!(frames.pop_front().unwrap(), vec![0x01, 0x00]);
    }

    #[test]
    fn accumulator_discards_oversized_run() {
        let mut acc = FrameAccumulator::new(4);
        let mut frames = VecDeque::new();
        acc.feed(&[1, 2, 3, 4, 5, 6, 7, 0x00, 0x02, 0x09, 0x00], &mut frames);
        assert_eq!(acc.overflows(), 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![0x02, 0x09, 0x00]);
    }
}
