use arrayvec::ArrayString;
use heapless::FnvIndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::message::SatelliteId;

pub const MAX_SATELLITES: usize = 128;
pub const MAX_STATUS_BYTES: usize = 32;
const TYPE_NAME_CAPACITY: usize = 16;

pub type TypeName = ArrayString<TYPE_NAME_CAPACITY>;

/// Fixed-capacity copy of a type name, truncated on a char boundary.
pub fn type_name(name: &str) -> TypeName {
    let mut out = TypeName::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry full, cannot add {0}")]
    Full(SatelliteId),
}

/// Volts reported by a satellite's POWER telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub input: f32,
    pub bus: f32,
    pub main: f32,
}

impl PowerReading {
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        match values {
            [input, bus, main] => Some(Self {
                input: *input,
                bus: *bus,
                main: *main,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SatelliteEntry {
    pub id: SatelliteId,
    pub sat_type_name: TypeName,
    pub is_active: bool,
    pub last_seen: Instant,
    /// set when the watchdog marks the entry inactive, cleared on restore
    pub was_offline: bool,
    pub last_status: heapless::Vec<u8, MAX_STATUS_BYTES>,
    pub power: Option<PowerReading>,
}

impl SatelliteEntry {
    fn new(id: SatelliteId, name: &str, now: Instant) -> Self {
        Self {
            id,
            sat_type_name: type_name(name),
            is_active: true,
            last_seen: now,
            was_offline: false,
            last_status: heapless::Vec::new(),
            power: None,
        }
    }
}

/// Serializable view of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteSnapshot {
    pub id: String,
    pub sat_type_name: String,
    pub is_active: bool,
    pub silent_for_ms: u64,
    pub last_status: Vec<u8>,
    pub power: Option<PowerReading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    /// no entry for this identity
    Unknown,
    Seen,
    /// entry was offline and is active again
    Restored,
}

/// Known satellites, keyed by identity. Entries are never removed.
#[derive(Debug, Default)]
pub struct SatelliteRegistry {
    entries: FnvIndexMap<SatelliteId, SatelliteEntry, MAX_SATELLITES>,
}

impl SatelliteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &SatelliteId) -> Option<&SatelliteEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &SatelliteId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SatelliteEntry> {
        self.entries.values()
    }

    pub fn active_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_active).count()
    }

    /// Register a satellite that introduced itself. Returns `true` if it was new.
    pub fn register(&mut self, id: SatelliteId, name: &str, now: Instant) -> Result<bool, RegistryError> {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.sat_type_name = type_name(name);
            entry.last_seen = now;
            return Ok(false);
        }
        self.entries
            .insert(id, SatelliteEntry::new(id, name, now))
            .map_err(|_| RegistryError::Full(id))?;
        Ok(true)
    }

    /// Record a sign of life.
    pub fn touch(&mut self, id: &SatelliteId, now: Instant) -> Touch {
        let Some(entry) = self.entries.get_mut(id) else {
            return Touch::Unknown;
        };
        entry.last_seen = now;
        if entry.was_offline {
            entry.was_offline = false;
            entry.is_active = true;
            Touch::Restored
        } else {
            Touch::Seen
        }
    }

    pub fn record_status(&mut self, id: &SatelliteId, status: &[u8]) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.last_status.clear();
        let len = status.len().min(MAX_STATUS_BYTES);
        // cannot fail: len is bounded by capacity
        let _ = entry.last_status.extend_from_slice(&status[..len]);
        true
    }

    pub fn record_power(&mut self, id: &SatelliteId, reading: PowerReading) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.power = Some(reading);
                true
            }
            None => false,
        }
    }

    /// Mark entries silent for longer than `threshold` inactive.
    /// Each loss is reported once; returns the identities that just went offline.
    pub fn check_links(&mut self, now: Instant, threshold: Duration) -> Vec<SatelliteId> {
        let mut lost = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.is_active && now.saturating_duration_since(entry.last_seen) > threshold {
                entry.is_active = false;
                entry.was_offline = true;
                lost.push(entry.id);
            }
        }
        lost
    }

    pub fn snapshot(&self, now: Instant) -> Vec<SatelliteSnapshot> {
        self.entries
            .values()
            .map(|e| SatelliteSnapshot {
                id: e.id.to_string(),
                sat_type_name: e.sat_type_name.to_string(),
                is_active: e.is_active,
                silent_for_ms: now.saturating_duration_since(e.last_seen).as_millis() as u64,
                last_status: e.last_status.to_vec(),
                power: e.power,
            })
            .collect()
    }
}
