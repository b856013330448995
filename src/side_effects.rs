//! Display and audio collaborators, and the single-slot spawner that keeps a
//! misbehaving satellite from flooding them.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::trace;

pub const CLIP_ALARM: &str = "alarm_klaxon.wav";
pub const CLIP_LINK_LOST: &str = "link_lost.wav";
pub const CLIP_LINK_RESTORED: &str = "link_restored.wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioChannel {
    Music,
    Sfx,
    Voice,
}

/// Two-line status readout on the core.
pub trait StatusDisplay: Send + Sync + 'static {
    fn update_status(&self, title: String, subtitle: String) -> impl Future<Output = ()> + Send;
}

pub trait AudioPlayer: Send + Sync + 'static {
    fn play(&self, clip: String, channel: AudioChannel) -> impl Future<Output = ()> + Send;
}

/// Holds at most one outstanding task. While it runs, further requests are dropped.
#[derive(Debug)]
pub struct TaskSlot {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    spawned: u64,
    dropped: u64,
}

impl TaskSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handle: None,
            spawned: 0,
            dropped: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the future built by `make` unless a previous one is still running.
    ///
    /// `make` is only called when the slot is free, so a dropped request never
    /// creates a future at all.
    pub fn try_spawn<F, Fut>(&mut self, make: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_busy() {
            self.dropped += 1;
            trace!("{} slot busy, dropping request", self.name);
            return false;
        }
        self.handle = Some(tokio::spawn(make()));
        self.spawned += 1;
        true
    }

    pub fn spawned(&self) -> u64 {
        self.spawned
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.abort();
    }
}
