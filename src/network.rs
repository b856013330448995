//! Core-side coordination of the satellite chain: discovery, inbound dispatch,
//! link watchdog and throttled display/audio feedback.

use std::sync::Arc;
use std::time::Duration;

use heapless::Deque;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::discovery;
use crate::message::{parse_type_prefix, Destination, Message, Payload, SatelliteId};
use crate::protocol::{Command, ProtocolError};
use crate::registry::{
    PowerReading, SatelliteEntry, SatelliteRegistry, SatelliteSnapshot, Touch,
};
use crate::side_effects::{
    AudioChannel, AudioPlayer, StatusDisplay, TaskSlot, CLIP_ALARM, CLIP_LINK_LOST,
    CLIP_LINK_RESTORED,
};
use crate::transport::Transport;

const LIVENESS_THRESHOLD_MS: u64 = 5000;
const MONITOR_INTERVAL_MS: u64 = 500;
const DISCOVERY_SETTLE_MS: u64 = 500;
const MAX_PENDING_EVENTS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub liveness_threshold: Duration,
    pub monitor_interval: Duration,
    /// pause after an ID_ASSIGN broadcast so HELLOs can arrive
    pub discovery_settle: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            liveness_threshold: Duration::from_millis(LIVENESS_THRESHOLD_MS),
            monitor_interval: Duration::from_millis(MONITOR_INTERVAL_MS),
            discovery_settle: Duration::from_millis(DISCOVERY_SETTLE_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    Lost(SatelliteId),
    Restored(SatelliteId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub messages_handled: u64,
    pub unknown_senders: u64,
    pub unknown_commands: u64,
    pub link_lost: u64,
    pub link_restored: u64,
    pub status_updates_dropped: u64,
    pub audio_dropped: u64,
}

/// Owns the satellite registry. Everything else sees it through accessors.
pub struct SatelliteNetworkManager<D, A> {
    config: NetworkConfig,
    registry: SatelliteRegistry,
    display: Arc<D>,
    audio: Arc<A>,
    status_slot: TaskSlot,
    audio_slot: TaskSlot,
    events: Deque<LinkEvent, MAX_PENDING_EVENTS>,
    stats: NetworkStats,
    debug_mode: bool,
    last_message: Option<Message>,
}

impl<D: StatusDisplay, A: AudioPlayer> SatelliteNetworkManager<D, A> {
    pub fn new(display: Arc<D>, audio: Arc<A>) -> Self {
        Self::with_config(display, audio, NetworkConfig::default())
    }

    pub fn with_config(display: Arc<D>, audio: Arc<A>, config: NetworkConfig) -> Self {
        Self {
            config,
            registry: SatelliteRegistry::new(),
            display,
            audio,
            status_slot: TaskSlot::new("status"),
            audio_slot: TaskSlot::new("audio"),
            events: Deque::new(),
            stats: NetworkStats::default(),
            debug_mode: false,
            last_message: None,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.debug_mode = enabled;
        if !enabled {
            self.last_message = None;
        }
    }

    /// Most recent inbound message, kept only in debug mode.
    pub fn last_message(&self) -> Option<&Message> {
        self.last_message.as_ref()
    }

    pub fn get_sat(&self, id: &SatelliteId) -> Option<&SatelliteEntry> {
        self.registry.get(id)
    }

    pub fn satellite_ids(&self) -> Vec<SatelliteId> {
        self.registry.iter().map(|e| e.id).collect()
    }

    pub fn satellite_count(&self) -> usize {
        self.registry.len()
    }

    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    pub fn power(&self, id: &SatelliteId) -> Option<PowerReading> {
        self.registry.get(id).and_then(|e| e.power)
    }

    pub fn snapshot(&self, now: Instant) -> Vec<SatelliteSnapshot> {
        self.registry.snapshot(now)
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            status_updates_dropped: self.status_slot.dropped(),
            audio_dropped: self.audio_slot.dropped(),
            ..self.stats
        }
    }

    /// Link transitions since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        let mut out = Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop_front() {
            out.push(event);
        }
        out
    }

    fn push_event(&mut self, event: LinkEvent) {
        if self.events.is_full() {
            self.events.pop_front();
        }
        // cannot fail: space was just made
        let _ = self.events.push_back(event);
    }

    fn show(&mut self, title: &'static str, subtitle: String) {
        let display = Arc::clone(&self.display);
        self.status_slot
            .try_spawn(move || async move { display.update_status(title.to_string(), subtitle).await });
    }

    fn sound(&mut self, clip: &'static str) {
        let audio = Arc::clone(&self.audio);
        self.audio_slot
            .try_spawn(move || async move { audio.play(clip.to_string(), AudioChannel::Sfx).await });
    }

    /// Forget every known satellite and build the ID_ASSIGN that restarts numbering.
    pub fn begin_discovery(&mut self, sat_type: u8) -> Message {
        self.registry = SatelliteRegistry::new();
        discovery::id_assign(sat_type, 0)
    }

    /// Dispatch one inbound message. Returns a message to send back down the chain, if any.
    pub fn handle_message(&mut self, message: &Message, now: Instant) -> Option<Message> {
        self.stats.messages_handled += 1;
        if self.debug_mode {
            self.last_message = Some(message.clone());
        }

        let sender = message.destination();
        let command = message.command();

        // NEW_SAT carries a placeholder identity, not a real one
        if let (Some(id), false) = (message.node(), command == Command::NewSat) {
            if self.registry.touch(&id, now) == Touch::Restored {
                self.restored(id);
            }
        }

        match command {
            Command::Status => {
                let recorded = match (message.node(), message.payload().as_bytes()) {
                    (Some(id), Some(bytes)) => self.registry.record_status(&id, bytes),
                    _ => false,
                };
                if !recorded {
                    self.stats.unknown_senders += 1;
                    self.show("UNKNOWN SAT", format!("{} sent STATUS.", sender));
                }
                None
            }
            Command::Power => {
                let reading = message.payload().as_floats().and_then(PowerReading::from_slice);
                match (message.node(), reading) {
                    (Some(id), Some(reading)) => {
                        if !self.registry.record_power(&id, reading) {
                            debug!("POWER from unregistered {}", id);
                        }
                    }
                    _ => warn!("malformed POWER from {}", sender),
                }
                None
            }
            Command::Error => {
                self.show("SAT ERROR", format!("ID: {} ERR: {}", sender, payload_text(message.payload())));
                self.sound(CLIP_ALARM);
                None
            }
            Command::Hello => {
                self.hello(message, now);
                None
            }
            Command::NewSat => {
                let type_text = payload_text(message.payload());
                self.show("SAT CONNECTED", format!("TYPE {} FOUND", type_text));
                match parse_type_prefix(&type_text) {
                    Ok(sat_type) => Some(discovery::id_assign(sat_type, 0)),
                    Err(e) => {
                        warn!("NEW_SAT with bad type: {}", e);
                        None
                    }
                }
            }
            Command::Log => {
                info!("[{}] {}", sender, payload_text(message.payload()));
                None
            }
            // heartbeat; the touch above is all it needs
            Command::Ping => None,
            _ => {
                self.stats.unknown_commands += 1;
                self.show("UNKNOWN COMMAND", format!("{} sent {}", sender, command));
                None
            }
        }
    }

    fn hello(&mut self, message: &Message, now: Instant) {
        let Some(id) = message.node() else {
            warn!("HELLO without a node identity ({})", message.destination());
            return;
        };
        let name = payload_text(message.payload());
        match self.registry.register(id, &name, now) {
            Ok(true) => {
                info!("satellite {} ({}) joined", id, name);
                self.show("NEW SAT", format!("{} sent HELLO.", id));
            }
            Ok(false) => debug!("HELLO heartbeat from {}", id),
            Err(e) => warn!("{}", e),
        }
    }

    fn restored(&mut self, id: SatelliteId) {
        info!("link restored: {}", id);
        self.stats.link_restored += 1;
        self.push_event(LinkEvent::Restored(id));
        self.show("LINK RESTORED", format!("ID: {}", id));
        self.sound(CLIP_LINK_RESTORED);
    }

    /// Watchdog pass. Returns how many satellites just went silent.
    pub fn check_links(&mut self, now: Instant) -> usize {
        let lost = self.registry.check_links(now, self.config.liveness_threshold);
        for id in &lost {
            warn!("link lost: {}", id);
            self.stats.link_lost += 1;
            self.push_event(LinkEvent::Lost(*id));
            self.show("LINK LOST", format!("ID: {}", id));
            self.sound(CLIP_LINK_LOST);
        }
        lost.len()
    }
}

fn payload_text(payload: &Payload) -> String {
    match payload {
        Payload::Text(s) => s.clone(),
        Payload::Raw(b) => String::from_utf8_lossy(b).into_owned(),
        other => other.to_string(),
    }
}

/// Shared handle running the manager against the core's upstream-facing link.
pub struct NetworkHandle<D, A> {
    manager: Arc<Mutex<SatelliteNetworkManager<D, A>>>,
    transport: Arc<Transport>,
}

impl<D, A> Clone for NetworkHandle<D, A> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<D: StatusDisplay, A: AudioPlayer> NetworkHandle<D, A> {
    pub fn new(manager: SatelliteNetworkManager<D, A>, transport: Arc<Transport>) -> Self {
        Self {
            manager: Arc::new(Mutex::new(manager)),
            transport,
        }
    }

    pub fn manager(&self) -> &Arc<Mutex<SatelliteNetworkManager<D, A>>> {
        &self.manager
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    async fn submit(&self, message: &Message) -> Result<bool, ProtocolError> {
        let sent = self.transport.send(message).await?;
        if !sent {
            warn!("could not queue {}", message);
        }
        Ok(sent)
    }

    /// Receive and dispatch forever.
    pub async fn monitor_messages(&self) {
        loop {
            let Some(message) = self.transport.receive().await else {
                continue;
            };
            let reply = self.manager.lock().await.handle_message(&message, Instant::now());
            if let Some(reply) = reply {
                if let Err(e) = self.submit(&reply).await {
                    warn!("reply to {} not encodable: {}", message, e);
                }
            }
        }
    }

    /// Run the link watchdog on its fixed interval forever.
    pub async fn monitor_satellites(&self) {
        let period = self.manager.lock().await.config().monitor_interval;
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.manager.lock().await.check_links(Instant::now());
        }
    }

    /// Restart identity assignment for `sat_type` from index 00.
    pub async fn discover_satellites(&self, sat_type: u8) -> Result<bool, ProtocolError> {
        let (message, display, settle) = {
            let mut manager = self.manager.lock().await;
            let message = manager.begin_discovery(sat_type);
            (message, Arc::clone(&manager.display), manager.config.discovery_settle)
        };
        display
            .update_status("SCANNING BUS...".to_string(), "ASSIGNING IDs".to_string())
            .await;
        let sent = self.submit(&message).await?;
        time::sleep(settle).await;
        Ok(sent)
    }

    pub async fn send_to(
        &self,
        id: SatelliteId,
        command: Command,
        payload: Payload,
    ) -> Result<bool, ProtocolError> {
        self.submit(&Message::new(id, command, payload)).await
    }

    /// One addressed copy per known satellite. Returns how many were queued.
    pub async fn send_all(&self, command: Command, payload: Payload) -> Result<usize, ProtocolError> {
        let ids = self.manager.lock().await.satellite_ids();
        let mut queued = 0;
        for id in ids {
            if self.submit(&Message::new(Destination::Node(id), command, payload.clone())).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }
}
