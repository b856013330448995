//! Firmware base shared by every satellite box.
//!
//! A satellite sits between an upstream link (towards the core) and a
//! downstream link (towards the rest of the chain). Frames from downstream are
//! relayed upstream untouched; messages from upstream are handled locally when
//! addressed here and forwarded downstream unless addressed only here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::discovery::Discovery;
use crate::message::{Destination, Message, Payload, SatelliteId};
use crate::protocol::{Command, ProtocolError};
use crate::registry::PowerReading;
use crate::transport::Transport;

const ANNOUNCE_INTERVAL_MS: u64 = 3000;
const STATUS_INTERVAL_MS: u64 = 3000;
const POWER_INTERVAL_MS: u64 = 5000;
const POWER_CHECK_INTERVAL_MS: u64 = 500;
const LOOP_PERIOD_MS: u64 = 100;
const ANNOUNCE_BACKOFF_MS: u64 = 1000;
const STATUS_RETRY_MS: u64 = 50;
const FORWARD_BACKOFF_MS: u64 = 10;

const BROWNOUT_THRESHOLD_V: f32 = 4.7;
const BUS_CUTOFF_V: f32 = 17.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteConfig {
    /// NEW_SAT period while unidentified
    pub announce_interval: Duration,
    /// STATUS (ACTIVE) or PING (IDLE) period
    pub status_interval: Duration,
    /// POWER telemetry period
    pub power_interval: Duration,
    pub power_check_interval: Duration,
    pub loop_period: Duration,
    pub brownout_threshold_v: f32,
    pub bus_cutoff_v: f32,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_millis(ANNOUNCE_INTERVAL_MS),
            status_interval: Duration::from_millis(STATUS_INTERVAL_MS),
            power_interval: Duration::from_millis(POWER_INTERVAL_MS),
            power_check_interval: Duration::from_millis(POWER_CHECK_INTERVAL_MS),
            loop_period: Duration::from_millis(LOOP_PERIOD_MS),
            brownout_threshold_v: BROWNOUT_THRESHOLD_V,
            bus_cutoff_v: BUS_CUTOFF_V,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    /// heartbeat only
    Idle,
    /// full STATUS reporting
    Active,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Idle => "IDLE",
            OperatingMode::Active => "ACTIVE",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "IDLE" => Some(OperatingMode::Idle),
            "ACTIVE" => Some(OperatingMode::Active),
            _ => None,
        }
    }
}

/// Box-specific hardware behind the protocol.
pub trait SatelliteHardware: Send + Sync + 'static {
    /// Compact status snapshot sent as the STATUS payload.
    fn status_bytes(&self) -> Vec<u8>;

    fn power_readings(&self) -> PowerReading;

    fn downstream_power_enabled(&self) -> bool {
        true
    }

    /// Immediately switch off the downstream bus.
    fn cut_downstream_power(&self) {}

    /// Box-specific commands (LED, display, encoder). Returns whether it was handled.
    fn handle_command(&self, message: &Message) -> bool;

    fn on_mode_change(&self, _mode: OperatingMode) {}

    fn reboot(&self);
}

pub struct Satellite<H> {
    discovery: Mutex<Discovery>,
    mode: Mutex<OperatingMode>,
    up: Arc<Transport>,
    down: Arc<Transport>,
    hardware: Arc<H>,
    config: SatelliteConfig,
    status_requested: AtomicBool,
}

impl<H: SatelliteHardware> Satellite<H> {
    pub fn new(
        sat_type: u8,
        type_name: &str,
        up: Arc<Transport>,
        down: Arc<Transport>,
        hardware: Arc<H>,
        config: SatelliteConfig,
    ) -> Result<Arc<Self>, ProtocolError> {
        Ok(Arc::new(Self {
            discovery: Mutex::new(Discovery::new(sat_type, type_name)?),
            mode: Mutex::new(OperatingMode::Idle),
            up,
            down,
            hardware,
            config,
            status_requested: AtomicBool::new(false),
        }))
    }

    pub async fn identity(&self) -> Option<SatelliteId> {
        self.discovery.lock().await.identity()
    }

    pub async fn mode(&self) -> OperatingMode {
        *self.mode.lock().await
    }

    pub fn hardware(&self) -> &Arc<H> {
        &self.hardware
    }

    /// Ask for a STATUS on the next transmit pass instead of waiting out the interval.
    pub fn trigger_status_update(&self) {
        self.status_requested.store(true, Ordering::Release);
    }

    /// Start the relay and the three firmware loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.up.enable_relay_from(&self.down);

        let tx = Arc::clone(self);
        let rx = Arc::clone(self);
        let power = Arc::clone(self);
        vec![
            tokio::spawn(async move { tx.tx_upstream().await }),
            tokio::spawn(async move { rx.rx_upstream().await }),
            tokio::spawn(async move { power.monitor_power().await }),
        ]
    }

    async fn send(transport: &Transport, message: &Message) -> bool {
        match transport.send(message).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!("cannot encode {}: {}", message, e);
                false
            }
        }
    }

    /// Send upstream under our own identity. Nothing is sent while unidentified.
    async fn send_up(&self, command: Command, payload: Payload) -> bool {
        let Some(id) = self.identity().await else {
            debug!("{} suppressed, no identity yet", command);
            return false;
        };
        Self::send(&self.up, &Message::new(id, command, payload)).await
    }

    async fn tx_upstream(&self) {
        let mut last_tx: Option<Instant> = None;
        loop {
            let now = Instant::now();
            let due = |interval: Duration| last_tx.map_or(true, |t| now.duration_since(t) >= interval);

            let (identity, announcement) = {
                let discovery = self.discovery.lock().await;
                (discovery.identity(), discovery.announcement())
            };

            match identity {
                None => {
                    if let (Some(msg), true) = (announcement, due(self.config.announce_interval)) {
                        if Self::send(&self.up, &msg).await {
                            last_tx = Some(now);
                        } else {
                            time::sleep(Duration::from_millis(ANNOUNCE_BACKOFF_MS)).await;
                        }
                    }
                }
                Some(id) => match self.mode().await {
                    OperatingMode::Idle => {
                        if due(self.config.status_interval) {
                            let ping = Message::new(id, Command::Ping, Payload::empty());
                            if Self::send(&self.up, &ping).await {
                                last_tx = Some(now);
                                self.status_requested.store(false, Ordering::Release);
                            }
                        }
                    }
                    OperatingMode::Active => {
                        let triggered = self.status_requested.load(Ordering::Acquire);
                        if triggered || due(self.config.status_interval) {
                            let status = Message::new(
                                id,
                                Command::Status,
                                Payload::Bytes(self.hardware.status_bytes()),
                            );
                            if Self::send(&self.up, &status).await {
                                last_tx = Some(now);
                                self.status_requested.store(false, Ordering::Release);
                            } else if triggered {
                                time::sleep(Duration::from_millis(STATUS_RETRY_MS)).await;
                                continue;
                            }
                        }
                    }
                },
            }

            time::sleep(self.config.loop_period).await;
        }
    }

    async fn rx_upstream(&self) {
        loop {
            if let Some(message) = self.up.receive().await {
                self.route(&message).await;
            }
        }
    }

    /// Handle one message from upstream: locally, downstream, or both.
    pub async fn route(&self, message: &Message) {
        let identity = self.identity().await;
        let destination = message.destination();
        let for_me = identity.is_some_and(|id| destination == Destination::Node(id));
        let broadcast = matches!(destination, Destination::All | Destination::Satellites);

        if for_me || broadcast {
            self.process_local(message).await;
        }

        // ID_ASSIGN is re-issued downstream by discovery itself
        if !for_me && message.command() != Command::IdAssign && !Self::send(&self.down, message).await {
            time::sleep(Duration::from_millis(FORWARD_BACKOFF_MS)).await;
        }
    }

    async fn process_local(&self, message: &Message) {
        match message.command() {
            Command::IdAssign => self.handle_id_assign(message).await,
            Command::Mode => self.handle_mode(message).await,
            Command::Reboot => self.handle_reboot(message).await,
            Command::Ack | Command::Nack | Command::Ping => {}
            _ => {
                if !self.hardware.handle_command(message) {
                    debug!("unhandled {}", message);
                }
            }
        }
    }

    async fn handle_id_assign(&self, message: &Message) {
        let Some(text) = message.payload().as_text() else {
            warn!("ID_ASSIGN without text payload");
            return;
        };
        let outcome = self.discovery.lock().await.on_id_assign(text);

        if let Some(reply) = &outcome.reply {
            if !Self::send(&self.up, reply).await {
                warn!("HELLO not sent, will be repeated on the next ID_ASSIGN");
            }
        }
        if let Some(forward) = &outcome.forward {
            if !Self::send(&self.down, forward).await {
                warn!("ID_ASSIGN not forwarded downstream");
            }
        }
        if outcome.claimed {
            self.trigger_status_update();
        }
    }

    async fn handle_mode(&self, message: &Message) {
        let requested = message.payload().as_text().and_then(OperatingMode::parse);
        let Some(requested) = requested else {
            warn!("ignoring MODE {}", message.payload());
            return;
        };
        {
            let mut mode = self.mode.lock().await;
            if *mode == requested {
                return;
            }
            *mode = requested;
        }
        info!("operating mode -> {}", requested.as_str());
        self.send_up(Command::Log, Payload::Text(format!("MODE_CHANGED:{}", requested.as_str())))
            .await;
        self.hardware.on_mode_change(requested);
    }

    async fn handle_reboot(&self, message: &Message) {
        let reason = message.payload().as_text().unwrap_or_default().trim().to_string();
        let log = if reason.is_empty() {
            "REBOOT_CMD: No reason provided".to_string()
        } else {
            format!("REBOOT_CMD: {}", reason)
        };
        warn!("{}", log);
        self.send_up(Command::Log, Payload::Text(log)).await;
        self.hardware.reboot();
    }

    async fn monitor_power(&self) {
        let mut interval = time::interval(self.config.power_check_interval);
        let mut last_report: Option<Instant> = None;
        let mut brownout_reported = false;
        let mut bus_shutdown_pending = false;

        loop {
            interval.tick().await;
            let reading = self.hardware.power_readings();

            if self.hardware.downstream_power_enabled() && reading.bus < self.config.bus_cutoff_v {
                warn!("bus at {}V, cutting downstream power", reading.bus);
                self.hardware.cut_downstream_power();
                bus_shutdown_pending = true;
            }

            // nothing is reported before discovery completes
            if self.identity().await.is_none() {
                continue;
            }

            let now = Instant::now();
            if last_report.map_or(true, |t| now.duration_since(t) >= self.config.power_interval) {
                let values = vec![reading.input, reading.bus, reading.main];
                if self.send_up(Command::Power, Payload::Floats(values)).await {
                    last_report = Some(now);
                }
            }

            if reading.main < self.config.brownout_threshold_v {
                if !brownout_reported {
                    let text = format!("LOGIC_BROWNOUT:{}V", reading.main);
                    brownout_reported = self.send_up(Command::Error, Payload::Text(text)).await;
                }
            } else {
                brownout_reported = false;
            }

            if bus_shutdown_pending
                && self
                    .send_up(Command::Error, Payload::text("BUS_SHUTDOWN:LOW_V"))
                    .await
            {
                bus_shutdown_pending = false;
            }
        }
    }
}
