//! One serial link: framed send (queued or direct), validated receive and
//! raw frame relay from a second link.
//!
//! Every write to the link goes through exactly one path. In queued mode that
//! is the send worker task; in direct mode it is a mutex around the writer.
//! Either way two frames never interleave on the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::codec::{self, FrameAccumulator, FrameError};
use crate::message::Message;
use crate::protocol::{Protocol, ProtocolError, MAX_FRAME_SIZE};

const DEFAULT_QUEUE_CAPACITY: usize = 32;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 100;
const DEFAULT_READ_CHUNK: usize = 256;
const RELAY_RETRY_BACKOFF_MS: u64 = 5;

/// Anything byte-oriented and bidirectional can stand in for a UART.
pub trait SerialLink: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> SerialLink for T where T: AsyncRead + AsyncWrite + Send + 'static {}

pub type LinkReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `None` writes directly from the caller
    pub queue_capacity: Option<usize>,
    pub receive_timeout: Duration,
    pub read_chunk: usize,
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            receive_timeout: Duration::from_millis(DEFAULT_RECEIVE_TIMEOUT_MS),
            read_chunk: DEFAULT_READ_CHUNK,
            max_frame_len: MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn direct() -> Self {
        Self {
            queue_capacity: None,
            ..Self::default()
        }
    }
}

/// Link counters, shared by the caller, the send worker and the relay task.
#[derive(Debug, Default)]
pub struct TransportStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
    frames_relayed: AtomicU64,
    overflows: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStatsSnapshot {
    pub frames_sent: u64,
    /// refused because the outbound queue was full
    pub frames_dropped: u64,
    pub frames_received: u64,
    /// failed stuffing, checksum or schema validation
    pub frames_rejected: u64,
    pub frames_relayed: u64,
    pub overflows: u64,
    pub write_errors: u64,
}

impl TransportStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

struct RxState {
    reader: LinkReader,
    acc: FrameAccumulator,
    ready: VecDeque<Vec<u8>>,
    buf: Vec<u8>,
    eof: bool,
}

impl RxState {
    /// Read once and split what arrived into frames. `false` on EOF or error.
    async fn fill(&mut self, name: &str, stats: &TransportStats) -> bool {
        match self.reader.read(&mut self.buf[..]).await {
            Ok(0) => {
                info!("{} link closed", name);
                self.eof = true;
                false
            }
            Ok(n) => {
                let before = self.acc.overflows();
                self.acc.feed(&self.buf[..n], &mut self.ready);
                let overflowed = self.acc.overflows() - before;
                if overflowed > 0 {
                    warn!("{} receive buffer overflow, discarded {} partial frame(s)", name, overflowed);
                    stats.overflows.fetch_add(overflowed, Ordering::Relaxed);
                }
                true
            }
            Err(e) => {
                warn!("{} link read error: {}", name, e);
                self.eof = true;
                false
            }
        }
    }
}

/// What happened to a frame handed to the outbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Submitted {
    Accepted,
    /// queue full; the same frame may be retried later
    Full,
    /// the write failed; retrying the same frame will not help
    Failed,
    /// the send worker is gone
    Closed,
}

#[derive(Clone)]
enum Outbound {
    Queued(mpsc::Sender<Vec<u8>>),
    Direct(Arc<Mutex<LinkWriter>>),
}

impl Outbound {
    async fn submit(&self, frame: Vec<u8>, name: &Arc<str>, stats: &Arc<TransportStats>) -> Submitted {
        match self {
            Outbound::Queued(tx) => match tx.try_send(frame) {
                Ok(()) => Submitted::Accepted,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("{} outbound queue full, frame refused", name);
                    TransportStats::bump(&stats.frames_dropped);
                    Submitted::Full
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Submitted::Closed,
            },
            Outbound::Direct(writer) => {
                // The write runs in its own task holding the writer lock, so a
                // cancelled caller cannot leave half a frame on the wire.
                let mut writer = Arc::clone(writer).lock_owned().await;
                let name = Arc::clone(name);
                let stats = Arc::clone(stats);
                let write = tokio::spawn(async move { write_frame(&mut writer, &frame, &name, &stats).await });
                match write.await {
                    Ok(true) => Submitted::Accepted,
                    Ok(false) | Err(_) => Submitted::Failed,
                }
            }
        }
    }
}

async fn write_frame(writer: &mut LinkWriter, frame: &[u8], name: &str, stats: &TransportStats) -> bool {
    let result = match writer.write_all(frame).await {
        Ok(()) => writer.flush().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            TransportStats::bump(&stats.frames_sent);
            true
        }
        Err(e) => {
            warn!("{} link write error: {}", name, e);
            TransportStats::bump(&stats.write_errors);
            false
        }
    }
}

async fn send_worker(
    name: Arc<str>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    mut writer: LinkWriter,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<TransportStats>,
) {
    loop {
        // The write itself sits outside the select so shutdown never cuts a frame in half.
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        write_frame(&mut writer, &frame, &name, &stats).await;
    }
    debug!("{} send worker stopped", name);
}

/// A framed, checksum-validated endpoint on one serial link.
///
/// Must be created inside a tokio runtime: queued mode spawns its send worker
/// immediately.
pub struct Transport {
    name: Arc<str>,
    protocol: Arc<Protocol>,
    config: TransportConfig,
    outbound: Outbound,
    rx: Arc<Mutex<RxState>>,
    stats: Arc<TransportStats>,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    pub fn new<L: SerialLink>(
        name: &str,
        link: L,
        protocol: Arc<Protocol>,
        config: TransportConfig,
    ) -> Self {
        let (reader, writer) = tokio::io::split(link);
        Self::from_parts(name, Box::new(reader), Box::new(writer), protocol, config)
    }

    pub fn from_parts(
        name: &str,
        reader: LinkReader,
        writer: LinkWriter,
        protocol: Arc<Protocol>,
        config: TransportConfig,
    ) -> Self {
        let name: Arc<str> = Arc::from(name);
        let stats = Arc::new(TransportStats::default());
        let (shutdown, _) = watch::channel(false);

        let outbound = match config.queue_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                tokio::spawn(send_worker(
                    Arc::clone(&name),
                    rx,
                    writer,
                    shutdown.subscribe(),
                    Arc::clone(&stats),
                ));
                Outbound::Queued(tx)
            }
            None => Outbound::Direct(Arc::new(Mutex::new(writer))),
        };

        let rx = RxState {
            reader,
            acc: FrameAccumulator::new(config.max_frame_len),
            ready: VecDeque::new(),
            buf: vec![0u8; config.read_chunk.max(1)],
            eof: false,
        };

        Self {
            name,
            protocol,
            config,
            outbound,
            rx: Arc::new(Mutex::new(rx)),
            stats,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.outbound, Outbound::Queued(_))
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    /// Encode and submit a message.
    ///
    /// `Ok(false)` means the frame was not taken: the queue is full, the write
    /// failed or the link is shut down. `Err` means the message cannot be
    /// encoded at all.
    pub async fn send(&self, message: &Message) -> Result<bool, ProtocolError> {
        let frame = codec::encode_frame(message, &self.protocol)?;
        debug!("{} tx {}", self.name, message);
        Ok(self.send_raw(frame).await)
    }

    /// Submit an already stuffed and terminated frame.
    pub async fn send_raw(&self, frame: Vec<u8>) -> bool {
        self.outbound.submit(frame, &self.name, &self.stats).await == Submitted::Accepted
    }

    /// Wait up to the configured timeout for the next valid message.
    ///
    /// Frames that fail validation are counted, logged and skipped.
    pub async fn receive(&self) -> Option<Message> {
        let deadline = Instant::now() + self.config.receive_timeout;
        let Ok(mut rx) = time::timeout_at(deadline, self.rx.lock()).await else {
            return None;
        };

        loop {
            while let Some(frame) = rx.ready.pop_front() {
                match codec::decode_frame(&frame, &self.protocol) {
                    Ok(message) => {
                        TransportStats::bump(&self.stats.frames_received);
                        debug!("{} rx {}", self.name, message);
                        return Some(message);
                    }
                    Err(e) => self.reject(&e),
                }
            }

            if rx.eof {
                drop(rx);
                time::sleep_until(deadline).await;
                return None;
            }

            match time::timeout_at(deadline, rx.fill(&self.name, &self.stats)).await {
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    fn reject(&self, error: &FrameError) {
        TransportStats::bump(&self.stats.frames_rejected);
        match error {
            FrameError::Checksum { .. } => warn!("{} dropped frame: {}", self.name, error),
            _ => debug!("{} dropped frame: {}", self.name, error),
        }
    }

    /// Forward every raw frame arriving on `source` onto this link, undecoded.
    ///
    /// The relay task takes over `source`'s receive side for as long as it runs;
    /// `source.receive()` yields nothing afterwards. A full queue is retried
    /// after a short backoff so relayed frames are not lost to local bursts; a
    /// frame whose write fails is counted and dropped.
    pub fn enable_relay_from(&self, source: &Transport) {
        let rx = Arc::clone(&source.rx);
        let source_name = Arc::clone(&source.name);
        let source_stats = Arc::clone(&source.stats);
        let outbound = self.outbound.clone();
        let name = Arc::clone(&self.name);
        let stats = Arc::clone(&self.stats);
        let mut shutdown = self.shutdown.subscribe();

        info!("relaying {} -> {}", source_name, name);

        tokio::spawn(async move {
            let mut rx = rx.lock().await;
            loop {
                while let Some(frame) = rx.ready.pop_front() {
                    loop {
                        match outbound.submit(frame.clone(), &name, &stats).await {
                            Submitted::Accepted => {
                                TransportStats::bump(&stats.frames_relayed);
                                break;
                            }
                            Submitted::Failed => {
                                debug!("{} relay dropped a frame after a write error", name);
                                break;
                            }
                            Submitted::Closed => return,
                            Submitted::Full => {}
                        }
                        if *shutdown.borrow() {
                            return;
                        }
                        time::sleep(Duration::from_millis(RELAY_RETRY_BACKOFF_MS)).await;
                    }
                }

                if rx.eof {
                    break;
                }

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = rx.fill(&source_name, &source_stats) => {}
                }
            }
            debug!("relay {} -> {} stopped", source_name, name);
        });
    }

    /// Stop the send worker and any relay feeding this link.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl core::fmt::Debug for Transport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("queued", &self.is_queued())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
