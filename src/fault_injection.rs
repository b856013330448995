use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Configuration for link fault injection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkFaultConfig {
    pub enabled: bool,
    /// chance per write that one bit is flipped
    pub corrupt_rate_percent: f32,
    /// chance per write that the whole write is lost
    pub drop_rate_percent: f32,
    pub seed: u64,
}

impl Default for LinkFaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            corrupt_rate_percent: 0.0,
            drop_rate_percent: 0.0,
            seed: DEFAULT_SEED,
        }
    }
}

impl LinkFaultConfig {
    pub fn corrupting(rate_percent: f32) -> Self {
        Self {
            enabled: true,
            corrupt_rate_percent: rate_percent,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct LinkFaultCounters {
    writes: AtomicU64,
    corrupted: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFaultStats {
    pub writes: u64,
    pub corrupted: u64,
    pub dropped: u64,
}

impl LinkFaultCounters {
    pub fn snapshot(&self) -> LinkFaultStats {
        LinkFaultStats {
            writes: self.writes.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Deterministic source of fault decisions.
#[derive(Debug, Clone)]
pub struct FaultRng {
    state: u64,
}

impl FaultRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_random(&mut self) -> u64 {
        // Linear Congruential Generator: X(n+1) = (aX(n) + c) mod 2^64
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.state
    }

    /// Uniform in [0, 1), from the high bits.
    pub fn random_float(&mut self) -> f32 {
        (self.next_random() >> 40) as f32 / (1u64 << 24) as f32
    }

    pub fn below(&mut self, bound: usize) -> usize {
        if bound == 0 {
            return 0;
        }
        ((self.next_random() >> 32) % bound as u64) as usize
    }

    pub fn chance(&mut self, rate_percent: f32) -> bool {
        rate_percent > 0.0 && self.random_float() < rate_percent / 100.0
    }
}

/// Wraps a serial link and damages outgoing writes.
///
/// Reads pass through untouched, so a pair of wrapped endpoints injects
/// faults in both directions.
#[derive(Debug)]
pub struct FaultyLink<L> {
    inner: L,
    config: LinkFaultConfig,
    rng: FaultRng,
    counters: Arc<LinkFaultCounters>,
}

impl<L> FaultyLink<L> {
    pub fn new(inner: L, config: LinkFaultConfig) -> Self {
        let rng = FaultRng::new(config.seed);
        Self {
            inner,
            config,
            rng,
            counters: Arc::new(LinkFaultCounters::default()),
        }
    }

    /// Counters that stay readable after the link is moved into a transport.
    pub fn counters(&self) -> Arc<LinkFaultCounters> {
        Arc::clone(&self.counters)
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L: AsyncRead + Unpin> AsyncRead for FaultyLink<L> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<L: AsyncWrite + Unpin> AsyncWrite for FaultyLink<L> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.config.enabled || buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        this.counters.writes.fetch_add(1, Ordering::Relaxed);

        if this.rng.chance(this.config.drop_rate_percent) {
            trace!("dropping {} byte write", buf.len());
            this.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Poll::Ready(Ok(buf.len()));
        }

        if this.rng.chance(this.config.corrupt_rate_percent) {
            let mut damaged = buf.to_vec();
            let byte = this.rng.below(damaged.len());
            let bit = this.rng.below(8);
            damaged[byte] ^= 1 << bit;
            trace!("flipped bit {} of byte {}", bit, byte);
            this.counters.corrupted.fetch_add(1, Ordering::Relaxed);
            return Pin::new(&mut this.inner).poll_write(cx, &damaged);
        }

        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rng_is_deterministic() {
        let mut a = FaultRng::new(DEFAULT_SEED);
        let mut b = FaultRng::new(DEFAULT_SEED);
        for _ in 0..100 {
            assert_eq!(a.below(1000), b.below(1000));
        }
    }

    #[test]
    fn chance_tracks_rate() {
        let mut rng = FaultRng::new(DEFAULT_SEED);
        let hits = (0..10_000).filter(|_| rng.chance(25.0)).count();
        assert!((2000..3000).contains(&hits), "{}", hits);
        assert!(!(0..1000).any(|_| rng.chance(0.0)));
    }

    #[test]
    fn random_float_in_unit_range() {
        let mut rng = FaultRng::new(7);
        for _ in 0..1000 {
            let v = rng.random_float();
            assert!((0.0..1.0).contains(&v));
        }
    }
}
