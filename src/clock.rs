use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

/// Wall-clock source in epoch milliseconds.
///
/// Cooldowns, the audio heartbeat, the transition lock and the watchdog all
/// read time through this trait instead of calling `Utc::now()` directly.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Production clock: epoch captured once at construction, advanced by the
/// tokio monotonic clock. Under `tokio::time::pause()` it moves together
/// with the runtime's virtual time, so ramps and cooldowns stay coherent.
pub struct TokioClock {
    epoch_ms: u64,
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            epoch_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for pure logic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn at(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
