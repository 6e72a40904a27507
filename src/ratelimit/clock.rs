//! Time sources for the rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Microseconds since the Unix epoch.
pub type Micros = u64;

/// Convert a duration to whole microseconds.
pub fn duration_micros(duration: Duration) -> Micros {
    duration.as_micros().min(u64::MAX as u128) as Micros
}

/// Convert an epoch-microsecond timestamp to epoch milliseconds.
pub fn micros_to_millis(micros: Micros) -> u64 {
    micros / 1_000
}

/// A source of wall-clock timestamps.
///
/// Timestamps are compared across instances, so implementations must use
/// wall-clock time rather than a monotonic process-local clock.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> Micros;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> Micros {
        chrono::Utc::now().timestamp_micros().max(0) as Micros
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Micros) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: Micros) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_micros(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> Micros {
        self.now.load(Ordering::SeqCst)
    }
}
