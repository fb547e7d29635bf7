//! Monotonic time utilities
//!
//! Liveness math and frame timestamps run on a monotonic clock, never wall
//! time. The `TimestampProvider` trait lets tests substitute a manually
//! advanced clock so timeout behavior is deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds since the process monotonic epoch
pub fn monotonic_nanos() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Source of monotonic timestamps
pub trait TimestampProvider: Send + Sync {
    /// Current timestamp in nanoseconds
    fn now_nanos(&self) -> u64;

    /// Current timestamp in milliseconds
    fn now_millis(&self) -> u64 {
        self.now_nanos() / 1_000_000
    }
}

/// Default provider backed by the process monotonic clock
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl TimestampProvider for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        monotonic_nanos()
    }
}

/// Manually driven clock for tests
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by the given number of nanoseconds
    pub fn advance_nanos(&self, delta: u64) {
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }

    /// Advance the clock by the given number of milliseconds
    pub fn advance_millis(&self, delta: u64) {
        self.advance_nanos(delta * 1_000_000);
    }

    /// Set the clock to an absolute value
    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl TimestampProvider for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
