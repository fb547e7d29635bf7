//! Shared utilities

pub mod time;

pub use time::{monotonic_nanos, ManualClock, MonotonicClock, TimestampProvider};

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free f64 cell stored as IEEE-754 bits in an `AtomicU64`
///
/// Used for metric gauges that hot paths update and observers sample; all
/// accesses are relaxed since the values never establish publication edges.
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    /// Create a cell holding `value`
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    /// Load the current value
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Store a new value
    pub fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_f64_round_trip() {
        let cell = AtomicF64::new(0.25);
        assert_eq!(cell.load(), 0.25);
        cell.store(-1.5);
        assert_eq!(cell.load(), -1.5);
    }
}
