//! Dispatch latency monitoring
//!
//! Tracks handler invocation latency on the fabric's dispatch worker. The
//! histogram is guarded by a mutex; recording happens once per handler
//! invocation, which is already orders of magnitude slower than the lock.

use std::sync::atomic::{AtomicU64, Ordering};

use hdrhistogram::Histogram;
use parking_lot::Mutex;

/// Latency statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    /// Handler invocations observed
    pub samples: u64,
    pub p50_latency_ns: u64,
    pub p95_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

/// Records handler dispatch latency
pub struct DispatchMonitor {
    histogram: Mutex<Histogram<u64>>,
    samples: AtomicU64,
}

impl DispatchMonitor {
    pub fn new() -> Self {
        // 3 significant digits, auto-resizing; values are nanoseconds.
        let histogram = Histogram::new(3).expect("3 significant digits is in range");
        Self {
            histogram: Mutex::new(histogram),
            samples: AtomicU64::new(0),
        }
    }

    /// Record one handler invocation latency in nanoseconds
    pub fn record(&self, latency_ns: u64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        let mut histogram = self.histogram.lock();
        let _ = histogram.record(latency_ns.max(1));
    }

    /// Snapshot the current percentiles
    pub fn stats(&self) -> DispatchStats {
        let histogram = self.histogram.lock();
        DispatchStats {
            samples: self.samples.load(Ordering::Relaxed),
            p50_latency_ns: histogram.value_at_quantile(0.50),
            p95_latency_ns: histogram.value_at_quantile(0.95),
            p99_latency_ns: histogram.value_at_quantile(0.99),
            max_latency_ns: histogram.max(),
        }
    }

    /// Clear recorded samples
    pub fn reset(&self) {
        self.samples.store(0, Ordering::Relaxed);
        self.histogram.lock().reset();
    }
}

impl Default for DispatchMonitor {
    fn default() -> Self {
        Self::new()
    }
}
