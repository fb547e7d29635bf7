//! Tuning constants and protocol limits
//!
//! Capacities that feed ring buffers must be powers of two; `validate_constants`
//! is exercised by the test suite to keep the invariants honest.

/// Size of a message record including header and payload (4 KiB)
pub const MESSAGE_SIZE: usize = 4096;

/// Size of the packed message header
pub const MESSAGE_HEADER_SIZE: usize = 32;

/// Maximum payload carried by a single message
pub const MAX_PAYLOAD_SIZE: usize = MESSAGE_SIZE - MESSAGE_HEADER_SIZE;

/// Size of a serialized metrics frame
pub const FRAME_SIZE: usize = 136;

/// Size of each metrics frame section (performance, interaction, visual, ux)
pub const FRAME_SECTION_SIZE: usize = 32;

/// Cache line size used for index-cell padding
pub const CACHE_LINE_SIZE: usize = 64;

/// Default capacity of one directional agent-pair queue (must be a power of 2)
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Default capacity of the metrics ring (must be a power of 2)
pub const DEFAULT_METRICS_CAPACITY: usize = 8192;

/// Upper bound of the fabric's priority message list
pub const MAX_PRIORITY_MESSAGES: usize = 64;

/// Heartbeat emission period
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// Liveness timeout: an agent with no heartbeat for this long is disconnected
pub const AGENT_TIMEOUT_MS: u64 = 5000;

/// Default timeout for discovery probes
pub const DISCOVERY_TIMEOUT_MS: u64 = 5000;

/// Sweeps a disconnected agent survives before its registry entry is reclaimed
pub const DISCONNECT_REAP_PERIODS: u32 = 3;

/// Pause of the dispatch worker when every queue is empty
pub const DISPATCH_IDLE_SLEEP_US: u64 = 500;

/// Messages drained from one queue before the dispatcher moves on
pub const DISPATCH_BATCH: usize = 64;

/// Default metrics collection rate
pub const DEFAULT_COLLECTION_RATE_HZ: u32 = 1000;

/// Maximum accepted metrics collection rate
pub const MAX_COLLECTION_RATE_HZ: u32 = 1000;

/// Default frame batch handed to the batch subscriber
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Idle wake-up period of the pipeline processing worker
pub const PROCESSING_IDLE_TIMEOUT_MS: u64 = 50;

/// Tick period of the performance optimization loop
pub const PERF_LOOP_INTERVAL_MS: u64 = 50;

/// Tick period of the UX optimization loop
pub const UX_LOOP_INTERVAL_MS: u64 = 50;

/// Tick period of the coordinator
pub const COORDINATOR_INTERVAL_MS: u64 = 100;

/// Capacity of the UX history rings
pub const UX_HISTORY_CAPACITY: usize = 1024;

/// Samples used for the least-squares trend estimate
pub const TREND_WINDOW: usize = 32;

/// Frustration level above which the UX loop proposes a correction
pub const FRUSTRATION_PROPOSAL_THRESHOLD: f64 = 0.7;

/// Engagement level below which the UX loop proposes a correction
pub const ENGAGEMENT_PROPOSAL_THRESHOLD: f64 = 0.5;

/// First-order IIR coefficient for the improvement-rate estimator
pub const IMPROVEMENT_RATE_ALPHA: f64 = 0.2;

/// EMA coefficient for the coordinator's optimization-rate metric
pub const OPTIMIZATION_RATE_ALPHA: f64 = 0.1;

/// Frame-time budget (ms) the performance score is normalized against
pub const FRAME_TIME_BUDGET_MS: f64 = 16.67;

/// Default target tolerance (fractional)
pub const DEFAULT_TOLERANCE: f64 = 0.05;

/// Nanoseconds per second
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Validate that the constants are mutually consistent
pub fn validate_constants() -> std::result::Result<(), &'static str> {
    if !DEFAULT_INBOX_CAPACITY.is_power_of_two() {
        return Err("DEFAULT_INBOX_CAPACITY must be a power of 2");
    }
    if !DEFAULT_METRICS_CAPACITY.is_power_of_two() {
        return Err("DEFAULT_METRICS_CAPACITY must be a power of 2");
    }
    if MESSAGE_HEADER_SIZE + MAX_PAYLOAD_SIZE != MESSAGE_SIZE {
        return Err("header and payload must exactly fill MESSAGE_SIZE");
    }
    if FRAME_SIZE != 8 + 4 * FRAME_SECTION_SIZE {
        return Err("frame must be a timestamp plus four sections");
    }
    if MAX_COLLECTION_RATE_HZ == 0 || DEFAULT_COLLECTION_RATE_HZ > MAX_COLLECTION_RATE_HZ {
        return Err("collection rates out of range");
    }
    if MAX_PRIORITY_MESSAGES == 0 {
        return Err("priority list bound must be positive");
    }
    Ok(())
}
