//! Synapse - lock-free agent coordination fabric
//!
//! Interlocking concurrent primitives that let independent worker agents
//! exchange fixed-size binary messages, publish high-frequency telemetry
//! frames, and drive a pair of feedback-control loops whose proposals are
//! arbitrated by a coordinator.
//!
//! ## Components
//!
//! - [`spsc::SpscRing`] — bounded lock-free SPSC queue of fixed-size records
//! - [`fabric::CommunicationFabric`] — agent registry, routing, broadcast,
//!   heartbeat liveness, discovery
//! - [`metrics::MetricsPipeline`] — telemetry frame assembly and bounded
//!   publish with batch/real-time fan-out
//! - [`optimizer`] — performance and UX control loops plus the coordinator
//!   that resolves conflicts and dispatches executors

pub mod constants;
pub mod error;
pub mod fabric;
pub mod metrics;
pub mod monitoring;
pub mod optimizer;
pub mod spsc;
pub mod utils;

// Re-export main components
pub use error::{Result, SynapseError};
pub use fabric::{
    AgentDescriptor, AgentId, AgentInfo, CommunicationFabric, FabricConfig, FabricMetrics,
    Message, MessageBuilder, MessagePriority, MessageType,
};
pub use metrics::{MetricsFrame, MetricsPipeline, PipelineConfig, PipelineStats};
pub use monitoring::{DispatchMonitor, DispatchStats};
pub use optimizer::{
    Coordinator, CoordinatorConfig, CoordinatorMetrics, OptimizationAction, OptimizationTarget,
    PerformanceLoop, PerformanceLoopConfig, Proposal, Strategy, UxLoop, UxLoopConfig,
};
pub use spsc::SpscRing;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
