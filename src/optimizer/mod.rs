//! Optimization loops and coordination
//!
//! Two independent control loops watch different halves of the system: the
//! performance loop tracks named numeric targets, the UX loop tracks
//! experience metrics. Both emit `Proposal`s; the coordinator drains them,
//! resolves conflicts, prioritizes, and dispatches the survivors through
//! host-supplied executors.

pub mod coordinator;
pub mod performance;
pub mod ux;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorMetrics};
pub use performance::{PerformanceLoop, PerformanceLoopConfig, PerformanceLoopMetrics};
pub use ux::{UxLoop, UxLoopConfig, UxMetricsSnapshot};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constants::{FRAME_TIME_BUDGET_MS, IMPROVEMENT_RATE_ALPHA};

/// Optimization actions, grouped by family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizationAction {
    // Performance actions
    ReduceGridSize,
    IncreaseGridSize,
    AdjustWorkgroupSize,
    ModifyMemoryLayout,
    ChangeUpdateFrequency,

    // UX actions
    AdjustControlSensitivity,
    ModifyUiLayout,
    ChangeVisualFeedback,
    UpdateInteractionZones,
    AdjustCameraSmoothing,

    // Hybrid actions
    RedistributeComputeLoad,
    RebalancePriorityQueues,
    OptimizeDataFlow,
}

/// Action family, used for executor routing and strategy tie-breaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionFamily {
    Performance,
    Ux,
    Hybrid,
}

/// Resource an action manipulates, for conflict detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    GridSize,
    WorkgroupSize,
    MemoryLayout,
    UpdateFrequency,
    ControlSensitivity,
    UiLayout,
    VisualFeedback,
    InteractionZones,
    CameraSmoothing,
    ComputeLoad,
    PriorityQueues,
    DataFlow,
}

/// Direction an action pushes its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increase,
    Decrease,
    /// Reshapes the resource without a scalar direction
    Restructure,
}

impl OptimizationAction {
    pub fn family(self) -> ActionFamily {
        use OptimizationAction::*;
        match self {
            ReduceGridSize | IncreaseGridSize | AdjustWorkgroupSize | ModifyMemoryLayout
            | ChangeUpdateFrequency => ActionFamily::Performance,
            AdjustControlSensitivity | ModifyUiLayout | ChangeVisualFeedback
            | UpdateInteractionZones | AdjustCameraSmoothing => ActionFamily::Ux,
            RedistributeComputeLoad | RebalancePriorityQueues | OptimizeDataFlow => {
                ActionFamily::Hybrid
            }
        }
    }

    /// Resource and direction this action applies
    pub fn resource_direction(self) -> (Resource, Direction) {
        use OptimizationAction::*;
        match self {
            ReduceGridSize => (Resource::GridSize, Direction::Decrease),
            IncreaseGridSize => (Resource::GridSize, Direction::Increase),
            AdjustWorkgroupSize => (Resource::WorkgroupSize, Direction::Restructure),
            ModifyMemoryLayout => (Resource::MemoryLayout, Direction::Restructure),
            ChangeUpdateFrequency => (Resource::UpdateFrequency, Direction::Restructure),
            AdjustControlSensitivity => (Resource::ControlSensitivity, Direction::Restructure),
            ModifyUiLayout => (Resource::UiLayout, Direction::Restructure),
            ChangeVisualFeedback => (Resource::VisualFeedback, Direction::Restructure),
            UpdateInteractionZones => (Resource::InteractionZones, Direction::Restructure),
            AdjustCameraSmoothing => (Resource::CameraSmoothing, Direction::Restructure),
            RedistributeComputeLoad => (Resource::ComputeLoad, Direction::Restructure),
            RebalancePriorityQueues => (Resource::PriorityQueues, Direction::Restructure),
            OptimizeDataFlow => (Resource::DataFlow, Direction::Restructure),
        }
    }

    /// Two actions conflict iff they target the same resource with opposite
    /// scalar directions
    pub fn conflicts_with(self, other: OptimizationAction) -> bool {
        let (resource_a, dir_a) = self.resource_direction();
        let (resource_b, dir_b) = other.resource_direction();
        resource_a == resource_b
            && matches!(
                (dir_a, dir_b),
                (Direction::Increase, Direction::Decrease)
                    | (Direction::Decrease, Direction::Increase)
            )
    }
}

/// Which loop produced a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopKind {
    Performance,
    Ux,
}

/// One proposed corrective action; lives for a single arbitration cycle
#[derive(Debug, Clone)]
pub struct Proposal {
    pub action: OptimizationAction,
    /// Named parameters; only finite values are retained
    pub parameters: HashMap<String, f64>,
    /// Expected fractional improvement, clamped to [0, 1]
    pub expected_improvement: f64,
    /// 1 (lowest) ..= 4 (highest)
    pub priority: u8,
    /// Monotonic nanoseconds at creation
    pub timestamp: u64,
    pub origin: LoopKind,
}

impl Proposal {
    pub fn new(
        action: OptimizationAction,
        expected_improvement: f64,
        priority: u8,
        timestamp: u64,
        origin: LoopKind,
    ) -> Self {
        let expected_improvement = if expected_improvement.is_finite() {
            expected_improvement.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            action,
            parameters: HashMap::new(),
            expected_improvement,
            priority: priority.clamp(1, 4),
            timestamp,
            origin,
        }
    }

    /// Attach a parameter; non-finite values are silently discarded
    pub fn with_parameter(mut self, name: &str, value: f64) -> Self {
        if value.is_finite() {
            self.parameters.insert(name.to_owned(), value);
        }
        self
    }
}

/// Strategy for conflict and tie resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Strategy {
    /// Performance proposals win ties
    PerformanceFirst,
    /// UX proposals win ties
    UxFirst,
    /// Ties break on expected improvement
    #[default]
    Balanced,
    /// The family with the higher recent average improvement wins
    Adaptive,
}

/// One tracked performance target
#[derive(Debug, Clone)]
pub struct OptimizationTarget {
    pub name: String,
    pub current_value: f64,
    pub target_value: f64,
    /// Fractional tolerance around the target
    pub tolerance: f64,
    /// First-order IIR estimate of d(current)/dt, per second
    pub improvement_rate: f64,
    /// Monotonic nanoseconds of the last sample
    pub last_update: u64,
    pub is_improving: bool,
}

impl OptimizationTarget {
    pub fn new(name: &str, target_value: f64, tolerance: f64, now_nanos: u64) -> Self {
        Self {
            name: name.to_owned(),
            current_value: 0.0,
            target_value,
            tolerance,
            improvement_rate: 0.0,
            last_update: now_nanos,
            is_improving: false,
        }
    }

    /// Fold a new sample into the record, updating the rate estimator
    pub fn observe(&mut self, current: f64, now_nanos: u64) {
        if !current.is_finite() {
            return;
        }
        let dt_secs = now_nanos.saturating_sub(self.last_update) as f64 / 1e9;
        if dt_secs > 0.0 {
            let instantaneous = (current - self.current_value) / dt_secs;
            self.improvement_rate += IMPROVEMENT_RATE_ALPHA * (instantaneous - self.improvement_rate);
        }
        let previous_distance = (self.current_value - self.target_value).abs();
        let new_distance = (current - self.target_value).abs();
        self.is_improving = new_distance < previous_distance;
        self.current_value = current;
        self.last_update = now_nanos;
    }

    /// Relative deviation from target, normalized by `max(1, |target|)`
    pub fn deviation(&self) -> f64 {
        (self.current_value - self.target_value).abs() / self.target_value.abs().max(1.0)
    }

    /// A target is violated when its relative deviation exceeds tolerance
    pub fn is_violated(&self) -> bool {
        self.deviation() > self.tolerance
    }

    /// True when the current value sits above the target
    pub fn is_overshooting(&self) -> bool {
        self.current_value > self.target_value
    }
}

/// Performance score in [0, 1] from raw counters; the frame-time budget is
/// guarded against zero and non-finite values score zero
pub fn performance_score(
    frame_time_ms: f64,
    gpu_utilization: f64,
    memory_efficiency: f64,
    throughput: f64,
) -> f64 {
    let budget = FRAME_TIME_BUDGET_MS;
    let frame_score = if frame_time_ms > 0.0 && budget > 0.0 {
        (1.0 - (frame_time_ms - budget) / budget).max(0.0)
    } else {
        0.0
    };
    let gpu_score = clamp_unit(gpu_utilization);
    let mem_score = clamp_unit(memory_efficiency);
    let throughput_score = clamp_unit(throughput / 5_000_000.0);

    let score = (frame_score + gpu_score + mem_score + throughput_score) / 4.0;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Overall UX score: `(engagement + (1 - frustration) + usability) / 3`
pub fn ux_score(engagement: f64, frustration: f64, usability: f64) -> f64 {
    let score = (clamp_unit(engagement) + (1.0 - clamp_unit(frustration)) + clamp_unit(usability))
        / 3.0;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// System efficiency: mean of the two domain scores
pub fn system_efficiency(perf_score: f64, ux_score: f64) -> f64 {
    ((clamp_unit(perf_score) + clamp_unit(ux_score)) / 2.0).clamp(0.0, 1.0)
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families() {
        assert_eq!(
            OptimizationAction::ReduceGridSize.family(),
            ActionFamily::Performance
        );
        assert_eq!(
            OptimizationAction::ModifyUiLayout.family(),
            ActionFamily::Ux
        );
        assert_eq!(
            OptimizationAction::OptimizeDataFlow.family(),
            ActionFamily::Hybrid
        );
    }

    #[test]
    fn test_grid_size_actions_conflict() {
        assert!(OptimizationAction::ReduceGridSize
            .conflicts_with(OptimizationAction::IncreaseGridSize));
        assert!(OptimizationAction::IncreaseGridSize
            .conflicts_with(OptimizationAction::ReduceGridSize));
        assert!(!OptimizationAction::ReduceGridSize
            .conflicts_with(OptimizationAction::ReduceGridSize));
        assert!(!OptimizationAction::ReduceGridSize
            .conflicts_with(OptimizationAction::ModifyUiLayout));
    }

    #[test]
    fn test_proposal_clamping() {
        let proposal = Proposal::new(
            OptimizationAction::ReduceGridSize,
            3.5,
            9,
            0,
            LoopKind::Performance,
        )
        .with_parameter("scale", 0.5)
        .with_parameter("bogus", f64::NAN);

        assert_eq!(proposal.expected_improvement, 1.0);
        assert_eq!(proposal.priority, 4);
        assert!(proposal.parameters.contains_key("scale"));
        assert!(!proposal.parameters.contains_key("bogus"));
    }

    #[test]
    fn test_target_violation() {
        let mut target = OptimizationTarget::new("frame_time", 16.67, 0.05, 0);
        target.observe(16.8, 1_000_000_000);
        assert!(!target.is_violated());

        target.observe(20.0, 2_000_000_000);
        assert!(target.is_violated());
        assert!(target.is_overshooting());
        assert!(!target.is_improving);
    }

    #[test]
    fn test_improvement_rate_tracks_direction() {
        let mut target = OptimizationTarget::new("frame_time", 16.67, 0.05, 0);
        target.observe(30.0, 1_000_000_000);
        target.observe(25.0, 2_000_000_000);
        assert!(target.improvement_rate < 0.0);
        assert!(target.is_improving);
    }

    #[test]
    fn test_scores() {
        // On budget, full utilization, perfect memory and throughput.
        let score = performance_score(16.67, 1.0, 1.0, 5_000_000.0);
        assert!((score - 1.0).abs() < 1e-9);

        // Zero frame time must not divide by zero; non-finite inputs score 0.
        assert!(performance_score(0.0, 0.5, 0.5, 0.0) >= 0.0);
        assert_eq!(performance_score(f64::NAN, f64::NAN, 0.0, 0.0), 0.0);

        assert!((ux_score(0.9, 0.1, 0.9) - 0.9).abs() < 1e-9);
        assert!((ux_score(f64::NAN, 0.0, 0.0) - 1.0 / 3.0).abs() < 1e-9);
        assert!((system_efficiency(0.8, 0.6) - 0.7).abs() < 1e-9);
    }
}
