//! Performance optimization loop
//!
//! Tracks named numeric targets (frame time, GPU utilization, memory, ...)
//! and, on each tick, emits at most one proposal per violated target. The
//! choice of action follows a `(target, direction)` table; strategy biases
//! proposal priority. Execution outcomes are reported back by the
//! coordinator and folded into the loop's running statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::constants::{DEFAULT_TOLERANCE, PERF_LOOP_INTERVAL_MS};
use crate::error::{Result, SynapseError};
use crate::optimizer::{LoopKind, OptimizationAction, OptimizationTarget, Proposal, Strategy};
use crate::utils::{AtomicF64, MonotonicClock, TimestampProvider};

/// Outcome callback: `(action, success, improvement)`
pub type ResultCallback = Arc<dyn Fn(OptimizationAction, bool, f64) + Send + Sync>;

/// Configuration for the performance loop
#[derive(Clone)]
pub struct PerformanceLoopConfig {
    pub tick_interval: Duration,
    pub strategy: Strategy,
    pub clock: Arc<dyn TimestampProvider>,
}

impl Default for PerformanceLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(PERF_LOOP_INTERVAL_MS),
            strategy: Strategy::default(),
            clock: Arc::new(MonotonicClock),
        }
    }
}

impl PerformanceLoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimestampProvider>) -> Self {
        self.clock = clock;
        self
    }
}

/// Snapshot of the loop's statistics
#[derive(Debug, Clone, Default)]
pub struct PerformanceLoopMetrics {
    pub optimizations_conducted: u64,
    pub successful_optimizations: u64,
    /// Running mean of reported improvements
    pub average_improvement: f64,
    /// Last performance score pushed by the coordinator
    pub current_performance_score: f64,
}

struct PerfShared {
    tick_interval: Duration,
    running: AtomicBool,
    stopped: AtomicBool,
    strategy: Mutex<Strategy>,
    targets: Mutex<HashMap<String, OptimizationTarget>>,
    pending: Mutex<Vec<Proposal>>,
    conducted: AtomicU64,
    successful: AtomicU64,
    average_improvement: AtomicF64,
    results_seen: AtomicU64,
    performance_score: AtomicF64,
    result_callback: Mutex<Option<ResultCallback>>,
    clock: Arc<dyn TimestampProvider>,
}

/// Performance optimization loop
pub struct PerformanceLoop {
    shared: Arc<PerfShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceLoop {
    pub fn new(config: PerformanceLoopConfig) -> Self {
        Self {
            shared: Arc::new(PerfShared {
                tick_interval: config.tick_interval,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                strategy: Mutex::new(config.strategy),
                targets: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                conducted: AtomicU64::new(0),
                successful: AtomicU64::new(0),
                average_improvement: AtomicF64::new(0.0),
                results_seen: AtomicU64::new(0),
                performance_score: AtomicF64::new(0.0),
                result_callback: Mutex::new(None),
                clock: config.clock,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(SynapseError::ShuttingDown);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("perf-loop".to_owned())
            .spawn(move || {
                debug!("performance loop up");
                while shared.running.load(Ordering::Acquire) {
                    std::thread::sleep(shared.tick_interval);
                    if !shared.running.load(Ordering::Acquire) {
                        break;
                    }
                    shared.tick();
                }
                debug!("performance loop down");
            })
            .map_err(|e| SynapseError::config(format!("failed to spawn perf-loop: {e}")))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    // ----- target management -----

    pub fn add_target(&self, name: &str, target_value: f64, tolerance: Option<f64>) {
        let tolerance = tolerance.unwrap_or(DEFAULT_TOLERANCE).abs();
        let now = self.shared.clock.now_nanos();
        self.shared
            .targets
            .lock()
            .insert(name.to_owned(), OptimizationTarget::new(name, target_value, tolerance, now));
    }

    /// Feed a new sample; silently ignored for unknown targets
    pub fn update_target(&self, name: &str, current: f64) {
        let now = self.shared.clock.now_nanos();
        if let Some(target) = self.shared.targets.lock().get_mut(name) {
            target.observe(current, now);
        }
    }

    pub fn remove_target(&self, name: &str) {
        self.shared.targets.lock().remove(name);
    }

    /// Snapshot of one tracked target
    pub fn target(&self, name: &str) -> Option<OptimizationTarget> {
        self.shared.targets.lock().get(name).cloned()
    }

    // ----- strategy -----

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.shared.strategy.lock() = strategy;
    }

    pub fn strategy(&self) -> Strategy {
        *self.shared.strategy.lock()
    }

    // ----- proposals -----

    /// Queue an externally built proposal alongside generated ones
    pub fn inject_proposal(&self, proposal: Proposal) {
        self.shared.pending.lock().push(proposal);
    }

    /// Take every pending proposal, in emission order
    pub fn drain_pending_proposals(&self) -> Vec<Proposal> {
        std::mem::take(&mut *self.shared.pending.lock())
    }

    /// Run one analysis pass without the worker (tests, manual pumping)
    pub fn tick(&self) {
        self.shared.tick();
    }

    // ----- results -----

    /// Install a callback fired after every reported execution outcome
    pub fn set_result_callback<F>(&self, callback: F)
    where
        F: Fn(OptimizationAction, bool, f64) + Send + Sync + 'static,
    {
        *self.shared.result_callback.lock() = Some(Arc::new(callback));
    }

    /// Fold an execution outcome into the loop's statistics
    pub fn report_result(&self, action: OptimizationAction, success: bool, improvement: f64) {
        let shared = &self.shared;
        shared.conducted.fetch_add(1, Ordering::Relaxed);
        if success {
            shared.successful.fetch_add(1, Ordering::Relaxed);
        }
        if improvement.is_finite() {
            let n = shared.results_seen.fetch_add(1, Ordering::Relaxed) + 1;
            let mean = shared.average_improvement.load();
            shared
                .average_improvement
                .store(mean + (improvement - mean) / n as f64);
        }

        let callback = shared.result_callback.lock().clone();
        if let Some(callback) = callback {
            callback(action, success, improvement);
        }
    }

    /// Latest performance score, pushed by the coordinator
    pub fn record_performance_score(&self, score: f64) {
        if score.is_finite() {
            self.shared.performance_score.store(score.clamp(0.0, 1.0));
        }
    }

    pub fn metrics(&self) -> PerformanceLoopMetrics {
        let shared = &self.shared;
        PerformanceLoopMetrics {
            optimizations_conducted: shared.conducted.load(Ordering::Relaxed),
            successful_optimizations: shared.successful.load(Ordering::Relaxed),
            average_improvement: shared.average_improvement.load(),
            current_performance_score: shared.performance_score.load(),
        }
    }

    pub fn reset_metrics(&self) {
        let shared = &self.shared;
        shared.conducted.store(0, Ordering::Relaxed);
        shared.successful.store(0, Ordering::Relaxed);
        shared.results_seen.store(0, Ordering::Relaxed);
        shared.average_improvement.store(0.0);
    }
}

impl Drop for PerformanceLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PerfShared {
    /// One analysis pass: examine targets, emit at most one proposal per
    /// violated target.
    fn tick(&self) {
        let now = self.clock.now_nanos();
        let strategy = *self.strategy.lock();

        let mut proposals = Vec::new();
        {
            let targets = self.targets.lock();
            for target in targets.values().filter(|t| t.is_violated()) {
                let action = candidate_action(&target.name, target.is_overshooting());
                let deviation = target.deviation();
                let mut priority = if deviation > 2.0 * target.tolerance { 3 } else { 2 };
                if strategy == Strategy::PerformanceFirst {
                    priority = (priority + 1).min(4);
                }

                trace!(
                    target = %target.name,
                    current = target.current_value,
                    deviation,
                    "target violated"
                );
                proposals.push(
                    Proposal::new(action, deviation.min(1.0), priority, now, LoopKind::Performance)
                        .with_parameter("current", target.current_value)
                        .with_parameter("target", target.target_value)
                        .with_parameter("deviation", deviation),
                );
            }
        }

        if !proposals.is_empty() {
            self.pending.lock().extend(proposals);
        }
    }
}

/// `(target, direction)` lookup: which action family corrects a violation
fn candidate_action(target_name: &str, overshooting: bool) -> OptimizationAction {
    use OptimizationAction::*;
    match (target_name, overshooting) {
        ("frame_time", true) => ReduceGridSize,
        ("frame_time", false) => IncreaseGridSize,
        ("gpu_utilization", true) => ReduceGridSize,
        ("gpu_utilization", false) => IncreaseGridSize,
        ("memory_usage", true) => ModifyMemoryLayout,
        ("memory_usage", false) => IncreaseGridSize,
        ("compute_time", true) => AdjustWorkgroupSize,
        ("compute_time", false) => ChangeUpdateFrequency,
        ("queue_depth", true) => RebalancePriorityQueues,
        ("queue_depth", false) => ChangeUpdateFrequency,
        (_, _) => ChangeUpdateFrequency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn loop_with_clock() -> (PerformanceLoop, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = PerformanceLoopConfig::new()
            .with_clock(Arc::clone(&clock) as Arc<dyn TimestampProvider>);
        (PerformanceLoop::new(config), clock)
    }

    #[test]
    fn test_no_proposals_when_within_tolerance() {
        let (perf, clock) = loop_with_clock();
        perf.add_target("frame_time", 16.67, Some(0.05));
        clock.advance_millis(50);
        perf.update_target("frame_time", 16.8);
        perf.tick();
        assert!(perf.drain_pending_proposals().is_empty());
    }

    #[test]
    fn test_overshoot_generates_reduce_grid_size() {
        let (perf, clock) = loop_with_clock();
        perf.add_target("frame_time", 16.67, Some(0.05));
        clock.advance_millis(50);
        perf.update_target("frame_time", 25.0);
        perf.tick();

        let proposals = perf.drain_pending_proposals();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].action, OptimizationAction::ReduceGridSize);
        assert_eq!(proposals[0].origin, LoopKind::Performance);
        // Deviation 8.33/16.67 ≈ 0.5 is far past 2× tolerance.
        assert_eq!(proposals[0].priority, 3);
        assert!(proposals[0].parameters.contains_key("deviation"));
    }

    #[test]
    fn test_undershoot_generates_increase_grid_size() {
        let (perf, clock) = loop_with_clock();
        perf.add_target("gpu_utilization", 0.9, Some(0.05));
        clock.advance_millis(50);
        perf.update_target("gpu_utilization", 0.4);
        perf.tick();

        let proposals = perf.drain_pending_proposals();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].action, OptimizationAction::IncreaseGridSize);
    }

    #[test]
    fn test_one_proposal_per_violated_target_per_tick() {
        let (perf, clock) = loop_with_clock();
        perf.add_target("frame_time", 16.67, Some(0.05));
        perf.add_target("memory_usage", 1000.0, Some(0.05));
        clock.advance_millis(50);
        perf.update_target("frame_time", 40.0);
        perf.update_target("memory_usage", 2000.0);
        perf.tick();
        assert_eq!(perf.drain_pending_proposals().len(), 2);
    }

    #[test]
    fn test_performance_first_raises_priority() {
        let (perf, clock) = loop_with_clock();
        perf.set_strategy(Strategy::PerformanceFirst);
        perf.add_target("frame_time", 16.67, Some(0.05));
        clock.advance_millis(50);
        perf.update_target("frame_time", 40.0);
        perf.tick();
        assert_eq!(perf.drain_pending_proposals()[0].priority, 4);
    }

    #[test]
    fn test_result_reporting_updates_metrics() {
        let (perf, _clock) = loop_with_clock();
        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let observed = Arc::clone(&observed);
            perf.set_result_callback(move |action, success, improvement| {
                observed.lock().push((action, success, improvement));
            });
        }

        perf.report_result(OptimizationAction::ReduceGridSize, true, 0.2);
        perf.report_result(OptimizationAction::ReduceGridSize, false, 0.0);

        let metrics = perf.metrics();
        assert_eq!(metrics.optimizations_conducted, 2);
        assert_eq!(metrics.successful_optimizations, 1);
        assert!((metrics.average_improvement - 0.1).abs() < 1e-9);
        assert_eq!(observed.lock().len(), 2);
    }

    #[test]
    fn test_removed_target_stops_proposing() {
        let (perf, clock) = loop_with_clock();
        perf.add_target("compute_time", 4.0, Some(0.05));
        clock.advance_millis(50);
        perf.update_target("compute_time", 9.0);
        perf.remove_target("compute_time");
        perf.tick();
        assert!(perf.drain_pending_proposals().is_empty());
    }
}
