//! Optimization coordinator
//!
//! Drains pending proposals from both loops each tick, removes the loser of
//! every conflicting pair, sorts the survivors, and dispatches them through
//! host-supplied executors. Execution outcomes flow back to the originating
//! loop and into the per-family improvement averages that the adaptive
//! strategy consults.
//!
//! The coordinator takes shared ownership of both loops at construction, so
//! no lifetime games are needed to poll them from the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::constants::{COORDINATOR_INTERVAL_MS, OPTIMIZATION_RATE_ALPHA};
use crate::error::{Result, SynapseError};
use crate::optimizer::performance::PerformanceLoop;
use crate::optimizer::ux::UxLoop;
use crate::optimizer::{
    performance_score, system_efficiency, ActionFamily, LoopKind, OptimizationAction, Proposal,
    Strategy,
};
use crate::utils::{AtomicF64, MonotonicClock, TimestampProvider};

/// Host-supplied executor: applies an action and reports success
pub type Executor = Arc<dyn Fn(OptimizationAction, &HashMap<String, f64>) -> bool + Send + Sync>;

/// Coordinator configuration
#[derive(Clone)]
pub struct CoordinatorConfig {
    pub tick_interval: Duration,
    pub strategy: Strategy,
    pub clock: Arc<dyn TimestampProvider>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(COORDINATOR_INTERVAL_MS),
            strategy: Strategy::default(),
            clock: Arc::new(MonotonicClock),
        }
    }
}

impl CoordinatorConfig {
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

/// Snapshot of the coordinator's counters
#[derive(Debug, Clone, Default)]
pub struct CoordinatorMetrics {
    pub total_optimizations: u64,
    pub conflicts_resolved: u64,
    /// `(performance score + ux score) / 2`
    pub system_efficiency_score: f64,
    /// Exponential moving average of executions per second
    pub optimization_rate: f64,
}

struct CoordShared {
    tick_interval: Duration,
    running: AtomicBool,
    stopped: AtomicBool,
    strategy: Mutex<Strategy>,
    perf_loop: Arc<PerformanceLoop>,
    ux_loop: Arc<UxLoop>,
    perf_executor: Mutex<Option<Executor>>,
    ux_executor: Mutex<Option<Executor>>,
    total: AtomicU64,
    conflicts: AtomicU64,
    efficiency: AtomicF64,
    rate: AtomicF64,
    last_tick_nanos: AtomicU64,
    recent_perf_improvement: AtomicF64,
    recent_ux_improvement: AtomicF64,
    // Score inputs, refreshed by the report_* surface
    last_frame_time_ms: AtomicF64,
    last_gpu_utilization: AtomicF64,
    memory_efficiency: AtomicF64,
    throughput: AtomicF64,
    clock: Arc<dyn TimestampProvider>,
}

/// Optimization coordinator
pub struct Coordinator {
    shared: Arc<CoordShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// The coordinator shares ownership of both loops from construction
    pub fn new(
        config: CoordinatorConfig,
        perf_loop: Arc<PerformanceLoop>,
        ux_loop: Arc<UxLoop>,
    ) -> Self {
        Self {
            shared: Arc::new(CoordShared {
                tick_interval: config.tick_interval,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                strategy: Mutex::new(config.strategy),
                perf_loop,
                ux_loop,
                perf_executor: Mutex::new(None),
                ux_executor: Mutex::new(None),
                total: AtomicU64::new(0),
                conflicts: AtomicU64::new(0),
                efficiency: AtomicF64::new(0.0),
                rate: AtomicF64::new(0.0),
                last_tick_nanos: AtomicU64::new(0),
                recent_perf_improvement: AtomicF64::new(0.0),
                recent_ux_improvement: AtomicF64::new(0.0),
                last_frame_time_ms: AtomicF64::new(0.0),
                last_gpu_utilization: AtomicF64::new(0.0),
                memory_efficiency: AtomicF64::new(1.0),
                throughput: AtomicF64::new(0.0),
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
            .name("coordinator".to_owned())
            .spawn(move || {
                debug!("coordinator up");
                while shared.running.load(Ordering::Acquire) {
                    std::thread::sleep(shared.tick_interval);
                    if !shared.running.load(Ordering::Acquire) {
                        break;
                    }
                    shared.tick();
                }
                debug!("coordinator down");
            })
            .map_err(|e| SynapseError::config(format!("failed to spawn coordinator: {e}")))?;
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

    // ----- strategy & executors -----

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.shared.strategy.lock() = strategy;
        self.shared.perf_loop.set_strategy(strategy);
    }

    pub fn strategy(&self) -> Strategy {
        *self.shared.strategy.lock()
    }

    pub fn set_performance_executor<F>(&self, executor: F)
    where
        F: Fn(OptimizationAction, &HashMap<String, f64>) -> bool + Send + Sync + 'static,
    {
        *self.shared.perf_executor.lock() = Some(Arc::new(executor));
    }

    pub fn set_ux_executor<F>(&self, executor: F)
    where
        F: Fn(OptimizationAction, &HashMap<String, f64>) -> bool + Send + Sync + 'static,
    {
        *self.shared.ux_executor.lock() = Some(Arc::new(executor));
    }

    // ----- metric reports from agents -----

    /// Feed raw performance counters; refreshes the performance score
    pub fn report_performance_metrics(
        &self,
        frame_time_ms: f64,
        _compute_time_ms: f64,
        gpu_utilization: f64,
        _memory_usage: u64,
    ) {
        let shared = &self.shared;
        if frame_time_ms.is_finite() {
            shared.last_frame_time_ms.store(frame_time_ms);
        }
        if gpu_utilization.is_finite() {
            shared.last_gpu_utilization.store(gpu_utilization);
        }
        let score = shared.current_performance_score();
        shared.perf_loop.record_performance_score(score);
    }

    /// Feed UX metrics through to the UX loop
    pub fn report_ux_metrics(
        &self,
        engagement: f64,
        frustration: f64,
        usability: f64,
        latency_ms: f64,
    ) {
        let ux = &self.shared.ux_loop;
        ux.update_engagement(engagement);
        ux.update_frustration(frustration);
        ux.update_usability(usability);
        ux.update_latency(latency_ms);
    }

    /// Feed simulation throughput counters into the performance score
    pub fn report_simulation_metrics(&self, cells_processed: u64, memory_efficiency: f64) {
        let shared = &self.shared;
        shared.throughput.store(cells_processed as f64);
        if memory_efficiency.is_finite() {
            shared.memory_efficiency.store(memory_efficiency.clamp(0.0, 1.0));
        }
    }

    // ----- arbitration -----

    /// Run one drain → resolve → prioritize → dispatch cycle on the calling
    /// thread. The worker does exactly this every tick.
    pub fn arbitrate_once(&self) -> usize {
        self.shared.tick()
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        let shared = &self.shared;
        CoordinatorMetrics {
            total_optimizations: shared.total.load(Ordering::Relaxed),
            conflicts_resolved: shared.conflicts.load(Ordering::Relaxed),
            system_efficiency_score: shared.efficiency.load(),
            optimization_rate: shared.rate.load(),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CoordShared {
    fn current_performance_score(&self) -> f64 {
        performance_score(
            self.last_frame_time_ms.load(),
            self.last_gpu_utilization.load(),
            self.memory_efficiency.load(),
            self.throughput.load(),
        )
    }

    /// Returns the number of proposals dispatched
    fn tick(&self) -> usize {
        let mut proposals = self.perf_loop.drain_pending_proposals();
        proposals.extend(self.ux_loop.drain_pending_proposals());
        if proposals.is_empty() {
            self.refresh_efficiency();
            return 0;
        }

        let strategy = *self.strategy.lock();
        let survivors = self.resolve_conflicts(proposals, strategy);
        let ordered = prioritize(survivors);
        let executed = self.dispatch(ordered);

        // Executions-per-second EMA across ticks.
        let now = self.clock.now_nanos();
        let last = self.last_tick_nanos.swap(now, Ordering::Relaxed);
        if last > 0 {
            let dt_secs = now.saturating_sub(last) as f64 / 1e9;
            if dt_secs > 0.0 {
                let instantaneous = executed as f64 / dt_secs;
                let rate = self.rate.load();
                self.rate
                    .store(rate + OPTIMIZATION_RATE_ALPHA * (instantaneous - rate));
            }
        }

        self.refresh_efficiency();
        executed
    }

    fn refresh_efficiency(&self) {
        let efficiency =
            system_efficiency(self.current_performance_score(), self.ux_loop.overall_score());
        self.efficiency.store(efficiency);
    }

    /// Drop the loser of every conflicting pair. Survivors keep their
    /// emission order.
    fn resolve_conflicts(&self, proposals: Vec<Proposal>, strategy: Strategy) -> Vec<Proposal> {
        let mut discarded = vec![false; proposals.len()];

        for i in 0..proposals.len() {
            if discarded[i] {
                continue;
            }
            for j in (i + 1)..proposals.len() {
                if discarded[j] {
                    continue;
                }
                if !proposals[i].action.conflicts_with(proposals[j].action) {
                    continue;
                }

                let loser = if self.first_wins(&proposals[i], &proposals[j], strategy) {
                    j
                } else {
                    i
                };
                discarded[loser] = true;
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    winner = ?proposals[if loser == i { j } else { i }].action,
                    loser = ?proposals[loser].action,
                    "conflicting proposals resolved"
                );
                if loser == i {
                    break;
                }
            }
        }

        proposals
            .into_iter()
            .zip(discarded)
            .filter_map(|(proposal, dropped)| (!dropped).then_some(proposal))
            .collect()
    }

    /// Decide a conflicting pair: lexicographic `(priority, improvement)`,
    /// then the strategy bias, then the older proposal.
    fn first_wins(&self, a: &Proposal, b: &Proposal, strategy: Strategy) -> bool {
        let key_a = (a.priority, a.expected_improvement);
        let key_b = (b.priority, b.expected_improvement);
        if key_a != key_b {
            return key_a > key_b;
        }

        match strategy {
            Strategy::PerformanceFirst => {
                if (a.origin == LoopKind::Performance) != (b.origin == LoopKind::Performance) {
                    return a.origin == LoopKind::Performance;
                }
            }
            Strategy::UxFirst => {
                if (a.origin == LoopKind::Ux) != (b.origin == LoopKind::Ux) {
                    return a.origin == LoopKind::Ux;
                }
            }
            Strategy::Adaptive => {
                let perf_recent = self.recent_perf_improvement.load();
                let ux_recent = self.recent_ux_improvement.load();
                if (a.origin == LoopKind::Performance) != (b.origin == LoopKind::Performance) {
                    let perf_is_a = a.origin == LoopKind::Performance;
                    if perf_recent != ux_recent {
                        return perf_is_a == (perf_recent > ux_recent);
                    }
                }
            }
            Strategy::Balanced => {}
        }

        a.timestamp <= b.timestamp
    }

    fn dispatch(&self, proposals: Vec<Proposal>) -> usize {
        let mut executed = 0usize;
        for proposal in proposals {
            let executor = match proposal.action.family() {
                ActionFamily::Performance | ActionFamily::Hybrid => {
                    self.perf_executor.lock().clone()
                }
                ActionFamily::Ux => self.ux_executor.lock().clone(),
            };

            let Some(executor) = executor else {
                trace!(action = ?proposal.action, "no executor installed, proposal discarded");
                continue;
            };

            let success = executor(proposal.action, &proposal.parameters);
            executed += 1;
            self.total.fetch_add(1, Ordering::Relaxed);

            let improvement = if success { proposal.expected_improvement } else { 0.0 };
            let cell = match proposal.origin {
                LoopKind::Performance => &self.recent_perf_improvement,
                LoopKind::Ux => &self.recent_ux_improvement,
            };
            let recent = cell.load();
            cell.store(recent + OPTIMIZATION_RATE_ALPHA * (improvement - recent));

            match proposal.origin {
                LoopKind::Performance => {
                    self.perf_loop.report_result(proposal.action, success, improvement)
                }
                LoopKind::Ux => self.ux_loop.report_result(proposal.action, success, improvement),
            }
        }
        executed
    }
}

/// Sort by priority (desc), expected improvement (desc), age (oldest first)
fn prioritize(mut proposals: Vec<Proposal>) -> Vec<Proposal> {
    proposals.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| {
                b.expected_improvement
                    .partial_cmp(&a.expected_improvement)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    proposals
}
