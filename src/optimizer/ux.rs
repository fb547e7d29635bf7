//! UX optimization loop
//!
//! Ingests experience metrics (each clamped on write), keeps bounded
//! per-metric history, estimates trends with a least-squares slope over the
//! most recent samples, and emits at most one UX-family proposal per tick
//! when frustration runs high or engagement runs low.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::constants::{
    ENGAGEMENT_PROPOSAL_THRESHOLD, FRUSTRATION_PROPOSAL_THRESHOLD, TREND_WINDOW,
    UX_HISTORY_CAPACITY, UX_LOOP_INTERVAL_MS,
};
use crate::error::{Result, SynapseError};
use crate::optimizer::performance::ResultCallback;
use crate::optimizer::{ux_score, LoopKind, OptimizationAction, Proposal};
use crate::utils::{AtomicF64, MonotonicClock, TimestampProvider};

/// Configuration for the UX loop
#[derive(Clone)]
pub struct UxLoopConfig {
    pub tick_interval: Duration,
    /// Bounded history capacity per metric
    pub history_capacity: usize,
    /// Samples used for the trend slope
    pub trend_window: usize,
    pub clock: Arc<dyn TimestampProvider>,
}

impl Default for UxLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(UX_LOOP_INTERVAL_MS),
            history_capacity: UX_HISTORY_CAPACITY,
            trend_window: TREND_WINDOW,
            clock: Arc::new(MonotonicClock),
        }
    }
}

impl UxLoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SynapseError::config("history capacity must be positive"));
        }
        self.history_capacity = capacity;
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimestampProvider>) -> Self {
        self.clock = clock;
        self
    }
}

/// Current UX metric values
#[derive(Debug, Clone, Default)]
pub struct UxMetricsSnapshot {
    pub engagement: f64,
    pub frustration: f64,
    pub usability: f64,
    pub interaction_latency_ms: f64,
    pub visual_consistency: f64,
    /// `(engagement + (1 - frustration) + usability) / 3`
    pub overall_score: f64,
}

/// Fixed-capacity sample series with a least-squares trend estimate
struct BoundedSeries {
    samples: Vec<f64>,
    capacity: usize,
}

impl BoundedSeries {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Least-squares slope over the last `window` samples, per sample step
    fn trend(&self, window: usize) -> f64 {
        let tail_len = self.samples.len().min(window);
        if tail_len < 2 {
            return 0.0;
        }
        let tail = &self.samples[self.samples.len() - tail_len..];

        let n = tail_len as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = tail.iter().sum::<f64>() / n;
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (i, y) in tail.iter().enumerate() {
            let dx = i as f64 - mean_x;
            numerator += dx * (y - mean_y);
            denominator += dx * dx;
        }
        if denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.len()
    }
}

struct UxHistory {
    engagement: BoundedSeries,
    frustration: BoundedSeries,
    usability: BoundedSeries,
}

struct UxShared {
    tick_interval: Duration,
    trend_window: usize,
    running: AtomicBool,
    stopped: AtomicBool,
    engagement: AtomicF64,
    frustration: AtomicF64,
    usability: AtomicF64,
    interaction_latency_ms: AtomicF64,
    visual_consistency: AtomicF64,
    history: Mutex<UxHistory>,
    pending: Mutex<Vec<Proposal>>,
    conducted: AtomicU64,
    successful: AtomicU64,
    result_callback: Mutex<Option<ResultCallback>>,
    clock: Arc<dyn TimestampProvider>,
}

/// UX optimization loop
pub struct UxLoop {
    shared: Arc<UxShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UxLoop {
    pub fn new(config: UxLoopConfig) -> Self {
        Self {
            shared: Arc::new(UxShared {
                tick_interval: config.tick_interval,
                trend_window: config.trend_window,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                engagement: AtomicF64::new(0.0),
                frustration: AtomicF64::new(0.0),
                usability: AtomicF64::new(0.0),
                interaction_latency_ms: AtomicF64::new(0.0),
                visual_consistency: AtomicF64::new(0.0),
                history: Mutex::new(UxHistory {
                    engagement: BoundedSeries::new(config.history_capacity),
                    frustration: BoundedSeries::new(config.history_capacity),
                    usability: BoundedSeries::new(config.history_capacity),
                }),
                pending: Mutex::new(Vec::new()),
                conducted: AtomicU64::new(0),
                successful: AtomicU64::new(0),
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
            .name("ux-loop".to_owned())
            .spawn(move || {
                debug!("ux loop up");
                while shared.running.load(Ordering::Acquire) {
                    std::thread::sleep(shared.tick_interval);
                    if !shared.running.load(Ordering::Acquire) {
                        break;
                    }
                    shared.tick();
                }
                debug!("ux loop down");
            })
            .map_err(|e| SynapseError::config(format!("failed to spawn ux-loop: {e}")))?;
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

    // ----- metric ingestion (clamped on write) -----

    pub fn update_engagement(&self, level: f64) {
        store_unit(&self.shared.engagement, level);
    }

    pub fn update_frustration(&self, index: f64) {
        store_unit(&self.shared.frustration, index);
    }

    pub fn update_usability(&self, score: f64) {
        store_unit(&self.shared.usability, score);
    }

    /// Interaction latency in milliseconds, clamped to non-negative
    pub fn update_latency(&self, latency_ms: f64) {
        if latency_ms.is_finite() {
            self.shared.interaction_latency_ms.store(latency_ms.max(0.0));
        }
    }

    pub fn update_visual_consistency(&self, consistency: f64) {
        store_unit(&self.shared.visual_consistency, consistency);
    }

    /// Overall UX score in [0, 1]
    pub fn overall_score(&self) -> f64 {
        let shared = &self.shared;
        ux_score(
            shared.engagement.load(),
            shared.frustration.load(),
            shared.usability.load(),
        )
    }

    pub fn metrics(&self) -> UxMetricsSnapshot {
        let shared = &self.shared;
        UxMetricsSnapshot {
            engagement: shared.engagement.load(),
            frustration: shared.frustration.load(),
            usability: shared.usability.load(),
            interaction_latency_ms: shared.interaction_latency_ms.load(),
            visual_consistency: shared.visual_consistency.load(),
            overall_score: self.overall_score(),
        }
    }

    // ----- proposals -----

    pub fn inject_proposal(&self, proposal: Proposal) {
        self.shared.pending.lock().push(proposal);
    }

    pub fn drain_pending_proposals(&self) -> Vec<Proposal> {
        std::mem::take(&mut *self.shared.pending.lock())
    }

    /// Run one analysis pass without the worker (tests, manual pumping)
    pub fn tick(&self) {
        self.shared.tick();
    }

    // ----- results -----

    pub fn set_result_callback<F>(&self, callback: F)
    where
        F: Fn(OptimizationAction, bool, f64) + Send + Sync + 'static,
    {
        *self.shared.result_callback.lock() = Some(Arc::new(callback));
    }

    pub fn report_result(&self, action: OptimizationAction, success: bool, improvement: f64) {
        let shared = &self.shared;
        shared.conducted.fetch_add(1, Ordering::Relaxed);
        if success {
            shared.successful.fetch_add(1, Ordering::Relaxed);
        }
        let callback = shared.result_callback.lock().clone();
        if let Some(callback) = callback {
            callback(action, success, improvement);
        }
    }

    /// `(conducted, successful)` execution counters
    pub fn result_counters(&self) -> (u64, u64) {
        (
            self.shared.conducted.load(Ordering::Relaxed),
            self.shared.successful.load(Ordering::Relaxed),
        )
    }
}

impl Drop for UxLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn store_unit(cell: &AtomicF64, value: f64) {
    if value.is_finite() {
        cell.store(value.clamp(0.0, 1.0));
    }
}

impl UxShared {
    fn tick(&self) {
        let now = self.clock.now_nanos();
        let engagement = self.engagement.load();
        let frustration = self.frustration.load();
        let usability = self.usability.load();

        let usability_trend = {
            let mut history = self.history.lock();
            history.engagement.push(engagement);
            history.frustration.push(frustration);
            history.usability.push(usability);
            history.usability.trend(self.trend_window)
        };

        // At most one proposal per tick; frustration dominates.
        let proposal = if frustration > FRUSTRATION_PROPOSAL_THRESHOLD {
            let severity = (frustration - FRUSTRATION_PROPOSAL_THRESHOLD)
                / (1.0 - FRUSTRATION_PROPOSAL_THRESHOLD);
            Some(Proposal::new(
                OptimizationAction::AdjustControlSensitivity,
                severity,
                3,
                now,
                LoopKind::Ux,
            ))
        } else if engagement < ENGAGEMENT_PROPOSAL_THRESHOLD {
            let deficit = (ENGAGEMENT_PROPOSAL_THRESHOLD - engagement)
                / ENGAGEMENT_PROPOSAL_THRESHOLD;
            // A sinking usability score is the stronger signal when it also
            // trails engagement.
            let action = if usability_trend < 0.0 && usability < engagement {
                OptimizationAction::ModifyUiLayout
            } else {
                OptimizationAction::ChangeVisualFeedback
            };
            Some(Proposal::new(action, deficit, 2, now, LoopKind::Ux))
        } else {
            None
        };

        if let Some(proposal) = proposal {
            trace!(action = ?proposal.action, "ux proposal generated");
            let proposal = proposal
                .with_parameter("engagement", engagement)
                .with_parameter("frustration", frustration)
                .with_parameter("usability", usability)
                .with_parameter("usability_trend", usability_trend);
            self.pending.lock().push(proposal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn ux_with_clock() -> UxLoop {
        let clock = Arc::new(ManualClock::new());
        UxLoop::new(UxLoopConfig::new().with_clock(clock as Arc<dyn TimestampProvider>))
    }

    #[test]
    fn test_inputs_clamp() {
        let ux = ux_with_clock();
        ux.update_engagement(1.8);
        ux.update_frustration(-0.4);
        ux.update_usability(f64::NAN);
        ux.update_latency(-10.0);

        let metrics = ux.metrics();
        assert_eq!(metrics.engagement, 1.0);
        assert_eq!(metrics.frustration, 0.0);
        assert_eq!(metrics.usability, 0.0);
        assert_eq!(metrics.interaction_latency_ms, 0.0);
    }

    #[test]
    fn test_overall_score_formula() {
        let ux = ux_with_clock();
        ux.update_engagement(0.9);
        ux.update_frustration(0.1);
        ux.update_usability(0.6);
        assert!((ux.overall_score() - (0.9 + 0.9 + 0.6) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_high_frustration_emits_sensitivity_proposal() {
        let ux = ux_with_clock();
        ux.update_engagement(0.9);
        ux.update_frustration(0.85);
        ux.update_usability(0.9);
        ux.tick();

        let proposals = ux.drain_pending_proposals();
        assert_eq!(proposals.len(), 1);
        assert_eq!(
            proposals[0].action,
            OptimizationAction::AdjustControlSensitivity
        );
        assert_eq!(proposals[0].priority, 3);
        assert_eq!(proposals[0].origin, LoopKind::Ux);
    }

    #[test]
    fn test_low_engagement_emits_feedback_proposal() {
        let ux = ux_with_clock();
        ux.update_engagement(0.3);
        ux.update_frustration(0.2);
        ux.update_usability(0.8);
        ux.tick();

        let proposals = ux.drain_pending_proposals();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].action, OptimizationAction::ChangeVisualFeedback);
    }

    #[test]
    fn test_falling_usability_selects_ui_layout() {
        let ux = ux_with_clock();
        ux.update_engagement(0.3);
        ux.update_frustration(0.2);
        // Drive usability downward below engagement across several ticks.
        for step in 0..10 {
            ux.update_usability(0.5 - 0.04 * step as f64);
            ux.tick();
        }

        let proposals = ux.drain_pending_proposals();
        assert!(!proposals.is_empty());
        assert_eq!(
            proposals.last().unwrap().action,
            OptimizationAction::ModifyUiLayout
        );
    }

    #[test]
    fn test_healthy_metrics_stay_silent() {
        let ux = ux_with_clock();
        ux.update_engagement(0.8);
        ux.update_frustration(0.2);
        ux.update_usability(0.9);
        ux.tick();
        assert!(ux.drain_pending_proposals().is_empty());
    }

    #[test]
    fn test_bounded_series_trend() {
        let mut series = BoundedSeries::new(8);
        for value in [1.0, 2.0, 3.0, 4.0] {
            series.push(value);
        }
        assert!((series.trend(4) - 1.0).abs() < 1e-9);

        for value in [4.0, 3.0, 2.0, 1.0] {
            series.push(value);
        }
        assert!(series.trend(4) < 0.0);
        assert_eq!(series.len(), 8);

        // Capacity bound: pushing past capacity drops the oldest sample.
        series.push(9.0);
        assert_eq!(series.len(), 8);
    }
}
