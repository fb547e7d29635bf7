//! Real-time telemetry pipeline
//!
//! Producers fill the sections of the frame being assembled through the
//! `record_*` writers; `collect_frame` seals it with a monotonic timestamp
//! and publishes it into the pipeline's single SPSC ring. A collection
//! worker seals at a configurable rate when producers have written since the
//! last tick; a processing worker drains published frames, feeding each one
//! to the real-time subscriber and batches of them to the batch subscriber.
//!
//! The assembly mutex is the external serialization the ring's
//! single-producer contract requires: every path that publishes holds it.
//! The processing worker is the only consumer.

pub mod codec;
pub mod frame;

pub use codec::{decode_stream, deserialize_frames, encode_stream, serialize_frames};
pub use frame::{
    InteractionSection, MetricsFrame, PerformanceSection, UxSection, VisualSection,
};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_COLLECTION_RATE_HZ, DEFAULT_METRICS_CAPACITY,
    MAX_COLLECTION_RATE_HZ, NANOS_PER_SEC, PROCESSING_IDLE_TIMEOUT_MS,
};
use crate::error::{Result, SynapseError};
use crate::spsc::SpscRing;
use crate::utils::{MonotonicClock, TimestampProvider};

/// Real-time subscriber, invoked once per published frame on the processing
/// worker
pub type FrameCallback = Arc<dyn Fn(&MetricsFrame) + Send + Sync>;

/// Batch subscriber, invoked with drained frames in publication order
pub type BatchCallback = Arc<dyn Fn(&[MetricsFrame]) + Send + Sync>;

/// Pipeline configuration
#[derive(Clone)]
pub struct PipelineConfig {
    /// Collection worker tick rate, 1..=1000 Hz
    pub collection_rate_hz: u32,
    /// Frames handed to the batch subscriber per invocation
    pub batch_size: usize,
    /// Wrap serialized streams in the compressed envelope
    pub compression_enabled: bool,
    /// Ring capacity (power of 2)
    pub buffer_capacity: usize,
    pub clock: Arc<dyn TimestampProvider>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collection_rate_hz: DEFAULT_COLLECTION_RATE_HZ,
            batch_size: DEFAULT_BATCH_SIZE,
            compression_enabled: false,
            buffer_capacity: DEFAULT_METRICS_CAPACITY,
            clock: Arc::new(MonotonicClock),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection_rate(mut self, hz: u32) -> Result<Self> {
        if hz == 0 || hz > MAX_COLLECTION_RATE_HZ {
            return Err(SynapseError::config(format!(
                "collection rate must be 1..={MAX_COLLECTION_RATE_HZ} Hz"
            )));
        }
        self.collection_rate_hz = hz;
        Ok(self)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(SynapseError::config("batch size must be positive"));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(SynapseError::config("buffer capacity must be a power of 2"));
        }
        self.buffer_capacity = capacity;
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimestampProvider>) -> Self {
        self.clock = clock;
        self
    }
}

/// Snapshot of the pipeline's counters
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub frames_published: u64,
    pub frames_processed: u64,
    pub dropped_frames: u64,
    pub batches_delivered: u64,
    /// Frames currently waiting in the ring
    pub buffer_utilization: usize,
}

struct AssemblyState {
    frame: MetricsFrame,
    /// Any `record_*` ran since the last seal
    dirty: bool,
    /// Last sealed timestamp; publication timestamps never decrease
    last_timestamp: u64,
}

struct PipelineShared {
    ring: SpscRing<MetricsFrame>,
    assembly: Mutex<AssemblyState>,
    running: AtomicBool,
    stopped: AtomicBool,
    rate_hz: AtomicU32,
    batch_size: AtomicUsize,
    compression: AtomicBool,
    realtime: Mutex<Option<FrameCallback>>,
    batch: Mutex<Option<BatchCallback>>,
    publish_tx: Sender<()>,
    publish_rx: Mutex<Option<Receiver<()>>>,
    frames_published: AtomicU64,
    frames_processed: AtomicU64,
    dropped_frames: AtomicU64,
    batches_delivered: AtomicU64,
    clock: Arc<dyn TimestampProvider>,
}

/// Telemetry pipeline
pub struct MetricsPipeline {
    shared: Arc<PipelineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MetricsPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let ring = SpscRing::with_capacity(config.buffer_capacity)?;
        let (publish_tx, publish_rx) = bounded(1);

        Ok(Self {
            shared: Arc::new(PipelineShared {
                ring,
                assembly: Mutex::new(AssemblyState {
                    frame: MetricsFrame::default(),
                    dirty: false,
                    last_timestamp: 0,
                }),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                rate_hz: AtomicU32::new(config.collection_rate_hz),
                batch_size: AtomicUsize::new(config.batch_size),
                compression: AtomicBool::new(config.compression_enabled),
                realtime: Mutex::new(None),
                batch: Mutex::new(None),
                publish_tx,
                publish_rx: Mutex::new(Some(publish_rx)),
                frames_published: AtomicU64::new(0),
                frames_processed: AtomicU64::new(0),
                dropped_frames: AtomicU64::new(0),
                batches_delivered: AtomicU64::new(0),
                clock: config.clock,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the collection and processing workers
    pub fn start(&self) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(SynapseError::ShuttingDown);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut workers = self.workers.lock();
        for (name, f) in [
            ("metrics-collect", PipelineShared::collection_worker as fn(Arc<PipelineShared>)),
            ("metrics-process", PipelineShared::processing_worker),
        ] {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || f(shared))
                .map_err(|e| SynapseError::config(format!("failed to spawn {name}: {e}")))?;
            workers.push(handle);
        }
        debug!("pipeline started");
        Ok(())
    }

    /// Stop and join the workers; no frame is published afterwards
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.publish_tx.try_send(());
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        debug!("pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    // ----- producers -----

    /// Update the performance section of the frame being assembled
    pub fn record_performance(
        &self,
        gpu_utilization: f32,
        memory_usage: u64,
        frame_time_ms: f32,
        compute_time_ms: f32,
        queue_depth: u32,
    ) {
        let mut assembly = self.shared.assembly.lock();
        assembly.frame.set_performance(
            gpu_utilization,
            memory_usage,
            frame_time_ms,
            compute_time_ms,
            queue_depth,
        );
        assembly.dirty = true;
    }

    /// Update the interaction section of the frame being assembled
    pub fn record_interaction(
        &self,
        cursor_x: f32,
        cursor_y: f32,
        button_mask: u32,
        key_mask: u32,
        intensity: f32,
        event_count: u32,
    ) {
        let mut assembly = self.shared.assembly.lock();
        assembly
            .frame
            .set_interaction(cursor_x, cursor_y, button_mask, key_mask, intensity, event_count);
        assembly.dirty = true;
    }

    /// Update the visual section of the frame being assembled
    pub fn record_visual(
        &self,
        luminance: f32,
        contrast: f32,
        pixels_changed: u32,
        triangles_rendered: u32,
        dominant_color: [f32; 4],
    ) {
        let mut assembly = self.shared.assembly.lock();
        assembly.frame.set_visual(
            luminance,
            contrast,
            pixels_changed,
            triangles_rendered,
            dominant_color,
        );
        assembly.dirty = true;
    }

    /// Update the ux section of the frame being assembled
    pub fn record_ux(
        &self,
        usability: f32,
        engagement: f32,
        frustration: f32,
        pattern_count: u32,
        total_interaction_time_ns: u64,
    ) {
        let mut assembly = self.shared.assembly.lock();
        assembly.frame.set_ux(
            usability,
            engagement,
            frustration,
            pattern_count,
            total_interaction_time_ns,
        );
        assembly.dirty = true;
    }

    /// Seal the current frame and publish it; begins a new empty frame.
    /// Fails with `QueueFull` when the ring is saturated (the frame is
    /// dropped and counted).
    pub fn collect_frame(&self) -> Result<()> {
        self.shared.collect()
    }

    // ----- consumers -----

    /// Consume one published frame
    pub fn try_next_frame(&self) -> Option<MetricsFrame> {
        self.shared.ring.try_dequeue()
    }

    /// Consume every currently published frame, in publication order
    pub fn drain_pending(&self) -> Vec<MetricsFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.shared.ring.try_dequeue() {
            frames.push(frame);
        }
        frames
    }

    // ----- serialization -----

    /// Serialize frames according to the pipeline's compression setting
    pub fn serialize(&self, frames: &[MetricsFrame]) -> Result<Vec<u8>> {
        if self.shared.compression.load(Ordering::Relaxed) {
            codec::encode_stream(frames, true)
        } else {
            Ok(codec::serialize_frames(frames))
        }
    }

    /// Decode either serialization form back into frames
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Vec<MetricsFrame>> {
        codec::decode_stream(bytes)
    }

    // ----- subscribers & configuration -----

    /// Install the per-frame subscriber, run synchronously on the processing
    /// worker
    pub fn set_realtime_callback<F>(&self, callback: F)
    where
        F: Fn(&MetricsFrame) + Send + Sync + 'static,
    {
        *self.shared.realtime.lock() = Some(Arc::new(callback));
    }

    /// Install the batch subscriber
    pub fn set_batch_callback<F>(&self, callback: F)
    where
        F: Fn(&[MetricsFrame]) + Send + Sync + 'static,
    {
        *self.shared.batch.lock() = Some(Arc::new(callback));
    }

    pub fn set_collection_rate(&self, hz: u32) -> Result<()> {
        if hz == 0 || hz > MAX_COLLECTION_RATE_HZ {
            return Err(SynapseError::config(format!(
                "collection rate must be 1..={MAX_COLLECTION_RATE_HZ} Hz"
            )));
        }
        self.shared.rate_hz.store(hz, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_batch_size(&self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(SynapseError::config("batch size must be positive"));
        }
        self.shared.batch_size.store(batch_size, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.shared.compression.store(enabled, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PipelineStats {
        let shared = &self.shared;
        PipelineStats {
            frames_published: shared.frames_published.load(Ordering::Relaxed),
            frames_processed: shared.frames_processed.load(Ordering::Relaxed),
            dropped_frames: shared.dropped_frames.load(Ordering::Relaxed),
            batches_delivered: shared.batches_delivered.load(Ordering::Relaxed),
            buffer_utilization: shared.ring.len(),
        }
    }
}

impl Drop for MetricsPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PipelineShared {
    fn collect(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SynapseError::ShuttingDown);
        }

        // The assembly lock serializes every publishing path, which is what
        // keeps the ring single-producer.
        let mut assembly = self.assembly.lock();
        let now = self.clock.now_nanos();
        let timestamp = now.max(assembly.last_timestamp);
        assembly.last_timestamp = timestamp;

        let mut sealed = assembly.frame;
        sealed.timestamp = timestamp;

        match self.ring.try_enqueue(sealed) {
            Ok(()) => {
                assembly.frame = MetricsFrame::default();
                assembly.dirty = false;
                drop(assembly);
                self.frames_published.fetch_add(1, Ordering::Relaxed);
                let _ = self.publish_tx.try_send(());
                trace!(timestamp, "frame published");
                Ok(())
            }
            Err(e) => {
                drop(assembly);
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!("metrics ring full, frame dropped");
                Err(e)
            }
        }
    }

    fn collection_worker(shared: Arc<PipelineShared>) {
        debug!("collection worker up");
        while shared.running.load(Ordering::Acquire) {
            let hz = shared.rate_hz.load(Ordering::Relaxed).max(1) as u64;
            std::thread::sleep(Duration::from_nanos(NANOS_PER_SEC / hz));
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            let dirty = shared.assembly.lock().dirty;
            if dirty {
                let _ = shared.collect();
            }
        }
        debug!("collection worker down");
    }

    fn processing_worker(shared: Arc<PipelineShared>) {
        let Some(rx) = shared.publish_rx.lock().take() else {
            return;
        };
        debug!("processing worker up");

        let mut batch: Vec<MetricsFrame> = Vec::new();
        while shared.running.load(Ordering::Acquire) {
            match rx.recv_timeout(Duration::from_millis(PROCESSING_IDLE_TIMEOUT_MS)) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {
                    shared.drain_into(&mut batch);
                    // Idle moment: hand over whatever accumulated short of a
                    // full batch so trickles still reach the subscriber.
                    if !batch.is_empty() {
                        shared.deliver_batch(&mut batch);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Frames accepted before the stop flag still flow to subscribers.
        shared.drain_into(&mut batch);
        if !batch.is_empty() {
            shared.deliver_batch(&mut batch);
        }
        debug!("processing worker down");
    }

    fn drain_into(&self, batch: &mut Vec<MetricsFrame>) {
        let batch_size = self.batch_size.load(Ordering::Relaxed).max(1);
        while let Some(frame) = self.ring.try_dequeue() {
            self.frames_processed.fetch_add(1, Ordering::Relaxed);
            let realtime = self.realtime.lock().clone();
            if let Some(callback) = realtime {
                callback(&frame);
            }
            batch.push(frame);
            if batch.len() >= batch_size {
                self.deliver_batch(batch);
            }
        }
    }

    fn deliver_batch(&self, batch: &mut Vec<MetricsFrame>) {
        let callback = self.batch.lock().clone();
        if let Some(callback) = callback {
            callback(batch.as_slice());
        }
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn pipeline_with_clock(capacity: usize) -> (MetricsPipeline, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        // Collection rate 1 Hz keeps the collection worker quiet while tests
        // drive `collect_frame` directly.
        let config = PipelineConfig::new()
            .with_collection_rate(1)
            .unwrap()
            .with_buffer_capacity(capacity)
            .unwrap()
            .with_clock(Arc::clone(&clock) as Arc<dyn TimestampProvider>);
        (MetricsPipeline::new(config).unwrap(), clock)
    }

    #[test]
    fn test_collect_and_drain() {
        let (pipeline, clock) = pipeline_with_clock(8);
        pipeline.record_performance(0.5, 1024, 16.7, 4.0, 2);
        clock.advance_millis(1);
        pipeline.collect_frame().unwrap();

        pipeline.record_ux(0.9, 0.8, 0.1, 3, 500);
        clock.advance_millis(1);
        pipeline.collect_frame().unwrap();

        let frames = pipeline.drain_pending();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].performance.frame_time, 16.7);
        // The second frame started empty; only its ux section is set.
        assert_eq!(frames[1].performance.frame_time, 0.0);
        assert_eq!(frames[1].ux.engagement, 0.8);
        assert!(frames[1].timestamp > frames[0].timestamp);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let (pipeline, clock) = pipeline_with_clock(8);
        clock.set_nanos(100);
        pipeline.record_visual(0.1, 0.2, 1, 1, [0.0; 4]);
        pipeline.collect_frame().unwrap();

        // A clock that stalls (or re-reads the same tick) must not produce a
        // regressing timestamp.
        clock.set_nanos(100);
        pipeline.record_visual(0.3, 0.4, 2, 2, [0.0; 4]);
        pipeline.collect_frame().unwrap();

        let frames = pipeline.drain_pending();
        assert!(frames[1].timestamp >= frames[0].timestamp);
    }

    #[test]
    fn test_full_ring_drops_and_counts() {
        let (pipeline, _clock) = pipeline_with_clock(2);
        for _ in 0..2 {
            pipeline.record_interaction(1.0, 2.0, 0, 0, 0.5, 1);
            pipeline.collect_frame().unwrap();
        }
        let result = pipeline.collect_frame();
        assert!(matches!(result, Err(SynapseError::QueueFull)));
        assert_eq!(pipeline.stats().dropped_frames, 1);
        assert_eq!(pipeline.stats().frames_published, 2);
    }

    #[test]
    fn test_serialize_respects_compression_flag() {
        let (pipeline, _clock) = pipeline_with_clock(8);
        pipeline.record_ux(0.5, 0.5, 0.5, 1, 1);
        pipeline.collect_frame().unwrap();
        let frames = pipeline.drain_pending();

        let plain = pipeline.serialize(&frames).unwrap();
        assert_eq!(plain.len(), frames.len() * crate::constants::FRAME_SIZE);

        pipeline.set_compression_enabled(true);
        let wrapped = pipeline.serialize(&frames).unwrap();
        assert_ne!(wrapped.len(), plain.len());

        assert_eq!(pipeline.deserialize(&plain).unwrap(), frames);
        assert_eq!(pipeline.deserialize(&wrapped).unwrap(), frames);
    }

    #[test]
    fn test_workers_deliver_to_subscribers() {
        let (pipeline, clock) = pipeline_with_clock(64);
        pipeline.set_batch_size(4).unwrap();

        let realtime_seen = Arc::new(AtomicUsize::new(0));
        let batch_seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&realtime_seen);
            pipeline.set_realtime_callback(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let seen = Arc::clone(&batch_seen);
            pipeline.set_batch_callback(move |frames| {
                seen.fetch_add(frames.len(), Ordering::SeqCst);
            });
        }

        pipeline.start().unwrap();
        for i in 0..8 {
            pipeline.record_performance(0.1, i, 1.0, 0.5, 0);
            clock.advance_millis(1);
            pipeline.collect_frame().unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while batch_seen.load(Ordering::SeqCst) < 8 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pipeline.stop();

        assert_eq!(realtime_seen.load(Ordering::SeqCst), 8);
        assert_eq!(batch_seen.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_collect_after_stop_fails() {
        let (pipeline, _clock) = pipeline_with_clock(8);
        pipeline.stop();
        assert!(matches!(pipeline.collect_frame(), Err(SynapseError::ShuttingDown)));
    }
}
