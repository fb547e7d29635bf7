//! Fixed-layout telemetry frames
//!
//! A `MetricsFrame` is an 8-byte timestamp followed by four 32-byte sections
//! (performance, interaction, visual, ux), 136 bytes in total, trivially
//! copyable so it moves through the pipeline's ring without serialization.
//! Probability-like scalars clamp to [0, 1] on write; non-finite inputs are
//! dropped and the previous value is retained.

use static_assertions::const_assert_eq;

use crate::constants::{FRAME_SECTION_SIZE, FRAME_SIZE};

/// GPU and compute performance counters
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct PerformanceSection {
    /// GPU utilization in [0, 1]
    pub gpu_utilization: f32,
    _pad0: u32,
    /// Device memory in use, bytes
    pub memory_usage: u64,
    /// Wall time of the last frame, milliseconds
    pub frame_time: f32,
    /// Compute submission time, milliseconds
    pub compute_time: f32,
    /// Commands waiting in the submission queue
    pub queue_depth: u32,
    _pad1: u32,
}

/// Input-device interaction counters
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct InteractionSection {
    pub cursor_x: f32,
    pub cursor_y: f32,
    pub button_mask: u32,
    pub key_mask: u32,
    /// Interaction intensity in [0, 1]
    pub interaction_intensity: f32,
    pub event_count: u32,
    _pad: [u32; 2],
}

/// Rendered-output characteristics
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct VisualSection {
    pub luminance: f32,
    pub contrast: f32,
    pub pixels_changed: u32,
    pub triangles_rendered: u32,
    /// Dominant color as rgba
    pub dominant_color: [f32; 4],
}

/// UX analysis results
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct UxSection {
    /// Usability score in [0, 1]
    pub usability: f32,
    /// Engagement level in [0, 1]
    pub engagement: f32,
    /// Frustration index in [0, 1]
    pub frustration: f32,
    pub pattern_count: u32,
    /// Cumulative interaction time, nanoseconds
    pub total_interaction_time: u64,
    _pad: [u32; 2],
}

/// One telemetry observation window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct MetricsFrame {
    /// Monotonic nanoseconds, stamped when the frame is sealed
    pub timestamp: u64,
    pub performance: PerformanceSection,
    pub interaction: InteractionSection,
    pub visual: VisualSection,
    pub ux: UxSection,
}

const_assert_eq!(std::mem::size_of::<PerformanceSection>(), FRAME_SECTION_SIZE);
const_assert_eq!(std::mem::size_of::<InteractionSection>(), FRAME_SECTION_SIZE);
const_assert_eq!(std::mem::size_of::<VisualSection>(), FRAME_SECTION_SIZE);
const_assert_eq!(std::mem::size_of::<UxSection>(), FRAME_SECTION_SIZE);
const_assert_eq!(std::mem::size_of::<MetricsFrame>(), FRAME_SIZE);

/// Clamp a probability-like scalar into [0, 1]; non-finite inputs keep the
/// previous value
pub(crate) fn write_unit(slot: &mut f32, value: f32) {
    if value.is_finite() {
        *slot = value.clamp(0.0, 1.0);
    }
}

/// Write a scalar that only needs to be finite
pub(crate) fn write_finite(slot: &mut f32, value: f32) {
    if value.is_finite() {
        *slot = value;
    }
}

impl MetricsFrame {
    /// Record the performance section
    pub fn set_performance(
        &mut self,
        gpu_utilization: f32,
        memory_usage: u64,
        frame_time_ms: f32,
        compute_time_ms: f32,
        queue_depth: u32,
    ) {
        write_unit(&mut self.performance.gpu_utilization, gpu_utilization);
        self.performance.memory_usage = memory_usage;
        write_finite(&mut self.performance.frame_time, frame_time_ms);
        write_finite(&mut self.performance.compute_time, compute_time_ms);
        self.performance.queue_depth = queue_depth;
    }

    /// Record the interaction section
    pub fn set_interaction(
        &mut self,
        cursor_x: f32,
        cursor_y: f32,
        button_mask: u32,
        key_mask: u32,
        intensity: f32,
        event_count: u32,
    ) {
        write_finite(&mut self.interaction.cursor_x, cursor_x);
        write_finite(&mut self.interaction.cursor_y, cursor_y);
        self.interaction.button_mask = button_mask;
        self.interaction.key_mask = key_mask;
        write_unit(&mut self.interaction.interaction_intensity, intensity);
        self.interaction.event_count = event_count;
    }

    /// Record the visual section
    pub fn set_visual(
        &mut self,
        luminance: f32,
        contrast: f32,
        pixels_changed: u32,
        triangles_rendered: u32,
        dominant_color: [f32; 4],
    ) {
        write_finite(&mut self.visual.luminance, luminance);
        write_finite(&mut self.visual.contrast, contrast);
        self.visual.pixels_changed = pixels_changed;
        self.visual.triangles_rendered = triangles_rendered;
        for (slot, channel) in self.visual.dominant_color.iter_mut().zip(dominant_color) {
            write_unit(slot, channel);
        }
    }

    /// Record the ux section
    pub fn set_ux(
        &mut self,
        usability: f32,
        engagement: f32,
        frustration: f32,
        pattern_count: u32,
        total_interaction_time_ns: u64,
    ) {
        write_unit(&mut self.ux.usability, usability);
        write_unit(&mut self.ux.engagement, engagement);
        write_unit(&mut self.ux.frustration, frustration);
        self.ux.pattern_count = pattern_count;
        self.ux.total_interaction_time = total_interaction_time_ns;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_is_exactly_136_bytes() {
        assert_eq!(std::mem::size_of::<MetricsFrame>(), 136);
    }

    #[test]
    fn test_unit_scalars_clamp() {
        let mut frame = MetricsFrame::default();
        frame.set_ux(1.7, -0.3, 0.5, 2, 10);
        assert_eq!(frame.ux.usability, 1.0);
        assert_eq!(frame.ux.engagement, 0.0);
        assert_eq!(frame.ux.frustration, 0.5);
    }

    #[test]
    fn test_non_finite_inputs_dropped() {
        let mut frame = MetricsFrame::default();
        frame.set_performance(0.5, 1024, 16.7, 4.2, 3);
        frame.set_performance(f32::NAN, 2048, f32::INFINITY, 5.0, 4);

        // Non-finite scalars keep their previous values; plain integers land.
        assert_eq!(frame.performance.gpu_utilization, 0.5);
        assert_eq!(frame.performance.frame_time, 16.7);
        assert_eq!(frame.performance.compute_time, 5.0);
        assert_eq!(frame.performance.memory_usage, 2048);
        assert_eq!(frame.performance.queue_depth, 4);
    }

    #[test]
    fn test_dominant_color_clamps_per_channel() {
        let mut frame = MetricsFrame::default();
        frame.set_visual(0.4, 0.6, 100, 200, [1.5, -0.5, 0.25, f32::NAN]);
        assert_eq!(frame.visual.dominant_color, [1.0, 0.0, 0.25, 0.0]);
    }
}
