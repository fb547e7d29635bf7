//! Stable byte layout for telemetry frames
//!
//! The plain layout is authoritative: little-endian, each frame exactly 136
//! bytes (8-byte timestamp, then four 32-byte sections whose fields are
//! packed in declaration order and zero-padded to the section boundary).
//! `encode_stream` wraps the plain layout in a self-describing envelope with
//! optional lz4 compression and a crc32 integrity word; decoding yields
//! bitwise-identical frames.

use crc32fast::Hasher;

use crate::constants::{FRAME_SECTION_SIZE, FRAME_SIZE};
use crate::error::{Result, SynapseError};
use crate::metrics::frame::MetricsFrame;

/// Envelope magic, "SYNF" little-endian
const STREAM_MAGIC: u32 = 0x464E_5953;
const STREAM_VERSION: u8 = 1;
const FLAG_COMPRESSED: u8 = 0b0000_0001;
const ENVELOPE_HEADER_SIZE: usize = 4 + 1 + 1 + 4 + 4 + 4;

fn put_f32(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.offset..self.offset + N]);
        self.offset += N;
        out
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take::<4>())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take::<4>())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take::<8>())
    }

    fn skip(&mut self, n: usize) {
        self.offset += n;
    }
}

/// Serialize frames to the plain layout: exactly `136 * frames.len()` bytes
pub fn serialize_frames(frames: &[MetricsFrame]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frames.len() * FRAME_SIZE);
    for frame in frames {
        put_u64(&mut buf, frame.timestamp);

        // performance (24 packed + 8 pad)
        let section_start = buf.len();
        put_f32(&mut buf, frame.performance.gpu_utilization);
        put_u64(&mut buf, frame.performance.memory_usage);
        put_f32(&mut buf, frame.performance.frame_time);
        put_f32(&mut buf, frame.performance.compute_time);
        put_u32(&mut buf, frame.performance.queue_depth);
        buf.resize(section_start + FRAME_SECTION_SIZE, 0);

        // interaction (24 packed + 8 pad)
        let section_start = buf.len();
        put_f32(&mut buf, frame.interaction.cursor_x);
        put_f32(&mut buf, frame.interaction.cursor_y);
        put_u32(&mut buf, frame.interaction.button_mask);
        put_u32(&mut buf, frame.interaction.key_mask);
        put_f32(&mut buf, frame.interaction.interaction_intensity);
        put_u32(&mut buf, frame.interaction.event_count);
        buf.resize(section_start + FRAME_SECTION_SIZE, 0);

        // visual (32 packed, no pad)
        put_f32(&mut buf, frame.visual.luminance);
        put_f32(&mut buf, frame.visual.contrast);
        put_u32(&mut buf, frame.visual.pixels_changed);
        put_u32(&mut buf, frame.visual.triangles_rendered);
        for channel in frame.visual.dominant_color {
            put_f32(&mut buf, channel);
        }

        // ux (24 packed + 8 pad)
        let section_start = buf.len();
        put_f32(&mut buf, frame.ux.usability);
        put_f32(&mut buf, frame.ux.engagement);
        put_f32(&mut buf, frame.ux.frustration);
        put_u32(&mut buf, frame.ux.pattern_count);
        put_u64(&mut buf, frame.ux.total_interaction_time);
        buf.resize(section_start + FRAME_SECTION_SIZE, 0);
    }
    buf
}

/// Deserialize frames from the plain layout
pub fn deserialize_frames(bytes: &[u8]) -> Result<Vec<MetricsFrame>> {
    if bytes.len() % FRAME_SIZE != 0 {
        return Err(SynapseError::codec(format!(
            "frame stream length {} is not a multiple of {}",
            bytes.len(),
            FRAME_SIZE
        )));
    }

    let mut frames = Vec::with_capacity(bytes.len() / FRAME_SIZE);
    let mut reader = Reader::new(bytes);
    for _ in 0..bytes.len() / FRAME_SIZE {
        let mut frame = MetricsFrame {
            timestamp: reader.u64(),
            ..Default::default()
        };

        frame.performance.gpu_utilization = reader.f32();
        frame.performance.memory_usage = reader.u64();
        frame.performance.frame_time = reader.f32();
        frame.performance.compute_time = reader.f32();
        frame.performance.queue_depth = reader.u32();
        reader.skip(8);

        frame.interaction.cursor_x = reader.f32();
        frame.interaction.cursor_y = reader.f32();
        frame.interaction.button_mask = reader.u32();
        frame.interaction.key_mask = reader.u32();
        frame.interaction.interaction_intensity = reader.f32();
        frame.interaction.event_count = reader.u32();
        reader.skip(8);

        frame.visual.luminance = reader.f32();
        frame.visual.contrast = reader.f32();
        frame.visual.pixels_changed = reader.u32();
        frame.visual.triangles_rendered = reader.u32();
        for channel in &mut frame.visual.dominant_color {
            *channel = reader.f32();
        }

        frame.ux.usability = reader.f32();
        frame.ux.engagement = reader.f32();
        frame.ux.frustration = reader.f32();
        frame.ux.pattern_count = reader.u32();
        frame.ux.total_interaction_time = reader.u64();
        reader.skip(8);

        frames.push(frame);
    }
    Ok(frames)
}

/// Encode frames into the self-describing envelope, compressing the body
/// when requested
pub fn encode_stream(frames: &[MetricsFrame], compress: bool) -> Result<Vec<u8>> {
    let raw = serialize_frames(frames);
    // An empty stream has nothing to compress; keep the envelope honest.
    let (body, flags) = if compress && !raw.is_empty() {
        let compressed = lz4::block::compress(&raw, None, false)
            .map_err(|e| SynapseError::codec(format!("lz4 compression failed: {e}")))?;
        (compressed, FLAG_COMPRESSED)
    } else {
        (raw.clone(), 0)
    };

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let checksum = hasher.finalize();

    let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + body.len());
    put_u32(&mut out, STREAM_MAGIC);
    out.push(STREAM_VERSION);
    out.push(flags);
    put_u32(&mut out, frames.len() as u32);
    put_u32(&mut out, raw.len() as u32);
    put_u32(&mut out, checksum);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode either an envelope or a plain frame stream
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<MetricsFrame>> {
    if bytes.len() < 4 || bytes[0..4] != STREAM_MAGIC.to_le_bytes() {
        return deserialize_frames(bytes);
    }
    if bytes.len() < ENVELOPE_HEADER_SIZE {
        return Err(SynapseError::codec("truncated stream envelope"));
    }

    let version = bytes[4];
    if version != STREAM_VERSION {
        return Err(SynapseError::codec(format!(
            "unsupported stream version {version}"
        )));
    }
    let flags = bytes[5];
    let frame_count = u32::from_le_bytes(bytes[6..10].try_into().unwrap()) as usize;
    let raw_len = u32::from_le_bytes(bytes[10..14].try_into().unwrap()) as usize;
    let checksum = u32::from_le_bytes(bytes[14..18].try_into().unwrap());
    let body = &bytes[ENVELOPE_HEADER_SIZE..];

    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != checksum {
        return Err(SynapseError::codec("stream checksum mismatch"));
    }

    let raw = if flags & FLAG_COMPRESSED != 0 {
        lz4::block::decompress(body, Some(raw_len as i32))
            .map_err(|e| SynapseError::codec(format!("lz4 decompression failed: {e}")))?
    } else {
        body.to_vec()
    };

    if raw.len() != raw_len {
        return Err(SynapseError::codec("stream length disagrees with envelope"));
    }
    let frames = deserialize_frames(&raw)?;
    if frames.len() != frame_count {
        return Err(SynapseError::codec("frame count disagrees with envelope"));
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(seed: u32) -> MetricsFrame {
        let mut frame = MetricsFrame {
            timestamp: 1_700_000_000_000_000_000 + seed as u64,
            ..Default::default()
        };
        frame.set_performance(0.75, 512 * 1024 * 1024, 16.7, 4.25, seed);
        frame.set_interaction(400.0, 300.0, 0b101, 0b11, 0.6, 42 + seed);
        frame.set_visual(0.45, 0.8, 1000 + seed, 250_000, [0.1, 0.2, 0.3, 1.0]);
        frame.set_ux(0.9, 0.87, 0.12, 7, 3_600_000_000_000);
        frame
    }

    #[test]
    fn test_plain_round_trip_is_exact() {
        let frames: Vec<MetricsFrame> = (0..5).map(sample_frame).collect();
        let bytes = serialize_frames(&frames);
        assert_eq!(bytes.len(), 5 * FRAME_SIZE);

        let decoded = deserialize_frames(&bytes).unwrap();
        assert_eq!(decoded, frames);
        // Re-serializing must reproduce the identical byte stream.
        assert_eq!(serialize_frames(&decoded), bytes);
    }

    #[test]
    fn test_misaligned_stream_rejected() {
        assert!(deserialize_frames(&[0u8; 135]).is_err());
        assert!(deserialize_frames(&[0u8; 137]).is_err());
        assert_eq!(deserialize_frames(&[]).unwrap().len(), 0);
    }

    #[test]
    fn test_envelope_round_trip_uncompressed() {
        let frames: Vec<MetricsFrame> = (0..3).map(sample_frame).collect();
        let stream = encode_stream(&frames, false).unwrap();
        assert_eq!(decode_stream(&stream).unwrap(), frames);
    }

    #[test]
    fn test_envelope_round_trip_compressed() {
        let frames: Vec<MetricsFrame> = (0..64).map(sample_frame).collect();
        let stream = encode_stream(&frames, true).unwrap();
        assert_eq!(decode_stream(&stream).unwrap(), frames);
    }

    #[test]
    fn test_corrupted_envelope_rejected() {
        let frames: Vec<MetricsFrame> = (0..4).map(sample_frame).collect();
        let mut stream = encode_stream(&frames, true).unwrap();
        let last = stream.len() - 1;
        stream[last] ^= 0xFF;
        assert!(decode_stream(&stream).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_frame() -> impl Strategy<Value = MetricsFrame> {
            (
                any::<u64>(),
                0.0f32..=1.0,
                any::<u64>(),
                0.0f32..1000.0,
                (0.0f32..=1.0, 0.0f32..=1.0, 0.0f32..=1.0),
                any::<u32>(),
            )
                .prop_map(|(ts, gpu, mem, ft, (usability, engagement, frustration), count)| {
                    let mut frame = MetricsFrame {
                        timestamp: ts,
                        ..Default::default()
                    };
                    frame.set_performance(gpu, mem, ft, ft / 3.0, count);
                    frame.set_ux(usability, engagement, frustration, count, ts);
                    frame
                })
        }

        proptest! {
            #[test]
            fn prop_round_trip(frames in proptest::collection::vec(arb_frame(), 0..32)) {
                let bytes = serialize_frames(&frames);
                prop_assert_eq!(bytes.len(), frames.len() * FRAME_SIZE);
                prop_assert_eq!(deserialize_frames(&bytes).unwrap(), frames.clone());

                let compressed = encode_stream(&frames, true).unwrap();
                prop_assert_eq!(decode_stream(&compressed).unwrap(), frames);
            }
        }
    }
}
