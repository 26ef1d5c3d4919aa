//! Audio frame descriptor exchanged with the media runtime.
//!
//! The capture side delivers variable-length planar f32 frames; the track
//! processor re-blocks them to the denoiser's fixed frame size and emits
//! frames of the same shape with derived timestamps.

use serde::{Deserialize, Serialize};

/// Sample layout of a frame as delivered by the media runtime.
///
/// The pipeline only processes [`SampleFormat::F32Planar`]; anything else is
/// rejected at session level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 32-bit float, one plane per channel.
    F32Planar,
    /// 32-bit float, channels interleaved.
    F32Interleaved,
    /// 16-bit signed integer, one plane per channel.
    I16Planar,
}

/// One block of audio as exchanged with the media runtime.
///
/// `samples` holds plane 0 (the only plane for mono). Frames are immutable
/// inputs to the pipeline; the processor emits freshly-built frames rather
/// than mutating inbound ones.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub format: SampleFormat,
    pub sample_rate_hz: u32,
    pub channel_count: u16,
    /// Samples per channel.
    pub frame_count: usize,
    pub timestamp_us: u64,
    pub duration_us: u64,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Build a mono planar-f32 frame, deriving `frame_count` and
    /// `duration_us` from the sample buffer.
    pub fn mono(sample_rate_hz: u32, timestamp_us: u64, samples: Vec<f32>) -> Self {
        let frame_count = samples.len();
        Self {
            format: SampleFormat::F32Planar,
            sample_rate_hz,
            channel_count: 1,
            frame_count,
            timestamp_us,
            duration_us: duration_us(frame_count, sample_rate_hz),
            samples,
        }
    }

    /// Copy plane-0 samples into a caller-owned buffer.
    ///
    /// Copies `min(dst.len(), frame_count)` samples and returns the count.
    pub fn copy_plane_into(&self, dst: &mut [f32]) -> usize {
        let n = dst.len().min(self.samples.len());
        dst[..n].copy_from_slice(&self.samples[..n]);
        n
    }
}

/// Duration in microseconds of `frame_count` samples at `sample_rate_hz`.
pub fn duration_us(frame_count: usize, sample_rate_hz: u32) -> u64 {
    if sample_rate_hz == 0 {
        return 0;
    }
    frame_count as u64 * 1_000_000 / u64::from(sample_rate_hz)
}
