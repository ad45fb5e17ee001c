//! Audio pipeline: format conversion, rate conversion, echo cancellation
//! and paced playback.
//!
//! Everything operates on 20 ms frames of mono 16-bit PCM. A frame headed
//! to the provider is always at the provider rate; a frame headed to the
//! switch is always at the switch rate — the session enforces this by
//! construction (codec → resampler → AEC inbound, resampler → codec →
//! pacer outbound).

pub mod aec;
pub mod codec;
pub mod pacer;
pub mod resampler;

use serde::Serialize;

/// Which way a frame is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Caller → provider
    Inbound,
    /// Provider → caller
    Outbound,
}

/// Sample encoding on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Pcm16,
    Ulaw,
    Alaw,
}

/// One 20 ms frame. Transient — frames are never stored beyond the
/// pipeline stage that holds them.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub encoding: Encoding,
    pub direction: Direction,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn pcm(sample_rate: u32, direction: Direction, samples: Vec<i16>) -> Self {
        Self { sample_rate, encoding: Encoding::Pcm16, direction, samples }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

/// i16 PCM → f32 in [-1, 1].
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// f32 in [-1, 1] → i16 PCM with clamping.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Little-endian byte view of a PCM16 frame.
pub fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Little-endian bytes → PCM16. A trailing odd byte is dropped.
pub fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// RMS-based silence check.
pub fn is_silence(samples: &[i16], threshold: f32) -> bool {
    if samples.is_empty() {
        return true;
    }
    let rms = (samples.iter().map(|&s| (s as f32).powi(2)).sum::<f32>() / samples.len() as f32)
        .sqrt();
    rms < threshold
}
