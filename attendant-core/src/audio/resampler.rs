//! Sample-rate conversion between the switch and provider rates.
//!
//! Wraps a rubato `SincFixedIn` (polyphase windowed-sinc) driven in exact
//! 20 ms input chunks. Output samples are accumulated and re-framed so
//! that every 20 ms in produces exactly one 20 ms frame out once the
//! filter's transient has passed — the session relies on this 1:1 frame
//! cadence. The filter group delay is deterministic and exposed via
//! `output_delay_ms()` so the echo canceller can compensate.

use crate::error::AudioError;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use super::{f32_to_i16, i16_to_f32};

pub struct FrameResampler {
    /// `None` when input rate == output rate (passthrough).
    inner: Option<SincFixedIn<f32>>,
    in_rate: u32,
    out_rate: u32,
    /// Input samples per 20 ms.
    in_frame: usize,
    /// Output samples per 20 ms.
    out_frame: usize,
    /// Carries partial input between calls (callers may push odd sizes).
    input_buf: Vec<f32>,
    /// Resampled output awaiting re-framing.
    output_buf: Vec<f32>,
}

impl FrameResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self, AudioError> {
        let in_frame = (in_rate as usize / 1000) * 20;
        let out_frame = (out_rate as usize / 1000) * 20;

        let inner = if in_rate == out_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(
                out_rate as f64 / in_rate as f64,
                1.0, // fixed ratio
                params,
                in_frame,
                1, // mono
            )
            .map_err(|e| AudioError::ResamplerInit(e.to_string()))?;
            Some(resampler)
        };

        Ok(Self {
            inner,
            in_rate,
            out_rate,
            in_frame,
            out_frame,
            input_buf: Vec::new(),
            output_buf: Vec::new(),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Filter group delay at the output rate, in milliseconds.
    pub fn output_delay_ms(&self) -> u64 {
        match &self.inner {
            Some(r) => (r.output_delay() as u64 * 1000) / self.out_rate as u64,
            None => 0,
        }
    }

    /// Push samples at the input rate; returns zero or more complete
    /// 20 ms frames at the output rate. The first call absorbs the filter
    /// transient, so expect up to one frame of startup latency.
    pub fn process(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        let Some(ref mut resampler) = self.inner else {
            // Passthrough still re-frames to exact 20 ms chunks.
            self.output_buf.extend(i16_to_f32(samples));
            return self.drain_frames();
        };

        self.input_buf.extend(i16_to_f32(samples));

        while self.input_buf.len() >= self.in_frame {
            let chunk: Vec<f32> = self.input_buf.drain(..self.in_frame).collect();
            match resampler.process(&[chunk], None) {
                Ok(mut out) => {
                    self.output_buf.append(&mut out[0]);
                }
                Err(e) => {
                    tracing::error!("resampler process error: {e}");
                }
            }
        }
        self.drain_frames()
    }

    fn drain_frames(&mut self) -> Vec<Vec<i16>> {
        let mut frames = Vec::new();
        while self.output_buf.len() >= self.out_frame {
            let frame: Vec<f32> = self.output_buf.drain(..self.out_frame).collect();
            frames.push(f32_to_i16(&frame));
        }
        frames
    }

    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }
}
