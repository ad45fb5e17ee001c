//! Acoustic echo cancellation.
//!
//! NLMS adaptive filter over linear PCM at the switch rate. Outbound TTS
//! frames are pushed into a delay line sized for the measured round-trip
//! echo; when a mic frame arrives the canceller consumes the head-of-line
//! delayed reference and subtracts its filtered estimate. Fails open: a
//! mic frame with no reference available passes through untouched.

use crate::audio_constants::DEFAULT_ECHO_TAIL_MS;
use std::collections::VecDeque;

/// Adaptive filter length (samples at 8 kHz = 16 ms of echo tail).
const FILTER_TAPS: usize = 128;

/// NLMS step size. Larger adapts faster but risks instability.
const NLMS_MU: f32 = 0.5;

/// Regularization to keep the normalized update finite on silence.
const NLMS_EPS: f32 = 1e-6;

/// Cap on buffered reference audio, to bound memory if playback stalls.
const MAX_REFERENCE_FRAMES: usize = 512;

pub struct EchoCanceller {
    /// FIR filter weights, adapted per sample.
    weights: Vec<f32>,
    /// Most recent reference samples (x), newest last.
    reference_window: VecDeque<f32>,
    /// Reference frames waiting to be consumed, aligned with mic frames.
    pending_reference: VecDeque<Vec<f32>>,
    /// Frames of artificial delay before a pushed reference is consumed,
    /// covering the playback round trip plus resampler group delay.
    delay_frames: usize,
    /// Reference frames pushed so far and not yet aged past the delay.
    warmup_remaining: usize,
}

impl EchoCanceller {
    /// `extra_delay_ms` accounts for fixed upstream latency (resampler
    /// group delay); it is added to the configured echo tail.
    pub fn new(echo_tail_ms: Option<u64>, extra_delay_ms: u64) -> Self {
        let tail_ms = echo_tail_ms.unwrap_or(DEFAULT_ECHO_TAIL_MS) + extra_delay_ms;
        let delay_frames = (tail_ms / 20).max(1) as usize;
        Self {
            weights: vec![0.0; FILTER_TAPS],
            reference_window: VecDeque::from(vec![0.0; FILTER_TAPS]),
            pending_reference: VecDeque::new(),
            delay_frames,
            warmup_remaining: delay_frames,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(None, 0)
    }

    /// Queue one outbound 20 ms frame as future echo reference.
    pub fn push_reference(&mut self, frame: &[i16]) {
        if self.pending_reference.len() >= MAX_REFERENCE_FRAMES {
            self.pending_reference.pop_front();
        }
        self.pending_reference
            .push_back(frame.iter().map(|&s| s as f32 / 32768.0).collect());
    }

    /// Playback stopped (barge-in drain): future mic frames have no echo.
    pub fn clear_reference(&mut self) {
        self.pending_reference.clear();
        self.warmup_remaining = self.delay_frames;
    }

    /// Cancel echo from one inbound mic frame. Consumes at most one
    /// queued reference frame.
    pub fn cancel(&mut self, mic: &[i16]) -> Vec<i16> {
        // The delay line models the playback round trip: the reference
        // pushed N frames ago is the one audible in this mic frame.
        if self.warmup_remaining > 0 && !self.pending_reference.is_empty() {
            self.warmup_remaining -= 1;
            return mic.to_vec();
        }
        let Some(reference) = self.pending_reference.pop_front() else {
            // Fail open — no reference, nothing to cancel.
            return mic.to_vec();
        };

        let mut out = Vec::with_capacity(mic.len());
        for (i, &mic_sample) in mic.iter().enumerate() {
            let x = reference.get(i).copied().unwrap_or(0.0);
            self.reference_window.pop_front();
            self.reference_window.push_back(x);

            // y = w · x_window
            let mut estimate = 0.0f32;
            let mut energy = NLMS_EPS;
            for (w, &xs) in self.weights.iter().zip(self.reference_window.iter()) {
                estimate += w * xs;
                energy += xs * xs;
            }

            let d = mic_sample as f32 / 32768.0;
            let error = d - estimate;

            // NLMS weight update, normalized by reference energy.
            let step = NLMS_MU * error / energy;
            for (w, &xs) in self.weights.iter_mut().zip(self.reference_window.iter()) {
                *w += step * xs;
            }

            out.push((error.clamp(-1.0, 1.0) * 32767.0) as i16);
        }
        out
    }

    /// Frames of reference currently queued (diagnostics).
    pub fn reference_depth(&self) -> usize {
        self.pending_reference.len()
    }
}

impl Default for EchoCanceller {
    fn default() -> Self {
        Self::with_defaults()
    }
}
