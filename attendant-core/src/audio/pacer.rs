//! Playback pacer.
//!
//! Owns the per-call outbound frame queue and releases exactly one 20 ms
//! frame per wall-clock tick to the switch, regardless of how fast the
//! provider streams audio in. A warmup of buffered audio is required
//! before the first release so a network hiccup doesn't immediately
//! starve playback. On barge-in the queue is drained within one frame.

use crate::audio_constants::{FRAME_DURATION_MS, PACER_LOW_WATER_FRAMES, PACER_WARMUP_MS};
use crate::bus::{short_id, EventBus, EventKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Frames of buffered audio required before playback starts.
const WARMUP_FRAMES: usize = (PACER_WARMUP_MS / FRAME_DURATION_MS) as usize;

/// Queue depth at which the low-water latch re-arms.
const LOW_WATER_REARM: usize = PACER_LOW_WATER_FRAMES * 2;

struct Shared {
    queue: Mutex<VecDeque<Vec<i16>>>,
    bus: Arc<EventBus>,
    /// Frames released to the switch writer.
    sink: mpsc::Sender<Vec<i16>>,
    /// Currently releasing frames (the AI is audibly speaking).
    speaking: AtomicBool,
    /// Provider finished streaming the current response.
    complete: AtomicBool,
    /// Edge-trigger latch for ai.audio.buffer.low.
    low_signalled: AtomicBool,
    frames_released: AtomicU64,
}

pub struct PlaybackPacer {
    shared: Arc<Shared>,
    task: tokio::task::JoinHandle<()>,
}

impl PlaybackPacer {
    /// Spawns the 20 ms release loop immediately. Released frames go to
    /// `sink` (the media-stream writer).
    pub fn new(bus: Arc<EventBus>, sink: mpsc::Sender<Vec<i16>>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            bus,
            sink,
            speaking: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            low_signalled: AtomicBool::new(false),
            frames_released: AtomicU64::new(0),
        });

        let loop_shared = shared.clone();
        let task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(FRAME_DURATION_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
            loop {
                interval.tick().await;
                if !Self::tick(&loop_shared).await {
                    break;
                }
            }
        });

        Self { shared, task }
    }

    /// One release step. Returns false when the sink is gone (call over).
    async fn tick(shared: &Arc<Shared>) -> bool {
        let speaking = shared.speaking.load(Ordering::SeqCst);
        let complete = shared.complete.load(Ordering::SeqCst);

        let frame = {
            let mut queue = shared.queue.lock();
            let depth = queue.len();

            if !speaking {
                // Warmup: hold until enough audio is buffered, or the
                // response already ended (short utterances never reach
                // the warmup threshold).
                if depth >= WARMUP_FRAMES || (complete && depth > 0) {
                    shared.speaking.store(true, Ordering::SeqCst);
                } else {
                    return true;
                }
            }
            queue.pop_front()
        };

        match frame {
            Some(frame) => {
                shared.frames_released.fetch_add(1, Ordering::Relaxed);
                if shared.sink.send(frame).await.is_err() {
                    debug!("pacer {}: sink closed", short_id(&shared.bus.call_id()));
                    return false;
                }

                let depth = shared.queue.lock().len();
                if depth < PACER_LOW_WATER_FRAMES && !complete {
                    if !shared.low_signalled.swap(true, Ordering::SeqCst) {
                        shared.bus.emit(
                            EventKind::AiAudioBufferLow,
                            serde_json::json!({ "depth": depth }),
                            "pacer",
                        );
                    }
                } else if depth >= LOW_WATER_REARM {
                    shared.low_signalled.store(false, Ordering::SeqCst);
                }
            }
            None => {
                if complete {
                    // Played everything the provider sent.
                    Self::finish(shared);
                }
                // Not complete: underrun — keep ticking and let the
                // low-water event (already fired) drive diagnostics.
            }
        }
        true
    }

    fn finish(shared: &Arc<Shared>) {
        if shared.speaking.swap(false, Ordering::SeqCst) {
            shared.complete.store(false, Ordering::SeqCst);
            shared.low_signalled.store(false, Ordering::SeqCst);
            shared.bus.emit(EventKind::AiSpeakingDone, serde_json::json!({}), "pacer");
        }
    }

    /// Enqueue one 20 ms frame at the switch rate.
    pub fn push_frame(&self, frame: Vec<i16>) {
        self.shared.complete.store(false, Ordering::SeqCst);
        self.shared.queue.lock().push_back(frame);
    }

    /// Provider finished streaming the current response; the queue will
    /// drain naturally and `ai.speaking.done` fires when it empties.
    pub fn mark_complete(&self) {
        self.shared.complete.store(true, Ordering::SeqCst);
    }

    /// Barge-in: empty the queue now and signal the end of AI speech
    /// immediately.
    pub fn drain(&self) {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        info!(
            "pacer {}: barge-in drained {} queued frames",
            short_id(&self.shared.bus.call_id()),
            dropped
        );
        self.shared.complete.store(false, Ordering::SeqCst);
        self.shared.low_signalled.store(false, Ordering::SeqCst);
        if self.shared.speaking.swap(false, Ordering::SeqCst) {
            self.shared
                .bus
                .emit(EventKind::AiSpeakingDone, serde_json::json!({ "barge_in": true }), "pacer");
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.speaking.load(Ordering::SeqCst)
    }

    pub fn frames_released(&self) -> u64 {
        self.shared.frames_released.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for PlaybackPacer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn setup() -> (Arc<EventBus>, PlaybackPacer, mpsc::Receiver<Vec<i16>>) {
        let bus = Arc::new(EventBus::new(Uuid::new_v4()));
        let (tx, rx) = mpsc::channel(64);
        let pacer = PlaybackPacer::new(bus.clone(), tx);
        (bus, pacer, rx)
    }

    fn frame() -> Vec<i16> {
        vec![1000i16; 160]
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_holds_until_threshold() {
        let (_bus, pacer, mut rx) = setup();

        // Below warmup: nothing released even after plenty of ticks.
        for _ in 0..(WARMUP_FRAMES - 1) {
            pacer.push_frame(frame());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        // Crossing the threshold starts release.
        pacer.push_frame(frame());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pacer.frames_released() > 0);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_response_plays_after_complete() {
        let (bus, pacer, mut rx) = setup();

        // Two frames (40 ms) — under warmup, but complete.
        pacer.push_frame(frame());
        pacer.push_frame(frame());
        pacer.mark_complete();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pacer.frames_released(), 2);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());

        // Queue drained after completion → ai.speaking.done.
        let done = bus.history(Some(EventKind::AiSpeakingDone), 10);
        assert_eq!(done.len(), 1);
        assert!(!pacer.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_cadence_is_20ms() {
        let (_bus, pacer, mut rx) = setup();
        for _ in 0..WARMUP_FRAMES + 10 {
            pacer.push_frame(frame());
        }

        // First release, then measure inter-release spacing.
        let _ = rx.recv().await.unwrap();
        let mut last = tokio::time::Instant::now();
        for _ in 0..5 {
            let _ = rx.recv().await.unwrap();
            let now = tokio::time::Instant::now();
            let gap = now.duration_since(last);
            assert_eq!(gap.as_millis(), FRAME_DURATION_MS as u128);
            last = now;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_low_emitted_once_while_speaking() {
        let (bus, pacer, mut rx) = setup();
        for _ in 0..WARMUP_FRAMES {
            pacer.push_frame(frame());
        }
        // Drain everything without refilling → queue drops below 2 while
        // the provider hasn't completed.
        for _ in 0..WARMUP_FRAMES {
            let _ = rx.recv().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let lows = bus.history(Some(EventKind::AiAudioBufferLow), 10);
        assert_eq!(lows.len(), 1, "buffer.low should be edge-triggered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_drains_immediately() {
        let (bus, pacer, mut rx) = setup();
        for _ in 0..WARMUP_FRAMES + 8 {
            pacer.push_frame(frame());
        }
        // Let playback start.
        let _ = rx.recv().await.unwrap();
        assert!(pacer.is_speaking());

        pacer.drain();
        assert_eq!(pacer.queue_depth(), 0);
        assert!(!pacer.is_speaking());

        let done = bus.history(Some(EventKind::AiSpeakingDone), 10);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data.get("barge_in").and_then(|v| v.as_bool()), Some(true));
    }
}
