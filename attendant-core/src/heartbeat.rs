//! Heartbeat & timeout manager.
//!
//! Runs beside the session, stamping activity times for inbound audio,
//! outbound audio and provider responses, and raising degradation events
//! when a threshold passes with no activity. Checks are suppressed while
//! transferring or bridged — the A-leg is parked in the conference then
//! and silence is expected. Events are edge-triggered: one per silence
//! episode, re-armed when activity resumes.

use crate::bus::{EventBus, EventKind};
use crate::state::StateMachine;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Inbound audio silence before `connection.degraded` (while active).
    pub audio_silence_threshold: Duration,
    /// Provider inactivity before `provider.timeout` (while a response is
    /// expected).
    pub provider_timeout_threshold: Duration,
    pub tick: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            audio_silence_threshold: Duration::from_secs(10),
            provider_timeout_threshold: Duration::from_secs(30),
            tick: Duration::from_secs(1),
        }
    }
}

struct Stamps {
    inbound_audio: Mutex<Instant>,
    outbound_audio: Mutex<Instant>,
    provider: Mutex<Instant>,
    expecting_response: AtomicBool,
    audio_latched: AtomicBool,
    provider_latched: AtomicBool,
}

pub struct Heartbeat {
    stamps: Arc<Stamps>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(bus: Arc<EventBus>, machine: Arc<StateMachine>, config: HeartbeatConfig) -> Self {
        let now = Instant::now();
        let stamps = Arc::new(Stamps {
            inbound_audio: Mutex::new(now),
            outbound_audio: Mutex::new(now),
            provider: Mutex::new(now),
            expecting_response: AtomicBool::new(false),
            audio_latched: AtomicBool::new(false),
            provider_latched: AtomicBool::new(false),
        });

        let tick_stamps = stamps.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let state = machine.state();
                if state.is_terminal() {
                    break;
                }
                // Paused during transfer and after bridging — silence is
                // the expected shape of those states.
                if state.is_transferring() || state == crate::state::CallState::Bridged {
                    continue;
                }

                if state.is_active() {
                    let silent_for = tick_stamps.inbound_audio.lock().elapsed();
                    if silent_for >= config.audio_silence_threshold {
                        if !tick_stamps.audio_latched.swap(true, Ordering::SeqCst) {
                            bus.emit(
                                EventKind::ConnectionDegraded,
                                serde_json::json!({
                                    "reason": "audio_silence",
                                    "silent_ms": silent_for.as_millis() as u64,
                                }),
                                "heartbeat",
                            );
                        }
                    }
                }

                if tick_stamps.expecting_response.load(Ordering::SeqCst) {
                    let waiting_for = tick_stamps.provider.lock().elapsed();
                    if waiting_for >= config.provider_timeout_threshold
                        && !tick_stamps.provider_latched.swap(true, Ordering::SeqCst)
                    {
                        bus.emit(
                            EventKind::ProviderTimeout,
                            serde_json::json!({
                                "waiting_ms": waiting_for.as_millis() as u64,
                            }),
                            "heartbeat",
                        );
                    }
                }
            }
            debug!("heartbeat stopped");
        });

        Self { stamps, task }
    }

    pub fn touch_inbound_audio(&self) {
        *self.stamps.inbound_audio.lock() = Instant::now();
        self.stamps.audio_latched.store(false, Ordering::SeqCst);
    }

    pub fn touch_outbound_audio(&self) {
        *self.stamps.outbound_audio.lock() = Instant::now();
    }

    pub fn touch_provider(&self) {
        *self.stamps.provider.lock() = Instant::now();
        self.stamps.provider_latched.store(false, Ordering::SeqCst);
    }

    /// While true, provider silence counts toward `provider.timeout`.
    pub fn set_expecting_response(&self, expecting: bool) {
        self.stamps.expecting_response.store(expecting, Ordering::SeqCst);
        if expecting {
            *self.stamps.provider.lock() = Instant::now();
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Cancellable timeout scopes
// ============================================================================

/// A deadline that fires a callback unless cancelled first. A state
/// transition that invalidates an operation cancels its scope; a
/// cancelled scope never fires.
pub struct TimeoutScope {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimeoutScope {
    pub fn spawn<F>(duration: Duration, on_expiry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if !flag.load(Ordering::SeqCst) {
                on_expiry();
            }
        });
        Self { cancelled, task }
    }

    /// Convenience: publish an event on expiry.
    pub fn emit_on_expiry(
        bus: Arc<EventBus>,
        kind: EventKind,
        data: serde_json::Value,
        duration: Duration,
    ) -> Self {
        Self::spawn(duration, move || bus.emit(kind, data, "timeout"))
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for TimeoutScope {
    fn drop(&mut self) {
        self.cancel();
    }
}
