//! Structured per-call record.
//!
//! The logger accumulates events, metrics and tool invocations during the
//! call and flushes exactly once on completion. The sink POSTs the record
//! at-least-once with the call id as idempotency key, so retries are safe.

mod sink;

pub use sink::{RecordSink, Ticket};

use crate::bus::{EventBus, EventKind, VoiceEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// How the call concluded, as reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    Transferred,
    MessageTaken,
    NoAnswer,
    Error,
}

/// One model function call, timed.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub name: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub duration_ms: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub kind: String,
    /// Milliseconds since call start.
    pub ts: u64,
    pub data: serde_json::Value,
}

/// The JSON body POSTed to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub call_uuid: Uuid,
    pub tenant_id: String,
    pub secretary_id: String,
    pub caller_id: String,
    pub caller_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub final_state: String,
    pub outcome: CallOutcome,
    pub events: Vec<RecordedEvent>,
    pub metrics: std::collections::BTreeMap<String, i64>,
    pub tools: Vec<ToolInvocation>,
}

struct Inner {
    record: CallRecord,
    started: Instant,
}

/// Accumulates one `CallRecord` and guards its single flush.
pub struct CallLogger {
    inner: Mutex<Inner>,
    flushed: AtomicBool,
}

impl CallLogger {
    pub fn new(
        call_uuid: Uuid,
        tenant_id: &str,
        secretary_id: &str,
        caller_id: &str,
        caller_name: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                record: CallRecord {
                    call_uuid,
                    tenant_id: tenant_id.to_string(),
                    secretary_id: secretary_id.to_string(),
                    caller_id: caller_id.to_string(),
                    caller_name: caller_name.to_string(),
                    started_at: Utc::now(),
                    ended_at: None,
                    duration_ms: 0,
                    final_state: "idle".to_string(),
                    outcome: CallOutcome::Completed,
                    events: Vec::new(),
                    metrics: Default::default(),
                    tools: Vec::new(),
                },
                started: Instant::now(),
            }),
            flushed: AtomicBool::new(false),
        })
    }

    /// Mirror every bus event into the record. High-frequency audio
    /// chunk events are counted as a metric instead of recorded
    /// individually — the record stays bounded like the bus history.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        for kind in ALL_RECORDED_KINDS {
            let logger = self.clone();
            bus.subscribe(*kind, move |event| logger.on_event(event));
        }
    }

    fn on_event(&self, event: &VoiceEvent) {
        let mut inner = self.inner.lock();
        match event.kind {
            EventKind::AiAudioChunk | EventKind::UserAudioReceived => {
                let key = match event.kind {
                    EventKind::AiAudioChunk => "audio_chunks_out",
                    _ => "audio_chunks_in",
                };
                *inner.record.metrics.entry(key.to_string()).or_insert(0) += 1;
            }
            _ => {
                let ts = inner.started.elapsed().as_millis() as u64;
                if inner.record.events.len() >= crate::audio_constants::EVENT_HISTORY_LIMIT {
                    inner.record.events.remove(0);
                }
                inner.record.events.push(RecordedEvent {
                    kind: event.kind.as_str().to_string(),
                    ts,
                    data: event.data.clone(),
                });

                // Tool completions refine the outcome.
                if event.kind == EventKind::ToolCompleted {
                    match event.str_field("name") {
                        Some("take_message") => {
                            if inner.record.outcome == CallOutcome::Completed {
                                inner.record.outcome = CallOutcome::MessageTaken;
                            }
                        }
                        // A caller-accepted follow-up ticket counts as a
                        // handled transfer.
                        Some("create_ticket") => {
                            if inner.record.outcome == CallOutcome::Completed {
                                inner.record.outcome = CallOutcome::Transferred;
                            }
                        }
                        _ => {}
                    }
                }
                if event.kind == EventKind::TransferCompleted {
                    inner.record.outcome = CallOutcome::Transferred;
                }
            }
        }
    }

    pub fn add_tool(&self, invocation: ToolInvocation) {
        self.inner.lock().record.tools.push(invocation);
    }

    pub fn bump_metric(&self, key: &str, delta: i64) {
        *self.inner.lock().record.metrics.entry(key.to_string()).or_insert(0) += delta;
    }

    pub fn set_outcome(&self, outcome: CallOutcome) {
        self.inner.lock().record.outcome = outcome;
    }

    pub fn outcome(&self) -> CallOutcome {
        self.inner.lock().record.outcome
    }

    /// Stamp the end of the call. Idempotent; first call wins.
    pub fn mark_ended(&self, final_state: &str) {
        let mut inner = self.inner.lock();
        if inner.record.ended_at.is_none() {
            inner.record.ended_at = Some(Utc::now());
            inner.record.duration_ms = inner.started.elapsed().as_millis() as u64;
            inner.record.final_state = final_state.to_string();
        }
    }

    /// Take the record for flushing. Returns `None` on the second and
    /// later calls — the record is flushed exactly once.
    pub fn take_for_flush(&self) -> Option<CallRecord> {
        if self.flushed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let inner = self.inner.lock();
        info!(
            "call {}: record ready ({} events, {} tools, outcome {:?})",
            crate::bus::short_id(&inner.record.call_uuid),
            inner.record.events.len(),
            inner.record.tools.len(),
            inner.record.outcome
        );
        Some(inner.record.clone())
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }
}

/// Kinds mirrored into the call record. Everything except the two
/// per-frame audio kinds, which are aggregated as metrics.
const ALL_RECORDED_KINDS: &[EventKind] = &[
    EventKind::CallStarted,
    EventKind::CallConnected,
    EventKind::CallEnding,
    EventKind::CallEnded,
    EventKind::AiSpeakingStarted,
    EventKind::AiSpeakingDone,
    EventKind::AiAudioChunk,
    EventKind::AiAudioBufferLow,
    EventKind::AiAudioComplete,
    EventKind::UserSpeakingStarted,
    EventKind::UserSpeakingDone,
    EventKind::UserAudioReceived,
    EventKind::UserTranscript,
    EventKind::UserDtmf,
    EventKind::TransferRequested,
    EventKind::TransferValidated,
    EventKind::TransferDialing,
    EventKind::TransferRinging,
    EventKind::TransferAnswered,
    EventKind::TransferAnnouncing,
    EventKind::TransferAccepted,
    EventKind::TransferRejected,
    EventKind::TransferTimeout,
    EventKind::TransferCompleted,
    EventKind::TransferFailed,
    EventKind::TransferCancelled,
    EventKind::HoldStarted,
    EventKind::HoldEnded,
    EventKind::StateChanged,
    EventKind::StateTransitionBlocked,
    EventKind::ConnectionHealthy,
    EventKind::ConnectionDegraded,
    EventKind::ConnectionLost,
    EventKind::WebsocketDisconnected,
    EventKind::ProviderTimeout,
    EventKind::ToolStarted,
    EventKind::ToolCompleted,
    EventKind::ToolFailed,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn logger_on_bus() -> (Arc<EventBus>, Arc<CallLogger>) {
        let call_id = Uuid::new_v4();
        let bus = Arc::new(EventBus::new(call_id));
        let logger = CallLogger::new(call_id, "acme", "front-desk", "+15550001111", "Ana");
        logger.attach(&bus);
        (bus, logger)
    }

    #[test]
    fn test_events_mirrored_into_record() {
        let (bus, logger) = logger_on_bus();
        bus.emit(EventKind::CallStarted, serde_json::json!({}), "test");
        bus.emit(EventKind::UserTranscript, serde_json::json!({"text": "hi"}), "test");

        logger.mark_ended("ended");
        let record = logger.take_for_flush().unwrap();
        assert_eq!(record.events.len(), 2);
        assert_eq!(record.events[0].kind, "call.started");
        assert_eq!(record.events[1].data["text"], "hi");
    }

    #[test]
    fn test_audio_chunks_become_metrics_not_events() {
        let (bus, logger) = logger_on_bus();
        for _ in 0..50 {
            bus.emit(EventKind::AiAudioChunk, serde_json::json!({}), "test");
        }
        let record = logger.take_for_flush().unwrap();
        assert!(record.events.is_empty());
        assert_eq!(record.metrics["audio_chunks_out"], 50);
    }

    #[test]
    fn test_flush_exactly_once() {
        let (_bus, logger) = logger_on_bus();
        logger.mark_ended("ended");
        assert!(logger.take_for_flush().is_some());
        assert!(logger.take_for_flush().is_none());
        assert!(logger.is_flushed());
    }

    #[test]
    fn test_take_message_completion_sets_outcome() {
        let (bus, logger) = logger_on_bus();
        bus.emit(
            EventKind::ToolCompleted,
            serde_json::json!({"name": "take_message"}),
            "test",
        );
        assert_eq!(logger.outcome(), CallOutcome::MessageTaken);
    }

    #[test]
    fn test_transfer_completed_wins_over_message() {
        let (bus, logger) = logger_on_bus();
        bus.emit(EventKind::ToolCompleted, serde_json::json!({"name": "take_message"}), "test");
        bus.emit(EventKind::TransferCompleted, serde_json::json!({}), "test");
        assert_eq!(logger.outcome(), CallOutcome::Transferred);
    }

    #[test]
    fn test_mark_ended_idempotent() {
        let (_bus, logger) = logger_on_bus();
        logger.mark_ended("ended");
        let first = logger.inner.lock().record.ended_at;
        logger.mark_ended("error");
        let inner = logger.inner.lock();
        assert_eq!(inner.record.ended_at, first);
        assert_eq!(inner.record.final_state, "ended");
    }

    #[test]
    fn test_tool_invocations_recorded() {
        let (_bus, logger) = logger_on_bus();
        logger.add_tool(ToolInvocation {
            name: "get_business_info".into(),
            input: serde_json::json!({"field": "hours"}),
            output: serde_json::json!({"hours": "9-5"}),
            duration_ms: 3,
            success: true,
        });
        let record = logger.take_for_flush().unwrap();
        assert_eq!(record.tools.len(), 1);
        assert!(record.tools[0].success);
    }
}
