//! Per-call event bus.
//!
//! Typed publish/subscribe between the components of one session. The bus
//! is deliberately small: synchronous fan-out in registration order,
//! bounded history for diagnostics, and async `wait_for` built on oneshot
//! waiters. One bus per call — nothing here is process-global.

use crate::audio_constants::EVENT_HISTORY_LIMIT;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Closed set of event kinds flowing through a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CallStarted,
    CallConnected,
    CallEnding,
    CallEnded,
    AiSpeakingStarted,
    AiSpeakingDone,
    AiAudioChunk,
    AiAudioBufferLow,
    AiAudioComplete,
    UserSpeakingStarted,
    UserSpeakingDone,
    UserAudioReceived,
    UserTranscript,
    UserDtmf,
    TransferRequested,
    TransferValidated,
    TransferDialing,
    TransferRinging,
    TransferAnswered,
    TransferAnnouncing,
    TransferAccepted,
    TransferRejected,
    TransferTimeout,
    TransferCompleted,
    TransferFailed,
    TransferCancelled,
    HoldStarted,
    HoldEnded,
    StateChanged,
    StateTransitionBlocked,
    ConnectionHealthy,
    ConnectionDegraded,
    ConnectionLost,
    WebsocketDisconnected,
    ProviderTimeout,
    ToolStarted,
    ToolCompleted,
    ToolFailed,
}

impl EventKind {
    /// Dotted wire name, as recorded in call records and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallStarted => "call.started",
            Self::CallConnected => "call.connected",
            Self::CallEnding => "call.ending",
            Self::CallEnded => "call.ended",
            Self::AiSpeakingStarted => "ai.speaking.started",
            Self::AiSpeakingDone => "ai.speaking.done",
            Self::AiAudioChunk => "ai.audio.chunk",
            Self::AiAudioBufferLow => "ai.audio.buffer.low",
            Self::AiAudioComplete => "ai.audio.complete",
            Self::UserSpeakingStarted => "user.speaking.started",
            Self::UserSpeakingDone => "user.speaking.done",
            Self::UserAudioReceived => "user.audio.received",
            Self::UserTranscript => "user.transcript",
            Self::UserDtmf => "user.dtmf",
            Self::TransferRequested => "transfer.requested",
            Self::TransferValidated => "transfer.validated",
            Self::TransferDialing => "transfer.dialing",
            Self::TransferRinging => "transfer.ringing",
            Self::TransferAnswered => "transfer.answered",
            Self::TransferAnnouncing => "transfer.announcing",
            Self::TransferAccepted => "transfer.accepted",
            Self::TransferRejected => "transfer.rejected",
            Self::TransferTimeout => "transfer.timeout",
            Self::TransferCompleted => "transfer.completed",
            Self::TransferFailed => "transfer.failed",
            Self::TransferCancelled => "transfer.cancelled",
            Self::HoldStarted => "hold.started",
            Self::HoldEnded => "hold.ended",
            Self::StateChanged => "state.changed",
            Self::StateTransitionBlocked => "state.transition.blocked",
            Self::ConnectionHealthy => "connection.healthy",
            Self::ConnectionDegraded => "connection.degraded",
            Self::ConnectionLost => "connection.lost",
            Self::WebsocketDisconnected => "websocket.disconnected",
            Self::ProviderTimeout => "provider.timeout",
            Self::ToolStarted => "tool.started",
            Self::ToolCompleted => "tool.completed",
            Self::ToolFailed => "tool.failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event on the bus. Payload is a JSON object; the monotonic
/// timestamp is relative to process start and only compared, never shown.
#[derive(Debug, Clone)]
pub struct VoiceEvent {
    pub kind: EventKind,
    pub call_id: Uuid,
    pub data: serde_json::Value,
    pub at: Instant,
    pub source: &'static str,
}

impl VoiceEvent {
    pub fn new(kind: EventKind, call_id: Uuid, data: serde_json::Value, source: &'static str) -> Self {
        Self { kind, call_id, data, at: Instant::now(), source }
    }

    /// Event with an empty payload.
    pub fn bare(kind: EventKind, call_id: Uuid, source: &'static str) -> Self {
        Self::new(kind, call_id, serde_json::json!({}), source)
    }

    /// String field accessor for payload plumbing.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

type Handler = Arc<dyn Fn(&VoiceEvent) + Send + Sync + 'static>;

/// Opaque handle returned by subscribe, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// A synchronously-registered one-shot waiter (see `EventBus::watch_any`).
pub struct EventWatch {
    pub id: u64,
    pub rx: oneshot::Receiver<VoiceEvent>,
}

struct HandlerEntry {
    id: u64,
    kind: EventKind,
    handler: Handler,
    once: bool,
}

struct Waiter {
    id: u64,
    kinds: Vec<EventKind>,
    predicate: Option<Box<dyn Fn(&VoiceEvent) -> bool + Send + Sync>>,
    tx: oneshot::Sender<VoiceEvent>,
}

struct Inner {
    handlers: Vec<HandlerEntry>,
    waiters: Vec<Waiter>,
    history: VecDeque<VoiceEvent>,
    next_id: u64,
    /// True while a publish drain is running on some thread.
    publishing: bool,
    /// Events published re-entrantly from inside a handler.
    pending: VecDeque<VoiceEvent>,
}

/// Re-entrant publishes beyond this depth are dropped with a warning.
const MAX_REENTRY_DEPTH: usize = 8;

pub struct EventBus {
    call_id: Uuid,
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new(call_id: Uuid) -> Self {
        Self {
            call_id,
            inner: Mutex::new(Inner {
                handlers: Vec::new(),
                waiters: Vec::new(),
                history: VecDeque::with_capacity(EVENT_HISTORY_LIMIT),
                next_id: 1,
                publishing: false,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Convenience: build + publish in one call.
    pub fn emit(&self, kind: EventKind, data: serde_json::Value, source: &'static str) {
        self.publish(VoiceEvent::new(kind, self.call_id, data, source));
    }

    /// Deliver to every registered handler for `event.kind`, wake matching
    /// waiters, append to history. Non-blocking; a handler that panics is
    /// logged and skipped. Publication is serialized per bus: a publish
    /// from inside a handler is queued and drained after the current
    /// event's handlers finish.
    pub fn publish(&self, event: VoiceEvent) {
        {
            let mut inner = self.inner.lock();
            if inner.publishing {
                if inner.pending.len() >= MAX_REENTRY_DEPTH {
                    warn!(
                        "bus {}: re-entrant publish depth exceeded, dropping {}",
                        short_id(&self.call_id),
                        event.kind
                    );
                    return;
                }
                inner.pending.push_back(event);
                return;
            }
            inner.publishing = true;
            inner.pending.push_back(event);
        }

        loop {
            // Pull the next queued event and snapshot its handlers while
            // holding the lock, then invoke without the lock so handlers
            // can subscribe/unsubscribe/publish.
            let (event, handlers) = {
                let mut inner = self.inner.lock();
                let Some(event) = inner.pending.pop_front() else {
                    inner.publishing = false;
                    return;
                };

                if inner.history.len() >= EVENT_HISTORY_LIMIT {
                    inner.history.pop_front();
                }
                inner.history.push_back(event.clone());

                // Wake matching waiters (drain in place).
                let mut kept = Vec::with_capacity(inner.waiters.len());
                for waiter in inner.waiters.drain(..) {
                    let matches = waiter.kinds.contains(&event.kind)
                        && waiter.predicate.as_ref().map_or(true, |p| p(&event));
                    if matches {
                        let _ = waiter.tx.send(event.clone());
                    } else {
                        kept.push(waiter);
                    }
                }
                inner.waiters = kept;

                let handlers: Vec<(u64, Handler, bool)> = inner
                    .handlers
                    .iter()
                    .filter(|h| h.kind == event.kind)
                    .map(|h| (h.id, h.handler.clone(), h.once))
                    .collect();
                (event, handlers)
            };

            let mut spent_once: Vec<u64> = Vec::new();
            for (id, handler, once) in handlers {
                let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
                if result.is_err() {
                    warn!(
                        "bus {}: handler {} panicked on {} — skipped",
                        short_id(&self.call_id),
                        id,
                        event.kind
                    );
                }
                if once {
                    spent_once.push(id);
                }
            }
            if !spent_once.is_empty() {
                let mut inner = self.inner.lock();
                inner.handlers.retain(|h| !spent_once.contains(&h.id));
            }
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&VoiceEvent) + Send + Sync + 'static,
    {
        self.subscribe_inner(kind, Arc::new(handler), false)
    }

    /// Handler removed automatically after its first delivery.
    pub fn subscribe_once<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&VoiceEvent) + Send + Sync + 'static,
    {
        self.subscribe_inner(kind, Arc::new(handler), true)
    }

    fn subscribe_inner(&self, kind: EventKind, handler: Handler, once: bool) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.push(HandlerEntry { id, kind, handler, once });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock();
        inner.handlers.retain(|h| h.id != id.0);
    }

    /// Register a waiter synchronously and hand back its receiver. Use
    /// this when the matching event may be published before the caller
    /// next yields to the runtime — the registration happens here, not on
    /// first poll. Call `unwatch` if the watch is abandoned.
    pub fn watch_any(
        &self,
        kinds: &[EventKind],
        predicate: Option<Box<dyn Fn(&VoiceEvent) -> bool + Send + Sync>>,
    ) -> EventWatch {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.waiters.push(Waiter { id, kinds: kinds.to_vec(), predicate, tx });
        EventWatch { id, rx }
    }

    /// Drop an abandoned watch so the waiter list stays clean.
    pub fn unwatch(&self, watch_id: u64) {
        let mut inner = self.inner.lock();
        inner.waiters.retain(|w| w.id != watch_id);
    }

    /// Suspend until a matching event arrives or the timeout elapses.
    /// Returns `None` on timeout.
    pub async fn wait_for(
        &self,
        kind: EventKind,
        timeout: Duration,
        predicate: Option<Box<dyn Fn(&VoiceEvent) -> bool + Send + Sync>>,
    ) -> Option<VoiceEvent> {
        self.wait_for_any_inner(vec![kind], timeout, predicate).await
    }

    /// First event matching any of `kinds`, or `None` on timeout.
    pub async fn wait_for_any(&self, kinds: &[EventKind], timeout: Duration) -> Option<VoiceEvent> {
        self.wait_for_any_inner(kinds.to_vec(), timeout, None).await
    }

    async fn wait_for_any_inner(
        &self,
        kinds: Vec<EventKind>,
        timeout: Duration,
        predicate: Option<Box<dyn Fn(&VoiceEvent) -> bool + Send + Sync>>,
    ) -> Option<VoiceEvent> {
        let EventWatch { id, rx } = self.watch_any(&kinds, predicate);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Some(event),
            _ => {
                self.unwatch(id);
                debug!("bus {}: wait_for timed out", short_id(&self.call_id));
                None
            }
        }
    }

    /// Up to `limit` most-recent events, optionally filtered by kind.
    /// Diagnostics only.
    pub fn history(&self, kind: Option<EventKind>, limit: usize) -> Vec<VoiceEvent> {
        let inner = self.inner.lock();
        inner
            .history
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }
}

/// First 8 hex chars of a call id, for logs.
pub fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}
