//! Provider session driver.
//!
//! Owns the WebSocket to the speech model for one leg. The driver task
//! multiplexes outgoing client events and incoming server events,
//! accumulates function-call argument deltas, and surfaces everything the
//! session cares about as `ProviderUpdate`s on an unbounded channel.
//!
//! Reconnect policy: transport loss during normal conversation retries
//! with capped exponential backoff; during a transfer or after bridging
//! the session is torn down instead. A hard wall-clock cap closes the
//! session gracefully before the provider's own limit hits.

use crate::audio::{bytes_to_i16, i16_to_bytes};
use crate::bus::{short_id, EventBus, EventKind};
use crate::error::ProviderError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::protocol::{ClientEvent, ConversationItem, ContentPart, ResponseOptions, ServerEvent, SessionConfig};

/// Base reconnect backoff; doubles per attempt, capped.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Connection endpoint + lifetime policy.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub url: String,
    pub api_key: String,
    /// Hard wall-clock cap (provider limit minus safety margin).
    pub session_cap: Duration,
}

impl ProviderSettings {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
            // 60 min provider limit minus a 5 min safety margin.
            session_cap: Duration::from_secs(55 * 60),
        }
    }
}

/// Everything the driver reports back to its owner.
#[derive(Debug)]
pub enum ProviderUpdate {
    /// Session configured and ready for audio.
    Ready,
    /// Decoded PCM16 at the provider output rate.
    AudioDelta(Vec<i16>),
    /// Provider finished streaming audio for the current response.
    AudioDone,
    /// Provider-side VAD: the user started talking.
    SpeechStarted,
    SpeechStopped,
    /// Transcript of the user's last turn.
    UserTranscript(String),
    ResponseDone,
    /// A complete function call, arguments parsed.
    ToolCall { call_id: String, name: String, arguments: Value },
    /// Session over: cap reached, reconnects exhausted, or closed.
    Closed { reason: ProviderError },
}

/// Handle for sending into the session. Cheap to clone.
#[derive(Clone)]
pub struct ProviderHandle {
    cmd_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ProviderHandle {
    /// Append one frame of PCM16 at the provider input rate.
    pub fn append_audio(&self, samples: &[i16]) {
        let audio = BASE64.encode(i16_to_bytes(samples));
        let _ = self.cmd_tx.send(ClientEvent::InputAudioBufferAppend { audio });
    }

    /// Push-to-talk: close the user turn and ask for a response.
    pub fn commit_turn(&self) {
        let _ = self.cmd_tx.send(ClientEvent::InputAudioBufferCommit {});
        self.create_response(None);
    }

    pub fn create_response(&self, instructions: Option<String>) {
        let response = instructions.map(|instructions| ResponseOptions { instructions: Some(instructions) });
        let _ = self.cmd_tx.send(ClientEvent::ResponseCreate { response });
    }

    /// Barge-in.
    pub fn cancel_response(&self) {
        let _ = self.cmd_tx.send(ClientEvent::ResponseCancel {});
    }

    /// Feed a tool result back and let the model speak to it.
    pub fn send_tool_output(&self, call_id: &str, output: &Value) {
        let _ = self.cmd_tx.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.to_string(),
                output: output.to_string(),
            },
        });
        self.create_response(None);
    }

    /// Surface out-of-band user input (DTMF digits) as a user message.
    pub fn send_user_text(&self, text: &str) {
        let _ = self.cmd_tx.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "user".to_string(),
                content: vec![ContentPart::InputText { text: text.to_string() }],
            },
        });
    }

    pub fn update_session(&self, config: SessionConfig) {
        let _ = self.cmd_tx.send(ClientEvent::SessionUpdate { session: config });
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Spawn the driver for one provider session.
///
/// `allow_reconnect` is consulted on transport loss — the owning session
/// returns false while transferring or bridged.
pub fn spawn(
    settings: ProviderSettings,
    session_config: SessionConfig,
    bus: Arc<EventBus>,
    update_tx: mpsc::UnboundedSender<ProviderUpdate>,
    allow_reconnect: Arc<dyn Fn() -> bool + Send + Sync>,
) -> ProviderHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(drive(settings, session_config, bus, update_tx, cmd_rx, allow_reconnect));
    ProviderHandle { cmd_tx }
}

async fn drive(
    settings: ProviderSettings,
    session_config: SessionConfig,
    bus: Arc<EventBus>,
    update_tx: mpsc::UnboundedSender<ProviderUpdate>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientEvent>,
    allow_reconnect: Arc<dyn Fn() -> bool + Send + Sync>,
) {
    let call = short_id(&bus.call_id());
    let deadline = tokio::time::Instant::now() + settings.session_cap;
    let mut attempts = 0u32;
    let mut reconnects = 0u64;

    loop {
        let mut ws = match connect(&settings).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("call {call}: provider connect failed: {e}");
                if !retry_or_give_up(&mut attempts, &bus, &update_tx, &allow_reconnect, e).await {
                    return;
                }
                continue;
            }
        };
        attempts = 0;

        // First thing on every (re)connect: declare the session.
        if let Err(e) = send_event(&mut ws, &ClientEvent::SessionUpdate { session: session_config.clone() }).await {
            warn!("call {call}: session.update failed: {e}");
            if !retry_or_give_up(&mut attempts, &bus, &update_tx, &allow_reconnect, e).await {
                return;
            }
            continue;
        }
        if reconnects > 0 {
            bus.emit(
                EventKind::ConnectionHealthy,
                serde_json::json!({ "reconnects": reconnects }),
                "provider",
            );
        }

        // Partial function calls, keyed by provider call id.
        let mut partial_calls: HashMap<String, String> = HashMap::new();

        let exit = loop {
            tokio::select! {
                // Outgoing client events.
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(event) => {
                            if let Err(e) = send_event(&mut ws, &event).await {
                                break LoopExit::Transport(e);
                            }
                        }
                        None => {
                            // Owner dropped the handle: close gracefully.
                            let _ = ws.close(None).await;
                            break LoopExit::Finished(ProviderError::Closed);
                        }
                    }
                }

                // Incoming server events.
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_server_text(text.as_ref(), &bus, &update_tx, &mut partial_calls);
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Binary(_))) => {
                            debug!("call {call}: ignoring binary provider frame");
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break LoopExit::Transport(ProviderError::Transport(
                                format!("provider closed: {frame:?}"),
                            ));
                        }
                        Some(Err(e)) => {
                            break LoopExit::Transport(ProviderError::Transport(e.to_string()));
                        }
                        None => {
                            break LoopExit::Transport(ProviderError::Transport("stream ended".into()));
                        }
                    }
                }

                // Hard session cap.
                _ = tokio::time::sleep_until(deadline) => {
                    info!("call {call}: provider session cap reached, closing gracefully");
                    let _ = ws.close(None).await;
                    break LoopExit::Finished(ProviderError::SessionCapReached);
                }
            }
        };

        match exit {
            LoopExit::Finished(reason) => {
                let _ = update_tx.send(ProviderUpdate::Closed { reason });
                return;
            }
            LoopExit::Transport(e) => {
                warn!("call {call}: provider transport lost: {e}");
                bus.emit(
                    EventKind::WebsocketDisconnected,
                    serde_json::json!({ "error": e.to_string() }),
                    "provider",
                );
                reconnects += 1;
                if !retry_or_give_up(&mut attempts, &bus, &update_tx, &allow_reconnect, e).await {
                    return;
                }
            }
        }
    }
}

enum LoopExit {
    /// Clean end — no reconnect.
    Finished(ProviderError),
    /// Transport fault — reconnect policy applies.
    Transport(ProviderError),
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(settings: &ProviderSettings) -> Result<WsStream, ProviderError> {
    let mut request = settings
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ProviderError::Connect(e.to_string()))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", settings.api_key)
            .parse()
            .map_err(|_| ProviderError::Connect("bad api key header".into()))?,
    );

    let (ws, _response) = tokio::time::timeout(
        Duration::from_secs(10),
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| ProviderError::Connect("connect timeout".into()))?
    .map_err(|e| ProviderError::Connect(e.to_string()))?;
    Ok(ws)
}

async fn send_event(ws: &mut WsStream, event: &ClientEvent) -> Result<(), ProviderError> {
    let text = serde_json::to_string(event).map_err(|e| ProviderError::Protocol(e.to_string()))?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))
}

/// Backoff + retry bookkeeping. Returns false when the driver should
/// stop (reconnect not allowed or attempts exhausted), in which case the
/// terminal update has been sent.
async fn retry_or_give_up(
    attempts: &mut u32,
    bus: &Arc<EventBus>,
    update_tx: &mpsc::UnboundedSender<ProviderUpdate>,
    allow_reconnect: &Arc<dyn Fn() -> bool + Send + Sync>,
    error: ProviderError,
) -> bool {
    bus.emit(
        EventKind::ConnectionLost,
        serde_json::json!({ "error": error.to_string(), "attempt": *attempts }),
        "provider",
    );

    if !allow_reconnect() {
        info!("provider reconnect suppressed by call state — tearing down");
        let _ = update_tx.send(ProviderUpdate::Closed { reason: error });
        return false;
    }
    if *attempts >= MAX_RECONNECT_ATTEMPTS {
        error!("provider reconnect attempts exhausted");
        let _ = update_tx.send(ProviderUpdate::Closed { reason: error });
        return false;
    }

    let backoff = BACKOFF_BASE * 2u32.pow(*attempts);
    let backoff = backoff.min(BACKOFF_CAP);
    *attempts += 1;
    debug!("provider reconnect attempt {} after {:?}", attempts, backoff);
    tokio::time::sleep(backoff).await;
    true
}

/// Translate one server message into bus events + updates. Malformed
/// events are logged and dropped; the conversation continues.
fn handle_server_text(
    text: &str,
    bus: &Arc<EventBus>,
    update_tx: &mpsc::UnboundedSender<ProviderUpdate>,
    partial_calls: &mut HashMap<String, String>,
) {
    let event: ServerEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("dropping malformed provider event: {e}");
            return;
        }
    };

    match event {
        ServerEvent::SessionCreated {} | ServerEvent::SessionUpdated {} => {
            let _ = update_tx.send(ProviderUpdate::Ready);
        }
        ServerEvent::ResponseAudioDelta { delta } => match BASE64.decode(&delta) {
            Ok(bytes) => {
                bus.emit(
                    EventKind::AiAudioChunk,
                    serde_json::json!({ "bytes": bytes.len() }),
                    "provider",
                );
                let _ = update_tx.send(ProviderUpdate::AudioDelta(bytes_to_i16(&bytes)));
            }
            Err(e) => warn!("dropping undecodable audio delta: {e}"),
        },
        ServerEvent::ResponseAudioDone {} => {
            bus.emit(EventKind::AiAudioComplete, serde_json::json!({}), "provider");
            let _ = update_tx.send(ProviderUpdate::AudioDone);
        }
        ServerEvent::ResponseAudioTranscriptDelta { .. } => {
            // The AI's own transcript — not surfaced per-delta today.
        }
        ServerEvent::ResponseFunctionCallArgumentsDelta { call_id, delta } => {
            partial_calls.entry(call_id).or_default().push_str(&delta);
        }
        ServerEvent::ResponseFunctionCallArgumentsDone { call_id, name, arguments } => {
            let accumulated = partial_calls.remove(&call_id);
            let raw = if arguments.is_empty() {
                accumulated.unwrap_or_default()
            } else {
                arguments
            };
            let parsed: Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!("tool call {name}: unparsable arguments ({e}), passing empty map");
                    serde_json::json!({})
                }
            };
            let _ = update_tx.send(ProviderUpdate::ToolCall { call_id, name, arguments: parsed });
        }
        ServerEvent::ResponseCreated {} => {}
        ServerEvent::ResponseDone {} => {
            let _ = update_tx.send(ProviderUpdate::ResponseDone);
        }
        ServerEvent::SpeechStarted {} => {
            bus.emit(EventKind::UserSpeakingStarted, serde_json::json!({}), "provider");
            let _ = update_tx.send(ProviderUpdate::SpeechStarted);
        }
        ServerEvent::SpeechStopped {} => {
            bus.emit(EventKind::UserSpeakingDone, serde_json::json!({}), "provider");
            let _ = update_tx.send(ProviderUpdate::SpeechStopped);
        }
        ServerEvent::InputTranscriptionCompleted { transcript } => {
            bus.emit(
                EventKind::UserTranscript,
                serde_json::json!({ "text": transcript }),
                "provider",
            );
            let _ = update_tx.send(ProviderUpdate::UserTranscript(transcript));
        }
        ServerEvent::RateLimitsUpdated {} => {}
        ServerEvent::Error { error } => {
            // Configuration rejection is fatal; other errors are logged
            // and the conversation continues.
            let fatal = error
                .code
                .as_deref()
                .map(|c| c.contains("session") || c.contains("invalid_request"))
                .unwrap_or(false);
            if fatal {
                bus.emit(
                    EventKind::ConnectionDegraded,
                    serde_json::json!({ "error": error.message }),
                    "provider",
                );
                let _ = update_tx.send(ProviderUpdate::Closed {
                    reason: ProviderError::ConfigRejected(error.message),
                });
            } else {
                warn!("provider error (non-fatal): {}", error.message);
            }
        }
        ServerEvent::Unknown => {
            debug!("ignoring unknown provider event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn harness() -> (
        Arc<EventBus>,
        mpsc::UnboundedSender<ProviderUpdate>,
        mpsc::UnboundedReceiver<ProviderUpdate>,
        HashMap<String, String>,
    ) {
        let bus = Arc::new(EventBus::new(Uuid::new_v4()));
        let (tx, rx) = mpsc::unbounded_channel();
        (bus, tx, rx, HashMap::new())
    }

    #[tokio::test]
    async fn test_audio_delta_decoded_and_forwarded() {
        let (bus, tx, mut rx, mut partial) = harness();
        let pcm: Vec<i16> = vec![100, -200, 300];
        let b64 = BASE64.encode(i16_to_bytes(&pcm));
        let raw = format!(r#"{{"type":"response.audio.delta","delta":"{b64}"}}"#);

        handle_server_text(&raw, &bus, &tx, &mut partial);

        match rx.recv().await.unwrap() {
            ProviderUpdate::AudioDelta(samples) => assert_eq!(samples, pcm),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(bus.history(Some(EventKind::AiAudioChunk), 5).len(), 1);
    }

    #[tokio::test]
    async fn test_function_call_deltas_accumulate() {
        let (bus, tx, mut rx, mut partial) = harness();
        handle_server_text(
            r#"{"type":"response.function_call_arguments.delta","call_id":"c1","delta":"{\"dest"}"#,
            &bus,
            &tx,
            &mut partial,
        );
        handle_server_text(
            r#"{"type":"response.function_call_arguments.delta","call_id":"c1","delta":"ination\":\"Sales\"}"}"#,
            &bus,
            &tx,
            &mut partial,
        );
        // Done with empty arguments → accumulated deltas win.
        handle_server_text(
            r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"request_handoff","arguments":""}"#,
            &bus,
            &tx,
            &mut partial,
        );

        match rx.recv().await.unwrap() {
            ProviderUpdate::ToolCall { call_id, name, arguments } => {
                assert_eq!(call_id, "c1");
                assert_eq!(name, "request_handoff");
                assert_eq!(arguments["destination"], "Sales");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(partial.is_empty());
    }

    #[tokio::test]
    async fn test_speech_events_reach_bus() {
        let (bus, tx, mut rx, mut partial) = harness();
        handle_server_text(r#"{"type":"input_audio_buffer.speech_started"}"#, &bus, &tx, &mut partial);
        assert!(matches!(rx.recv().await.unwrap(), ProviderUpdate::SpeechStarted));
        assert_eq!(bus.history(Some(EventKind::UserSpeakingStarted), 5).len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_event_dropped_without_update() {
        let (bus, tx, mut rx, mut partial) = harness();
        handle_server_text(r#"{"type":"response.audio.delta"}"#, &bus, &tx, &mut partial);
        handle_server_text("not even json", &bus, &tx, &mut partial);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fatal_error_closes_with_config_rejected() {
        let (bus, tx, mut rx, mut partial) = harness();
        handle_server_text(
            r#"{"type":"error","error":{"code":"invalid_request_error","message":"bad voice"}}"#,
            &bus,
            &tx,
            &mut partial,
        );
        match rx.recv().await.unwrap() {
            ProviderUpdate::Closed { reason: ProviderError::ConfigRejected(msg) } => {
                assert!(msg.contains("bad voice"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(bus.history(Some(EventKind::ConnectionDegraded), 5).len(), 1);
    }

    #[test]
    fn test_settings_default_cap_under_provider_limit() {
        let settings = ProviderSettings::new("wss://example", "key");
        assert!(settings.session_cap < Duration::from_secs(60 * 60));
    }
}
