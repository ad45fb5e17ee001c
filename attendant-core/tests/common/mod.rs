//! Shared test plumbing: an in-process mock speech provider, a scripted
//! switch adapter, and a capture server for the record sink.

use async_trait::async_trait;
use attendant_core::error::SwitchError;
use attendant_core::switch::SwitchControl;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Mock provider — a WebSocket server speaking the provider protocol
// ============================================================================

/// One accepted provider connection, exposed as message channels.
pub struct ProviderConn {
    pub incoming: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Value>,
    close: mpsc::UnboundedSender<()>,
}

impl ProviderConn {
    pub fn send(&self, event: Value) {
        let _ = self.outgoing.send(event);
    }

    /// Drop the socket mid-call (transport loss).
    pub fn kill(&self) {
        let _ = self.close.send(());
    }

    /// Wait for the next message of the given type, skipping others.
    pub async fn expect(&mut self, event_type: &str) -> Value {
        loop {
            let msg = tokio::time::timeout(WAIT, self.incoming.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
                .unwrap_or_else(|| panic!("connection closed waiting for {event_type}"));
            if msg["type"] == event_type {
                return msg;
            }
        }
    }

    /// True if a message of this type arrives within the window.
    pub async fn saw_within(&mut self, event_type: &str, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, self.incoming.recv()).await {
                Ok(Some(msg)) if msg["type"] == event_type => return true,
                Ok(Some(_)) => continue,
                _ => return false,
            }
        }
    }

    /// Standard session open: ack the configuration.
    pub async fn accept_session(&mut self) -> Value {
        let update = self.expect("session.update").await;
        self.send(json!({ "type": "session.created" }));
        update
    }

    /// Stream `frames` 20 ms audio deltas followed by done markers.
    pub fn stream_audio(&self, frames: usize) {
        use base64::Engine as _;
        // 480 samples of a quiet tone at 24 kHz.
        let samples: Vec<u8> = (0..480i16)
            .flat_map(|i| ((i % 64) * 100).to_le_bytes())
            .collect();
        let b64 = base64::engine::general_purpose::STANDARD.encode(&samples);
        for _ in 0..frames {
            self.send(json!({ "type": "response.audio.delta", "delta": b64 }));
        }
        self.send(json!({ "type": "response.audio.done" }));
        self.send(json!({ "type": "response.done" }));
    }

    /// A complete function call in one shot.
    pub fn call_tool(&self, call_id: &str, name: &str, arguments: Value) {
        self.send(json!({
            "type": "response.function_call_arguments.done",
            "call_id": call_id,
            "name": name,
            "arguments": arguments.to_string(),
        }));
    }
}

/// Accepts any number of provider connections; each lands on `conns`.
pub struct MockProvider {
    pub url: String,
    pub conns: mpsc::UnboundedReceiver<ProviderConn>,
    stop: mpsc::UnboundedSender<()>,
}

impl MockProvider {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock provider");
        let addr = listener.local_addr().unwrap();
        let (conn_tx, conns) = mpsc::unbounded_channel();
        let (stop, mut stop_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = stop_rx.recv() => break,
                };
                let Ok((stream, _)) = accepted else { break };
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { return };
                    let (mut ws_tx, mut ws_rx) = ws.split();
                    let (in_tx, in_rx) = mpsc::unbounded_channel();
                    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
                    let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();

                    let _ = conn_tx.send(ProviderConn {
                        incoming: in_rx,
                        outgoing: out_tx,
                        close: close_tx,
                    });

                    loop {
                        tokio::select! {
                            msg = ws_rx.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(value) = serde_json::from_str::<Value>(text.as_ref()) {
                                        if in_tx.send(value).is_err() {
                                            break;
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                _ => {}
                            },
                            out = out_rx.recv() => match out {
                                Some(value) => {
                                    let text = value.to_string();
                                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                            _ = close_rx.recv() => {
                                // Hard drop, no close frame — a transport fault.
                                break;
                            }
                        }
                    }
                });
            }
        });

        Self { url: format!("ws://{addr}"), conns, stop }
    }

    /// Stop accepting new connections (reconnects then get refused).
    pub fn stop_accepting(&self) {
        let _ = self.stop.send(());
    }

    pub async fn next_conn(&mut self) -> ProviderConn {
        tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("timed out waiting for provider connection")
            .expect("mock provider stopped")
    }
}

// ============================================================================
// Scripted switch
// ============================================================================

pub struct ScriptedSwitch {
    pub commands: Mutex<Vec<String>>,
    pub originate_uuid: Uuid,
}

impl ScriptedSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { commands: Mutex::new(Vec::new()), originate_uuid: Uuid::new_v4() })
    }

    fn log(&self, entry: String) {
        self.commands.lock().push(entry);
    }

    pub fn saw(&self, needle: &str) -> bool {
        self.commands.lock().iter().any(|c| c.contains(needle))
    }
}

#[async_trait]
impl SwitchControl for ScriptedSwitch {
    async fn originate_to_conference(
        &self,
        address: &str,
        conference: &str,
        _timeout_secs: u64,
        _caller_id_name: &str,
    ) -> Result<String, SwitchError> {
        self.log(format!("originate {address} -> {conference}"));
        Ok(self.originate_uuid.to_string())
    }

    async fn conference_enter(&self, uuid: &str, conference: &str, muted: bool, moderator: bool) -> Result<(), SwitchError> {
        self.log(format!("enter {uuid} {conference} muted={muted} moderator={moderator}"));
        Ok(())
    }

    async fn conference_kick(&self, conference: &str, member: &str) -> Result<(), SwitchError> {
        self.log(format!("kick {member} from {conference}"));
        Ok(())
    }

    async fn conference_mute(&self, conference: &str, member: &str) -> Result<(), SwitchError> {
        self.log(format!("mute {member} in {conference}"));
        Ok(())
    }

    async fn conference_unmute(&self, conference: &str, member: &str) -> Result<(), SwitchError> {
        self.log(format!("unmute {member} in {conference}"));
        Ok(())
    }

    async fn conference_list(&self, _conference: &str) -> Result<Vec<String>, SwitchError> {
        Ok(Vec::new())
    }

    async fn bridge(&self, a: &str, b: &str) -> Result<(), SwitchError> {
        self.log(format!("bridge {a} {b}"));
        Ok(())
    }

    async fn unbridge(&self, uuid: &str) -> Result<(), SwitchError> {
        self.log(format!("unbridge {uuid}"));
        Ok(())
    }

    async fn transfer(&self, uuid: &str, destination: &str) -> Result<(), SwitchError> {
        self.log(format!("transfer {uuid} {destination}"));
        Ok(())
    }

    async fn hold(&self, uuid: &str) -> Result<(), SwitchError> {
        self.log(format!("hold {uuid}"));
        Ok(())
    }

    async fn unhold(&self, uuid: &str) -> Result<(), SwitchError> {
        self.log(format!("unhold {uuid}"));
        Ok(())
    }

    async fn start_media_stream(&self, uuid: &str, url: &str) -> Result<(), SwitchError> {
        self.log(format!("start_media {uuid} {url}"));
        Ok(())
    }

    async fn stop_media_stream(&self, uuid: &str) -> Result<(), SwitchError> {
        self.log(format!("stop_media {uuid}"));
        Ok(())
    }

    async fn registration_query(&self, address: &str) -> Result<bool, SwitchError> {
        self.log(format!("regquery {address}"));
        Ok(true)
    }

    async fn execute_on_uuid(&self, uuid: &str, app: &str, arg: &str) -> Result<(), SwitchError> {
        self.log(format!("execute {uuid} {app} {arg}"));
        Ok(())
    }

    async fn hangup(&self, uuid: &str, cause: &str) -> Result<(), SwitchError> {
        self.log(format!("hangup {uuid} {cause}"));
        Ok(())
    }
}

// ============================================================================
// Record sink capture — a one-shot HTTP server collecting JSON POSTs
// ============================================================================

pub struct RecordCapture {
    pub url: String,
    pub bodies: mpsc::UnboundedReceiver<Value>,
}

impl RecordCapture {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind capture");
        let addr = listener.local_addr().unwrap();
        let (body_tx, bodies) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let body_tx = body_tx.clone();
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    // Read until the full Content-Length body has arrived.
                    loop {
                        let Ok(n) = stream.read(&mut chunk).await else { return };
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(body) = parse_http_body(&buf) {
                            if let Ok(value) = serde_json::from_slice::<Value>(body) {
                                let _ = body_tx.send(value);
                            }
                            let _ = stream
                                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                                .await;
                            return;
                        }
                    }
                });
            }
        });

        Self { url: format!("http://{addr}"), bodies }
    }

    pub async fn next_body(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.bodies.recv())
            .await
            .expect("timed out waiting for sink POST")
            .expect("capture stopped")
    }
}

/// Returns the complete body slice once headers + Content-Length bytes
/// are buffered.
fn parse_http_body(buf: &[u8]) -> Option<&[u8]> {
    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let headers = std::str::from_utf8(&buf[..header_end]).ok()?;
    let content_length: usize = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim().eq_ignore_ascii_case("content-length").then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);
    let body = &buf[header_end..];
    (body.len() >= content_length).then(|| &body[..content_length])
}
