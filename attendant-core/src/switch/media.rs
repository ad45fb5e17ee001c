//! Per-call media stream server.
//!
//! The switch opens one WebSocket per leg. The first message is a JSON
//! handshake naming the channel UUID, sample rate and encoding; after
//! that, switch→core frames are binary audio. Core→switch begins with a
//! one-time JSON preamble declaring the outbound sample rate, then 20 ms
//! binary frames released by the pacer.
//!
//! Routing is by channel UUID through the `MediaRouter`: sessions (and
//! transfer announcers) register endpoints, the server looks them up with
//! a bounded retry to tolerate the switch connecting a beat before the
//! session finishes wiring itself.

use crate::audio::codec::{decode_frame, encode_frame};
use crate::audio::Encoding;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lookup retries while a session is still registering.
const LOOKUP_RETRIES: u32 = 5;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Switch → core handshake (first text frame on the socket).
#[derive(Debug, Deserialize)]
pub struct MediaHandshake {
    pub channel_uuid: Uuid,
    #[serde(default = "default_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub encoding: MediaEncoding,
}

fn default_rate() -> u32 {
    crate::audio_constants::SWITCH_SAMPLE_RATE
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaEncoding {
    #[default]
    Pcm16,
    Ulaw,
    Alaw,
}

impl From<MediaEncoding> for Encoding {
    fn from(value: MediaEncoding) -> Self {
        match value {
            MediaEncoding::Pcm16 => Encoding::Pcm16,
            MediaEncoding::Ulaw => Encoding::Ulaw,
            MediaEncoding::Alaw => Encoding::Alaw,
        }
    }
}

/// Core → switch preamble (sent once before binary frames).
#[derive(Debug, Serialize)]
struct MediaPreamble {
    sample_rate: u32,
    encoding: MediaEncoding,
}

/// One leg's audio endpoints, registered by its owner.
pub struct MediaEndpoints {
    /// Decoded inbound PCM16 frames at the wire rate, toward the owner.
    pub ingress_tx: mpsc::Sender<Vec<i16>>,
    /// Outbound PCM16 frames from the owner (already at the wire rate);
    /// taken by the socket writer once.
    pub egress_rx: Mutex<Option<mpsc::Receiver<Vec<i16>>>>,
}

/// Channel-UUID → endpoints map shared by the media server and everyone
/// who owns a leg.
#[derive(Default)]
pub struct MediaRouter {
    routes: DashMap<Uuid, Arc<MediaEndpoints>>,
}

impl MediaRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        &self,
        channel_uuid: Uuid,
        ingress_tx: mpsc::Sender<Vec<i16>>,
        egress_rx: mpsc::Receiver<Vec<i16>>,
    ) {
        self.routes.insert(
            channel_uuid,
            Arc::new(MediaEndpoints { ingress_tx, egress_rx: Mutex::new(Some(egress_rx)) }),
        );
    }

    pub fn unregister(&self, channel_uuid: &Uuid) {
        self.routes.remove(channel_uuid);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Tolerates late registration: the switch often connects media a
    /// beat before the session has wired its endpoints.
    pub async fn lookup_with_retry(&self, channel_uuid: &Uuid) -> Option<Arc<MediaEndpoints>> {
        for attempt in 0..=LOOKUP_RETRIES {
            if let Some(endpoints) = self.routes.get(channel_uuid) {
                return Some(endpoints.clone());
            }
            if attempt < LOOKUP_RETRIES {
                tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            }
        }
        None
    }
}

/// Accept loop for the media port. One spawned task per connection.
pub struct MediaServer {
    router: Arc<MediaRouter>,
}

impl MediaServer {
    pub fn new(router: Arc<MediaRouter>) -> Self {
        Self { router }
    }

    pub async fn run(self, bind: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind).await?;
        info!("🔊 media server listening on {bind}");
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("media connection from {peer}");
            let router = self.router.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, router).await {
                    warn!("media connection from {peer} ended: {e}");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, router: Arc<MediaRouter>) -> Result<(), String> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("websocket accept: {e}"))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // First frame must be the handshake.
    let handshake: MediaHandshake = match ws_rx.next().await {
        Some(Ok(Message::Text(text))) => {
            serde_json::from_str(text.as_ref()).map_err(|e| format!("bad handshake: {e}"))?
        }
        other => return Err(format!("expected handshake text frame, got {other:?}")),
    };
    let encoding: Encoding = handshake.encoding.into();
    info!(
        "media stream for channel {} ({} Hz, {:?})",
        handshake.channel_uuid, handshake.sample_rate, handshake.encoding
    );

    let Some(endpoints) = router.lookup_with_retry(&handshake.channel_uuid).await else {
        return Err(format!("no media route for channel {}", handshake.channel_uuid));
    };
    let Some(mut egress_rx) = endpoints.egress_rx.lock().take() else {
        return Err("media endpoints already in use".to_string());
    };

    // Writer: one-time preamble, then paced binary frames.
    let writer = tokio::spawn(async move {
        let preamble = MediaPreamble {
            sample_rate: handshake.sample_rate,
            encoding: handshake.encoding,
        };
        let text = serde_json::to_string(&preamble).unwrap_or_default();
        if ws_tx.send(Message::Text(text.into())).await.is_err() {
            return;
        }
        while let Some(frame) = egress_rx.recv().await {
            let bytes = encode_frame(encoding, &frame);
            if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader: binary frames → decoded PCM to the owner.
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Binary(bytes)) => {
                let samples = decode_frame(encoding, &bytes);
                if endpoints.ingress_tx.send(samples).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_router_register_and_lookup() {
        let router = MediaRouter::new();
        let uuid = Uuid::new_v4();
        let (in_tx, _in_rx) = mpsc::channel(8);
        let (_out_tx, out_rx) = mpsc::channel::<Vec<i16>>(8);
        router.register(uuid, in_tx, out_rx);

        let endpoints = router.lookup_with_retry(&uuid).await.unwrap();
        assert!(endpoints.egress_rx.lock().is_some());

        router.unregister(&uuid);
        assert!(router.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_tolerates_late_registration() {
        let router = MediaRouter::new();
        let uuid = Uuid::new_v4();

        let late = router.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let (in_tx, _in_rx) = mpsc::channel(8);
            let (_out_tx, out_rx) = mpsc::channel::<Vec<i16>>(8);
            // _in_rx/_out_tx dropped, but registration itself is the point.
            late.register(uuid, in_tx, out_rx);
        });

        assert!(router.lookup_with_retry(&uuid).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_gives_up_eventually() {
        let router = MediaRouter::new();
        assert!(router.lookup_with_retry(&Uuid::new_v4()).await.is_none());
    }

    #[test]
    fn test_handshake_parses_with_defaults() {
        let raw = r#"{"channel_uuid":"f81d4fae-7dec-11d0-a765-00a0c91e6bf6"}"#;
        let hs: MediaHandshake = serde_json::from_str(raw).unwrap();
        assert_eq!(hs.sample_rate, 8000);
        assert_eq!(hs.encoding, MediaEncoding::Pcm16);

        let raw = r#"{"channel_uuid":"f81d4fae-7dec-11d0-a765-00a0c91e6bf6","sample_rate":16000,"encoding":"ulaw"}"#;
        let hs: MediaHandshake = serde_json::from_str(raw).unwrap();
        assert_eq!(hs.sample_rate, 16000);
        assert_eq!(hs.encoding, MediaEncoding::Ulaw);
    }
}
