//! Switch event normalization.
//!
//! Raw `text/event-json` messages become typed `VoiceEvent`s keyed by
//! channel UUID. Components subscribe to the bus; nobody outside this
//! module reads switch event names.

use crate::bus::{EventKind, VoiceEvent};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// A normalized switch event plus the channel it belongs to, ready for
/// session routing.
#[derive(Debug, Clone)]
pub struct SwitchEvent {
    pub channel_uuid: Uuid,
    pub kind: EventKind,
    pub data: Value,
}

/// Map one raw switch event body into a `SwitchEvent`. Events we don't
/// care about (heartbeats, codec negotiation, …) return `None`.
pub fn normalize(body: &str) -> Option<SwitchEvent> {
    let json: Value = serde_json::from_str(body).ok()?;
    let name = json.get("Event-Name")?.as_str()?;
    let uuid_str = json
        .get("Unique-ID")
        .or_else(|| json.get("Channel-Call-UUID"))?
        .as_str()?;
    let channel_uuid = Uuid::parse_str(uuid_str).ok()?;

    let (kind, data) = match name {
        "CHANNEL_ANSWER" => (EventKind::CallConnected, serde_json::json!({})),
        "CHANNEL_HANGUP" | "CHANNEL_HANGUP_COMPLETE" => (
            EventKind::CallEnded,
            serde_json::json!({
                "cause": json.get("Hangup-Cause").and_then(|v| v.as_str()).unwrap_or("NONE"),
                "external": true,
            }),
        ),
        "CHANNEL_PROGRESS" | "CHANNEL_PROGRESS_MEDIA" => {
            (EventKind::TransferRinging, serde_json::json!({}))
        }
        "CHANNEL_BRIDGE" => (
            EventKind::TransferCompleted,
            serde_json::json!({
                "other_leg": json.get("Other-Leg-Unique-ID").and_then(|v| v.as_str()),
            }),
        ),
        "CHANNEL_UNBRIDGE" => (EventKind::HoldEnded, serde_json::json!({})),
        "CHANNEL_HOLD" => (EventKind::HoldStarted, serde_json::json!({})),
        "CHANNEL_UNHOLD" => (EventKind::HoldEnded, serde_json::json!({})),
        "DTMF" => {
            let digit = json.get("DTMF-Digit").and_then(|v| v.as_str()).unwrap_or("");
            (EventKind::UserDtmf, serde_json::json!({ "digit": digit }))
        }
        other => {
            debug!("ignoring switch event {other}");
            return None;
        }
    };

    Some(SwitchEvent { channel_uuid, kind, data })
}

impl SwitchEvent {
    /// Lift into a bus event for the owning call.
    pub fn into_voice_event(self, call_id: Uuid) -> VoiceEvent {
        VoiceEvent::new(self.kind, call_id, self.data, "switch")
    }
}
