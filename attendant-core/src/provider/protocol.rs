//! Realtime provider wire protocol.
//!
//! JSON messages over a persistent WebSocket, tagged by `type`. The
//! client side is what we send; the server side is what the provider
//! streams back. Unknown server event types deserialize to `Unknown` and
//! are dropped — a protocol addition on the provider side must never
//! break a live call.

use crate::config::VadConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Session configuration
// ============================================================================

/// Turn-detection config as the provider expects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
    SemanticVad {
        eagerness: String,
    },
}

impl TurnDetection {
    /// `None` = VAD disabled (push-to-talk): user turns are delimited by
    /// explicit commit + response.create.
    pub fn from_vad(vad: &VadConfig) -> Option<Self> {
        match vad {
            VadConfig::ServerVad { threshold, prefix_padding_ms, silence_duration_ms } => {
                Some(Self::ServerVad {
                    threshold: *threshold,
                    prefix_padding_ms: *prefix_padding_ms,
                    silence_duration_ms: *silence_duration_ms,
                })
            }
            VadConfig::SemanticVad { eagerness } => {
                Some(Self::SemanticVad { eagerness: eagerness.clone() })
            }
            VadConfig::PushToTalk => None,
        }
    }
}

/// A model-invocable function, as advertised in the session config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDef {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputTranscription {
    pub model: String,
}

/// The session-configuration payload sent on connect (and on update).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// `null` disables server-side turn detection (push-to-talk).
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputTranscription>,
    pub tools: Vec<ToolDef>,
}

// ============================================================================
// Client → provider
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// One 20 ms frame of base64 PCM16 at the declared input rate.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    /// Push-to-talk: close the user's turn.
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit {},

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseOptions>,
    },

    /// Barge-in: stop the in-flight response immediately.
    #[serde(rename = "response.cancel")]
    ResponseCancel {},

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ResponseOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    /// Result of a tool invocation, fed back to the model.
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },

    /// Out-of-band user input (DTMF digits, system notes).
    #[serde(rename = "message")]
    Message { role: String, content: Vec<ContentPart> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}

// ============================================================================
// Provider → client
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {},

    #[serde(rename = "session.updated")]
    SessionUpdated {},

    #[serde(rename = "response.created")]
    ResponseCreated {},

    /// Base64 PCM16 audio at the declared output rate.
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    ResponseAudioDone {},

    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { delta: String },

    #[serde(rename = "response.function_call_arguments.delta")]
    ResponseFunctionCallArgumentsDelta { call_id: String, delta: String },

    #[serde(rename = "response.function_call_arguments.done")]
    ResponseFunctionCallArgumentsDone {
        call_id: String,
        name: String,
        arguments: String,
    },

    #[serde(rename = "response.done")]
    ResponseDone {},

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },

    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated {},

    #[serde(rename = "error")]
    Error { error: ProviderErrorBody },

    /// Forward-compatible: anything we don't model yet.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_append_shape() {
        let json = serde_json::to_value(ClientEvent::InputAudioBufferAppend {
            audio: "AAAA".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "input_audio_buffer.append");
        assert_eq!(json["audio"], "AAAA");
    }

    #[test]
    fn test_session_update_serializes_vad_null_for_push_to_talk() {
        let config = SessionConfig {
            instructions: "hi".into(),
            voice: "alloy".into(),
            input_audio_format: "pcm16".into(),
            output_audio_format: "pcm16".into(),
            input_sample_rate: 24000,
            output_sample_rate: 24000,
            turn_detection: TurnDetection::from_vad(&VadConfig::PushToTalk),
            input_audio_transcription: None,
            tools: vec![],
        };
        let json = serde_json::to_value(ClientEvent::SessionUpdate { session: config }).unwrap();
        assert_eq!(json["type"], "session.update");
        assert!(json["session"]["turn_detection"].is_null());
    }

    #[test]
    fn test_server_vad_tagged() {
        let vad = TurnDetection::from_vad(&VadConfig::ServerVad {
            threshold: 0.6,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        })
        .unwrap();
        let json = serde_json::to_value(&vad).unwrap();
        assert_eq!(json["type"], "server_vad");
        assert_eq!(json["silence_duration_ms"], 500);
    }

    #[test]
    fn test_server_event_audio_delta_parses() {
        let raw = r#"{"type":"response.audio.delta","delta":"UklGRg=="}"#;
        match serde_json::from_str::<ServerEvent>(raw).unwrap() {
            ServerEvent::ResponseAudioDelta { delta } => assert_eq!(delta, "UklGRg=="),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_function_call_done_parses() {
        let raw = r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"take_message","arguments":"{\"message\":\"hi\"}"}"#;
        match serde_json::from_str::<ServerEvent>(raw).unwrap() {
            ServerEvent::ResponseFunctionCallArgumentsDone { call_id, name, arguments } => {
                assert_eq!(call_id, "c1");
                assert_eq!(name, "take_message");
                assert!(arguments.contains("message"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_type_tolerated() {
        let raw = r#"{"type":"response.shiny_new_thing","payload":123}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(raw).unwrap(),
            ServerEvent::Unknown
        ));
    }

    #[test]
    fn test_function_output_item_shape() {
        let item = ConversationItem::FunctionCallOutput {
            call_id: "c9".into(),
            output: r#"{"status":"ok"}"#.into(),
        };
        let json = serde_json::to_value(ClientEvent::ConversationItemCreate { item }).unwrap();
        assert_eq!(json["item"]["type"], "function_call_output");
        assert_eq!(json["item"]["call_id"], "c9");
    }
}
