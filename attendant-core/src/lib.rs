//! Attendant core — the per-call mediation runtime.
//!
//! Bridges a telephony switch to a streaming conversational speech model
//! so an inbound phone call is answered by a tenant-configured virtual
//! secretary that can greet, converse, hand off to a human via announced
//! transfer, take a message, and end the call.
//!
//! One call = one [`session::Session`], composed of an event bus, a
//! hierarchical state machine, the audio pipeline (G.711 codec,
//! resampler, echo canceller, playback pacer), a provider session, the
//! tool registry, the transfer orchestrator and a call logger. The
//! server binary (`attendant-server`) wires sessions to the switch's
//! event socket and media stream.

pub mod audio;
pub mod audio_constants;
pub mod bus;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod provider;
pub mod record;
pub mod session;
pub mod state;
pub mod switch;
pub mod tools;
pub mod transfer;
