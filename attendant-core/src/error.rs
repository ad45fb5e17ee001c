//! Error taxonomy for the call runtime.
//!
//! Errors are handled at the nearest component that can recover.
//! Unrecoverable errors flip the state machine to `ending` and let
//! teardown run; every exit path still flushes the call record.

use thiserror::Error;

/// Malformed or missing tenant configuration. Surfaced at call start,
/// causes a graceful rejection with a spoken fallback.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("tenant {tenant}: {message}")]
    Invalid { tenant: String, message: String },

    #[error("no tenant configured for {0}")]
    UnknownTenant(String),
}

/// Audio pipeline construction faults. Surfaced once at session start;
/// the call is rejected with a spoken fallback.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("resampler init: {0}")]
    ResamplerInit(String),
}

/// Switch command failure or event-channel loss. Transient failures are
/// retried; persistent loss escalates to force_end.
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("switch io: {0}")]
    Io(#[from] std::io::Error),

    #[error("switch auth rejected")]
    AuthRejected,

    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("unexpected reply: {0}")]
    Protocol(String),

    #[error("control channel closed")]
    ChannelClosed,
}

/// Provider session faults, split by recoverability: transport errors
/// reconnect during active conversation, protocol errors drop the
/// offending event, rejection aborts the call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider connect: {0}")]
    Connect(String),

    #[error("provider transport: {0}")]
    Transport(String),

    #[error("provider protocol: {0}")]
    Protocol(String),

    #[error("session configuration rejected: {0}")]
    ConfigRejected(String),

    #[error("session wall-clock cap reached")]
    SessionCapReached,

    #[error("provider session closed")]
    Closed,
}

/// Tool dispatch failures. These are reported back to the model as a
/// structured function output, never raised through the session.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("tool {0} not permitted for this tenant")]
    NotPermitted(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("tool {tool} failed: {message}")]
    Failed { tool: String, message: String },
}

/// Announced-transfer failures, handled by the orchestrator's fallback
/// action.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no destination matched \"{0}\"")]
    NoDestination(String),

    #[error("destination {0} unavailable")]
    Unavailable(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("attendant decision timed out")]
    DecisionTimeout,

    #[error("transfer already in progress")]
    AlreadyInProgress,

    #[error(transparent)]
    Switch(#[from] SwitchError),
}

/// Call-record sink failures. The sink is at-least-once and idempotent,
/// so these only surface after retries are exhausted.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record sink: {0}")]
    Http(#[from] reqwest::Error),

    #[error("record sink rejected: {status} {body}")]
    Rejected { status: u16, body: String },

    #[error("record already flushed")]
    AlreadyFlushed,
}
