//! Model-invocable tools.
//!
//! The registry replaces dispatch-by-switch-statement: each tool is a
//! trait object with a name, a JSON-schema parameter declaration and an
//! async implementation. Tenants get a filtered view via their
//! allow-list. Invocations are serialized per call, timed, and recorded
//! to the call record; a failing tool produces a structured error
//! outcome, never a panic or a dropped call.

pub mod builtin;

use crate::bus::{EventBus, EventKind};
use crate::config::TenantConfig;
use crate::error::ToolError;
use crate::provider::protocol::ToolDef;
use crate::record::{CallLogger, RecordSink, ToolInvocation};
use crate::state::CallState;
use crate::switch::SwitchControl;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Rough grouping for diagnostics and allow-list documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    Call,
    Transfer,
    Information,
}

/// What a tool hands back. `speak` is an optional natural-language
/// instruction the model should voice to the caller.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub data: Value,
    pub speak: Option<String>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self { success: true, data, speak: None }
    }

    pub fn ok_speak(data: Value, speak: &str) -> Self {
        Self { success: true, data, speak: Some(speak.to_string()) }
    }

    pub fn error(message: &str) -> Self {
        Self {
            success: false,
            data: serde_json::json!({ "error": message }),
            speak: None,
        }
    }

    /// The function-output payload sent back to the model.
    pub fn to_output(&self) -> Value {
        let mut out = serde_json::json!({
            "status": if self.success { "ok" } else { "error" },
            "data": self.data,
        });
        if let Some(speak) = &self.speak {
            out["instruction"] = Value::String(speak.clone());
        }
        out
    }
}

/// Everything a tool implementation may touch. The switch handle is
/// borrowed — tools never own connections.
pub struct ToolContext {
    pub call_id: Uuid,
    pub tenant: Arc<TenantConfig>,
    pub bus: Arc<EventBus>,
    pub switch: Arc<dyn SwitchControl>,
    /// State snapshot at dispatch time.
    pub state: CallState,
    /// Channel UUID of the caller's leg on the switch.
    pub channel_uuid: String,
    /// Caller id as presented by the switch.
    pub caller_id: String,
    /// Record/ticket sink, when the tenant has one configured.
    pub sink: Option<Arc<RecordSink>>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn category(&self) -> ToolCategory;
    /// JSON-schema for the argument object.
    fn parameters(&self) -> Value;
    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutcome, ToolError>;
}

/// The per-call tool catalog.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    logger: Arc<CallLogger>,
    /// Serializes tool execution within one call.
    exec_lock: tokio::sync::Mutex<()>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>, logger: Arc<CallLogger>) -> Self {
        Self { tools, logger, exec_lock: tokio::sync::Mutex::new(()) }
    }

    /// Full built-in set, filtered by the tenant allow-list (empty list =
    /// everything permitted).
    pub fn for_tenant(tenant: &TenantConfig, logger: Arc<CallLogger>) -> Self {
        let allow = &tenant.secretary.tool_allow;
        let tools = builtin::all()
            .into_iter()
            .filter(|t| allow.is_empty() || allow.iter().any(|a| a == t.name()))
            .collect();
        Self::new(tools, logger)
    }

    /// Restricted set for the transfer side-session: the attendant can
    /// only accept or reject.
    pub fn transfer_decision_only(logger: Arc<CallLogger>) -> Self {
        let tools = builtin::all()
            .into_iter()
            .filter(|t| matches!(t.name(), "accept_transfer" | "reject_transfer"))
            .collect();
        Self::new(tools, logger)
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools
            .iter()
            .map(|t| ToolDef::function(t.name(), t.description(), t.parameters()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    /// Execute one invocation. Always returns an outcome — errors are
    /// folded into a structured error outcome for the model.
    pub async fn dispatch(&self, ctx: &ToolContext, name: &str, args: Value) -> ToolOutcome {
        let _serialized = self.exec_lock.lock().await;

        let Some(tool) = self.tools.iter().find(|t| t.name() == name).cloned() else {
            warn!("model invoked unknown tool {name}");
            let outcome = ToolOutcome::error(&format!("unknown tool: {name}"));
            self.record(ctx, name, &serde_json::json!({}), &outcome, 0);
            return outcome;
        };

        ctx.bus.emit(
            EventKind::ToolStarted,
            serde_json::json!({ "name": name, "args": args }),
            "tools",
        );

        let started = Instant::now();
        let result = tool.execute(ctx, args.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("tool {name} failed: {e}");
                ToolOutcome::error(&e.to_string())
            }
        };

        if outcome.success {
            info!("tool {name} completed in {duration_ms}ms");
            ctx.bus.emit(
                EventKind::ToolCompleted,
                serde_json::json!({ "name": name, "duration_ms": duration_ms }),
                "tools",
            );
        } else {
            ctx.bus.emit(
                EventKind::ToolFailed,
                serde_json::json!({ "name": name, "error": outcome.data.get("error") }),
                "tools",
            );
        }

        self.record(ctx, name, &args, &outcome, duration_ms);
        outcome
    }

    fn record(&self, _ctx: &ToolContext, name: &str, args: &Value, outcome: &ToolOutcome, duration_ms: u64) {
        self.logger.add_tool(ToolInvocation {
            name: name.to_string(),
            input: args.clone(),
            output: outcome.to_output(),
            duration_ms,
            success: outcome.success,
        });
    }
}

/// Pull a required string argument, with a tool-shaped error.
pub(crate) fn require_str<'a>(args: &'a Value, key: &str, tool: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: format!("missing required argument \"{key}\""),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SecretaryProfile, VadConfig};

    pub(crate) fn test_tenant(allow: Vec<String>) -> Arc<TenantConfig> {
        Arc::new(TenantConfig {
            tenant_id: "acme".into(),
            numbers: vec!["+15551234567".into()],
            secretary: SecretaryProfile {
                secretary_id: "front-desk".into(),
                instructions: "Be brief.".into(),
                greeting: "Hello from Acme!".into(),
                voice: "alloy".into(),
                vad: VadConfig::default(),
                tool_allow: allow,
                handoff_keywords: vec![],
                max_turns: 0,
                failure_message: "Trouble connecting.".into(),
                ticket_offer_message: "Want a ticket?".into(),
            },
            destinations: vec![crate::config::TransferDestination {
                name: "Sales".into(),
                aliases: vec!["sales team".into()],
                kind: crate::config::DestinationKind::Extension,
                address: "1001".into(),
                ring_timeout_secs: 5,
                max_retries: 0,
                retry_delay_secs: 1,
                fallback: crate::config::FallbackAction::OfferTicket,
                working_hours: None,
                priority: 0,
                default: true,
                enabled: true,
            }],
            business_info: [("hours".to_string(), "Mon-Fri 9-17".to_string())].into(),
            record_sink_url: None,
            ticket_on_error: false,
        })
    }

    #[test]
    fn test_allow_list_filters() {
        let logger = CallLogger::new(Uuid::new_v4(), "acme", "s", "c", "n");
        let tenant = test_tenant(vec!["end_call".into(), "take_message".into()]);
        let registry = ToolRegistry::for_tenant(&tenant, logger);
        assert!(registry.contains("end_call"));
        assert!(registry.contains("take_message"));
        assert!(!registry.contains("request_handoff"));
    }

    #[test]
    fn test_empty_allow_list_means_all() {
        let logger = CallLogger::new(Uuid::new_v4(), "acme", "s", "c", "n");
        let tenant = test_tenant(vec![]);
        let registry = ToolRegistry::for_tenant(&tenant, logger);
        for name in [
            "request_handoff",
            "take_message",
            "accept_transfer",
            "reject_transfer",
            "end_call",
            "get_business_info",
            "create_ticket",
        ] {
            assert!(registry.contains(name), "{name} missing");
        }
    }

    #[test]
    fn test_transfer_decision_registry_is_minimal() {
        let logger = CallLogger::new(Uuid::new_v4(), "acme", "s", "c", "n");
        let registry = ToolRegistry::transfer_decision_only(logger);
        assert!(registry.contains("accept_transfer"));
        assert!(registry.contains("reject_transfer"));
        assert!(!registry.contains("end_call"));
        assert_eq!(registry.definitions().len(), 2);
    }

    #[test]
    fn test_outcome_output_shape() {
        let outcome = ToolOutcome::ok_speak(serde_json::json!({"x": 1}), "Say hi");
        let output = outcome.to_output();
        assert_eq!(output["status"], "ok");
        assert_eq!(output["data"]["x"], 1);
        assert_eq!(output["instruction"], "Say hi");

        let error = ToolOutcome::error("nope").to_output();
        assert_eq!(error["status"], "error");
        assert_eq!(error["data"]["error"], "nope");
    }
}
