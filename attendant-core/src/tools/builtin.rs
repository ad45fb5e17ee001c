//! Built-in tools.
//!
//! Tools affect the call through bus events, not by reaching into the
//! session: `request_handoff` publishes `transfer.requested`, `end_call`
//! publishes `call.ending`, and the accept/reject pair publishes the
//! decision the transfer orchestrator is waiting on. The session and
//! orchestrator subscribe; the tools stay decoupled from both.

use super::{require_str, Tool, ToolCategory, ToolContext, ToolOutcome};
use crate::bus::EventKind;
use crate::error::ToolError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Every built-in, in catalog order.
pub fn all() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(RequestHandoff),
        Arc::new(TakeMessage),
        Arc::new(AcceptTransfer),
        Arc::new(RejectTransfer),
        Arc::new(EndCall),
        Arc::new(GetBusinessInfo),
        Arc::new(CreateTicket),
    ]
}

// ============================================================================
// request_handoff
// ============================================================================

pub struct RequestHandoff;

#[async_trait]
impl Tool for RequestHandoff {
    fn name(&self) -> &'static str {
        "request_handoff"
    }

    fn description(&self) -> &'static str {
        "Transfer the caller to a human or department. Use when the caller asks for a person, \
         or the request is beyond what you can handle."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Transfer
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "destination": {
                    "type": "string",
                    "description": "Name of the person or department to reach, e.g. \"Sales\""
                },
                "reason": {
                    "type": "string",
                    "description": "Short summary of what the caller needs"
                }
            },
            "required": ["destination"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutcome, ToolError> {
        let requested = require_str(&args, "destination", self.name())?;
        let reason = args.get("reason").and_then(|v| v.as_str()).unwrap_or("");

        let Some(destination) = ctx.tenant.resolve_destination(requested) else {
            return Ok(ToolOutcome::error(&format!(
                "no destination matches \"{requested}\" and no default is configured"
            )));
        };

        // The orchestrator (via the session) picks this up; the guard on
        // request_transfer keeps re-entry out.
        ctx.bus.emit(
            EventKind::TransferRequested,
            json!({
                "requested": requested,
                "destination": destination.name,
                "address": destination.address,
                "reason": reason,
            }),
            "tools",
        );

        Ok(ToolOutcome::ok_speak(
            json!({ "destination": destination.name }),
            &format!("Tell the caller you're connecting them to {} and ask them to hold on.", destination.name),
        ))
    }
}

// ============================================================================
// take_message
// ============================================================================

pub struct TakeMessage;

#[async_trait]
impl Tool for TakeMessage {
    fn name(&self) -> &'static str {
        "take_message"
    }

    fn description(&self) -> &'static str {
        "Record a message from the caller for the business to follow up on."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Call
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "caller_name": {
                    "type": "string",
                    "description": "Caller's name, or \"(unknown)\" if they didn't give one"
                },
                "message": { "type": "string", "description": "The message to pass on" },
                "callback_number": {
                    "type": ["string", "null"],
                    "description": "Number to call back, if different from the caller id"
                }
            },
            "required": ["caller_name", "message"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutcome, ToolError> {
        let caller_name = require_str(&args, "caller_name", self.name())?;
        let message = require_str(&args, "message", self.name())?;
        let callback = args.get("callback_number").and_then(|v| v.as_str());

        // The invocation record (inputs included) is the durable copy;
        // the logger flips the call outcome on our completion event.
        Ok(ToolOutcome::ok_speak(
            json!({
                "caller_name": caller_name,
                "message": message,
                "callback_number": callback,
                "caller_id": ctx.caller_id,
            }),
            "Confirm the message was taken and someone will get back to them.",
        ))
    }
}

// ============================================================================
// accept_transfer / reject_transfer — side-session only
// ============================================================================

pub struct AcceptTransfer;

#[async_trait]
impl Tool for AcceptTransfer {
    fn name(&self) -> &'static str {
        "accept_transfer"
    }

    fn description(&self) -> &'static str {
        "Accept the announced call and connect the caller now."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Transfer
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, ctx: &ToolContext, _args: Value) -> Result<ToolOutcome, ToolError> {
        ctx.bus.emit(EventKind::TransferAccepted, json!({}), "tools");
        Ok(ToolOutcome::ok(json!({ "accepted": true })))
    }
}

pub struct RejectTransfer;

#[async_trait]
impl Tool for RejectTransfer {
    fn name(&self) -> &'static str {
        "reject_transfer"
    }

    fn description(&self) -> &'static str {
        "Decline the announced call. The caller stays with the assistant."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Transfer
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string", "description": "Why the call can't be taken right now" }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutcome, ToolError> {
        let reason = args.get("reason").and_then(|v| v.as_str()).unwrap_or("unavailable");
        ctx.bus.emit(EventKind::TransferRejected, json!({ "reason": reason }), "tools");
        Ok(ToolOutcome::ok(json!({ "rejected": true, "reason": reason })))
    }
}

// ============================================================================
// end_call
// ============================================================================

pub struct EndCall;

#[async_trait]
impl Tool for EndCall {
    fn name(&self) -> &'static str {
        "end_call"
    }

    fn description(&self) -> &'static str {
        "End the call after saying goodbye. Use when the conversation is finished."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Call
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string", "description": "Why the call is ending" }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutcome, ToolError> {
        let reason = args.get("reason").and_then(|v| v.as_str()).unwrap_or("completed");
        ctx.bus.emit(
            EventKind::CallEnding,
            json!({ "reason": reason, "initiated_by": "tool" }),
            "tools",
        );
        Ok(ToolOutcome::ok_speak(
            json!({ "ending": true }),
            "Say a brief goodbye.",
        ))
    }
}

// ============================================================================
// get_business_info
// ============================================================================

pub struct GetBusinessInfo;

#[async_trait]
impl Tool for GetBusinessInfo {
    fn name(&self) -> &'static str {
        "get_business_info"
    }

    fn description(&self) -> &'static str {
        "Look up business facts: opening hours, address, website, and anything else configured."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Information
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "field": {
                    "type": "string",
                    "description": "Specific field to fetch; omit for everything"
                }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutcome, ToolError> {
        let info = &ctx.tenant.business_info;
        match args.get("field").and_then(|v| v.as_str()) {
            Some(field) => match info.get(field) {
                Some(value) => Ok(ToolOutcome::ok(json!({ "field": field, "value": value }))),
                None => Ok(ToolOutcome::error(&format!("no business info for \"{field}\""))),
            },
            None => Ok(ToolOutcome::ok(serde_json::to_value(info).unwrap_or_default())),
        }
    }
}

// ============================================================================
// create_ticket
// ============================================================================

pub struct CreateTicket;

#[async_trait]
impl Tool for CreateTicket {
    fn name(&self) -> &'static str {
        "create_ticket"
    }

    fn description(&self) -> &'static str {
        "Open a follow-up ticket so a human calls the caller back. Use after a failed \
         handoff when the caller agrees to a ticket."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Call
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string", "description": "One-sentence summary of the caller's need" },
                "reason": { "type": "string", "description": "Why the ticket is being opened" }
            },
            "required": ["summary"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutcome, ToolError> {
        let summary = require_str(&args, "summary", self.name())?;
        let reason = args.get("reason").and_then(|v| v.as_str()).unwrap_or("transfer_rejected");

        let Some(sink) = &ctx.sink else {
            return Ok(ToolOutcome::error("no ticket sink configured for this tenant"));
        };
        let ticket = crate::record::Ticket::new(
            ctx.call_id,
            &ctx.tenant.tenant_id,
            &ctx.caller_id,
            reason,
            summary,
        );
        match sink.create_ticket(&ticket).await {
            Ok(()) => Ok(ToolOutcome::ok_speak(
                json!({ "ticket_created": true }),
                "Confirm the ticket was created and someone will call back.",
            )),
            Err(e) => Err(ToolError::Failed { tool: self.name().to_string(), message: e.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::error::SwitchError;
    use crate::record::CallLogger;
    use crate::state::CallState;
    use crate::switch::SwitchControl;
    use crate::tools::ToolRegistry;
    use uuid::Uuid;

    /// Adapter stub — these tools never touch the switch directly.
    struct NoSwitch;

    #[async_trait]
    impl SwitchControl for NoSwitch {
        async fn originate_to_conference(&self, _: &str, _: &str, _: u64, _: &str) -> Result<String, SwitchError> {
            unreachable!("builtin tools must not originate")
        }
        async fn conference_enter(&self, _: &str, _: &str, _: bool, _: bool) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn conference_kick(&self, _: &str, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn conference_mute(&self, _: &str, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn conference_unmute(&self, _: &str, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn conference_list(&self, _: &str) -> Result<Vec<String>, SwitchError> {
            unreachable!()
        }
        async fn bridge(&self, _: &str, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn unbridge(&self, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn transfer(&self, _: &str, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn hold(&self, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn unhold(&self, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn start_media_stream(&self, _: &str, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn stop_media_stream(&self, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn registration_query(&self, _: &str) -> Result<bool, SwitchError> {
            Ok(true)
        }
        async fn execute_on_uuid(&self, _: &str, _: &str, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
        async fn hangup(&self, _: &str, _: &str) -> Result<(), SwitchError> {
            unreachable!()
        }
    }

    fn context() -> (Arc<EventBus>, ToolContext, ToolRegistry) {
        let call_id = Uuid::new_v4();
        let bus = Arc::new(EventBus::new(call_id));
        let tenant = crate::tools::tests::test_tenant(vec![]);
        let logger = CallLogger::new(call_id, "acme", "front-desk", "+15550001111", "Ana");
        let registry = ToolRegistry::for_tenant(&tenant, logger);
        let ctx = ToolContext {
            call_id,
            tenant,
            bus: bus.clone(),
            switch: Arc::new(NoSwitch),
            state: CallState::Active(crate::state::ActivePhase::Processing),
            channel_uuid: "chan-1".into(),
            caller_id: "+15550001111".into(),
            sink: None,
        };
        (bus, ctx, registry)
    }

    #[tokio::test]
    async fn test_request_handoff_resolves_and_publishes() {
        let (bus, ctx, registry) = context();
        let outcome = registry
            .dispatch(&ctx, "request_handoff", json!({"destination": "sales team", "reason": "pricing"}))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.data["destination"], "Sales");

        let requested = bus.history(Some(EventKind::TransferRequested), 5);
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].str_field("address"), Some("1001"));
        assert_eq!(requested[0].str_field("reason"), Some("pricing"));
    }

    #[tokio::test]
    async fn test_request_handoff_unknown_destination_falls_back_to_default() {
        let (_bus, ctx, registry) = context();
        // "Sales" is the default, so anything resolves to it.
        let outcome = registry
            .dispatch(&ctx, "request_handoff", json!({"destination": "warehouse"}))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.data["destination"], "Sales");
    }

    #[tokio::test]
    async fn test_take_message_requires_message() {
        let (_bus, ctx, registry) = context();
        let outcome = registry
            .dispatch(&ctx, "take_message", json!({"caller_name": "(unknown)"}))
            .await;
        assert!(!outcome.success);
        assert!(outcome.to_output()["data"]["error"]
            .as_str()
            .unwrap()
            .contains("message"));
    }

    #[tokio::test]
    async fn test_take_message_success_records_invocation() {
        let (bus, ctx, registry) = context();
        let outcome = registry
            .dispatch(
                &ctx,
                "take_message",
                json!({"caller_name": "(unknown)", "message": "Order 12345 is late", "callback_number": null}),
            )
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.data["message"], "Order 12345 is late");
        assert_eq!(bus.history(Some(EventKind::ToolStarted), 5).len(), 1);
        assert_eq!(bus.history(Some(EventKind::ToolCompleted), 5).len(), 1);
    }

    #[tokio::test]
    async fn test_end_call_publishes_call_ending() {
        let (bus, ctx, registry) = context();
        let outcome = registry.dispatch(&ctx, "end_call", json!({"reason": "done"})).await;
        assert!(outcome.success);
        let ending = bus.history(Some(EventKind::CallEnding), 5);
        assert_eq!(ending.len(), 1);
        assert_eq!(ending[0].str_field("reason"), Some("done"));
    }

    #[tokio::test]
    async fn test_accept_and_reject_publish_decisions() {
        let (bus, ctx, registry) = context();
        registry.dispatch(&ctx, "accept_transfer", json!({})).await;
        registry.dispatch(&ctx, "reject_transfer", json!({"reason": "busy"})).await;

        assert_eq!(bus.history(Some(EventKind::TransferAccepted), 5).len(), 1);
        let rejected = bus.history(Some(EventKind::TransferRejected), 5);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].str_field("reason"), Some("busy"));
    }

    #[tokio::test]
    async fn test_get_business_info_field_and_all() {
        let (_bus, ctx, registry) = context();
        let one = registry.dispatch(&ctx, "get_business_info", json!({"field": "hours"})).await;
        assert_eq!(one.data["value"], "Mon-Fri 9-17");

        let all = registry.dispatch(&ctx, "get_business_info", json!({})).await;
        assert_eq!(all.data["hours"], "Mon-Fri 9-17");

        let missing = registry.dispatch(&ctx, "get_business_info", json!({"field": "fax"})).await;
        assert!(!missing.success);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_structured_error() {
        let (_bus, ctx, registry) = context();
        let outcome = registry.dispatch(&ctx, "launch_rockets", json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.data["error"].as_str().unwrap().contains("unknown tool"));
    }
}
