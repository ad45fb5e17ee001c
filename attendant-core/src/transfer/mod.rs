//! Announced (attended) transfer.
//!
//! A temporary conference is the rendezvous: the caller is parked in it
//! muted while the attendant is dialed straight into the same room,
//! announced to by a restricted side provider session, and asked for a
//! definite accept/reject. Park-and-bridge approaches are avoided on
//! purpose — parking mutes the B-leg on some switches and strands the
//! A-leg if the B-leg hangs up mid-handoff.
//!
//! Every side effect (conference members, originated legs, the side
//! session) is undone on every error exit path.

pub mod announce;

use crate::bus::{short_id, EventBus, EventKind, VoiceEvent};
use crate::config::{DestinationKind, FallbackAction, TenantConfig, TransferDestination};
use crate::error::{SwitchError, TransferError};
use crate::heartbeat::TimeoutScope;
use crate::state::{StateMachine, Trigger};
use crate::switch::SwitchControl;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// How long we wait for the attendant's accept/reject after the
/// announcement finishes.
pub const DECISION_TIMEOUT: Duration = Duration::from_secs(15);

/// Speaks the announcement on the B-leg and relays the attendant's
/// decision onto the main bus. Production uses a side provider session
/// (`announce::ProviderAnnouncer`); tests script it.
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Start announcing to the answered B-leg. Resolves when the
    /// announcement has been delivered; the decision arrives later as a
    /// `transfer.accepted` / `transfer.rejected` bus event.
    async fn announce(&self, b_leg_uuid: Uuid, text: &str) -> Result<(), TransferError>;

    /// Tear down the side session and any media routing for the B-leg.
    async fn teardown(&self, b_leg_uuid: Uuid);
}

/// What the transfer attempt came to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Accepted — the legs are connected, the AI is out of the call.
    Bridged,
    /// Back with the AI. `speak` is what the model should tell the
    /// caller; `offer_ticket` asks the model to offer a follow-up ticket.
    ReturnedToAgent { speak: String, offer_ticket: bool },
    /// A-leg routed to voicemail; the session should wind down.
    SentToVoicemail,
    /// Caller hung up (or the switch failed) mid-transfer.
    Aborted,
}

/// The resolved request handed over by the session when the model calls
/// `request_handoff`.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub destination: TransferDestination,
    pub reason: String,
}

pub struct TransferOrchestrator {
    call_id: Uuid,
    /// A-leg channel on the switch.
    a_leg: Uuid,
    caller_number: String,
    caller_name: String,
    bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    switch: Arc<dyn SwitchControl>,
    tenant: Arc<TenantConfig>,
    announcer: Arc<dyn Announcer>,
    decision_timeout: Duration,
}

impl TransferOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: Uuid,
        a_leg: Uuid,
        caller_number: &str,
        caller_name: &str,
        bus: Arc<EventBus>,
        machine: Arc<StateMachine>,
        switch: Arc<dyn SwitchControl>,
        tenant: Arc<TenantConfig>,
        announcer: Arc<dyn Announcer>,
    ) -> Self {
        Self {
            call_id,
            a_leg,
            caller_number: caller_number.to_string(),
            caller_name: caller_name.to_string(),
            bus,
            machine,
            switch,
            tenant,
            announcer,
            decision_timeout: DECISION_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    /// Run the announced-transfer protocol. The machine must already be
    /// in `transferring.validating` (the session applies the guarded
    /// `request_transfer` trigger before calling this).
    pub async fn run(&self, request: TransferRequest) -> TransferOutcome {
        let destination = &request.destination;
        let call = short_id(&self.call_id);
        info!(
            "call {call}: announced transfer to {} ({})",
            destination.name, destination.address
        );

        // Step 1-2: validate availability before touching the call.
        if let Err(e) = self.validate(destination).await {
            warn!("call {call}: destination unavailable: {e}");
            self.bus.emit(
                EventKind::TransferFailed,
                serde_json::json!({ "stage": "validate", "error": e.to_string() }),
                "transfer",
            );
            self.machine.apply(Trigger::TransferTimeout);
            return self.fallback(destination, "unavailable").await;
        }
        self.bus.emit(
            EventKind::TransferValidated,
            serde_json::json!({ "destination": destination.name }),
            "transfer",
        );
        self.machine.apply(Trigger::DestinationValidated);

        // Step 3: unique rendezvous room.
        let conference = format!("transfer_{}_{}", call, chrono::Utc::now().timestamp());

        // Step 4: caller into the room, muted, as moderator.
        if let Err(e) = self
            .switch
            .conference_enter(&self.a_leg.to_string(), &conference, true, true)
            .await
        {
            warn!("call {call}: could not move caller into {conference}: {e}");
            return self.abort(&conference, None).await;
        }
        self.bus.emit(EventKind::HoldStarted, serde_json::json!({}), "transfer");

        // Step 5: dial the attendant into the room.
        let b_leg = match self.dial_attendant(destination, &conference).await {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!("call {call}: attendant dial failed: {e}");
                self.bus.emit(
                    EventKind::TransferFailed,
                    serde_json::json!({ "stage": "dial", "error": e.to_string() }),
                    "transfer",
                );
                self.undo_conference(&conference).await;
                self.machine.apply(Trigger::TransferTimeout);
                return self.fallback(destination, "no_answer").await;
            }
        };
        self.machine.apply(Trigger::AttendantAnswered);
        self.bus.emit(
            EventKind::TransferAnswered,
            serde_json::json!({ "b_leg": b_leg.to_string() }),
            "transfer",
        );

        // Step 7's waiter is registered before the announcement starts so
        // an eager attendant who decides mid-announcement isn't missed.
        // The machine trigger is still applied in order below.
        let decision_watch = self.bus.watch_any(
            &[
                EventKind::TransferAccepted,
                EventKind::TransferRejected,
                EventKind::TransferTimeout,
                EventKind::CallEnded,
            ],
            None,
        );

        // Step 6: side session announces.
        self.bus.emit(EventKind::TransferAnnouncing, serde_json::json!({}), "transfer");
        let announcement = self.announcement_text(&request);
        if let Err(e) = self.announcer.announce(b_leg, &announcement).await {
            warn!("call {call}: announcement failed: {e}");
            self.bus.unwatch(decision_watch.id);
            return self.abort(&conference, Some(b_leg)).await;
        }
        self.machine.apply(Trigger::AnnouncementDone);

        // Step 7: await the decision. The deadline is a cancellable scope
        // that surfaces as a `transfer.timeout` event; a decision arriving
        // first cancels it before it can fire.
        let deadline = TimeoutScope::emit_on_expiry(
            self.bus.clone(),
            EventKind::TransferTimeout,
            serde_json::json!({ "waited_ms": self.decision_timeout.as_millis() as u64 }),
            self.decision_timeout,
        );
        let decision = decision_watch.rx.await.ok();
        deadline.cancel();

        match decision {
            Some(VoiceEvent { kind: EventKind::TransferAccepted, .. }) => {
                self.accept(&conference, b_leg).await
            }
            Some(VoiceEvent { kind: EventKind::TransferRejected, ref data, .. }) => {
                let reason = data
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("rejected")
                    .to_string();
                self.reject(&conference, b_leg, destination, &reason).await
            }
            Some(VoiceEvent { kind: EventKind::CallEnded, ref data, .. }) => {
                let ended_channel = data
                    .get("channel_uuid")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok());
                if ended_channel == Some(b_leg) {
                    // Attendant hung up on the announcement — a rejection.
                    self.reject(&conference, b_leg, destination, "attendant_hangup").await
                } else {
                    // Caller gone — unwind everything.
                    info!("call {call}: caller hung up mid-transfer");
                    self.bus.emit(EventKind::TransferCancelled, serde_json::json!({}), "transfer");
                    self.abort(&conference, Some(b_leg)).await
                }
            }
            _ => {
                // transfer.timeout fired (or the bus went away with it).
                self.announcer.teardown(b_leg).await;
                self.kick_quietly(&conference, &b_leg.to_string()).await;
                self.undo_conference(&conference).await;
                self.machine.apply(Trigger::TransferTimeout);
                self.fallback(destination, "no_decision").await
            }
        }
    }

    /// Presence + working-hours validation.
    async fn validate(&self, destination: &TransferDestination) -> Result<(), TransferError> {
        if let Some(hours) = &destination.working_hours {
            if !hours.contains(chrono::Local::now()) {
                return Err(TransferError::Unavailable(format!(
                    "{} outside working hours",
                    destination.name
                )));
            }
        }
        // Registration only means something for switch-local endpoints.
        match destination.kind {
            DestinationKind::Extension | DestinationKind::RingGroup | DestinationKind::Queue => {
                let registered = self.switch.registration_query(&destination.address).await?;
                if !registered {
                    return Err(TransferError::Unavailable(destination.address.clone()));
                }
            }
            DestinationKind::External | DestinationKind::Voicemail => {}
        }
        Ok(())
    }

    /// Bounded dial with redials.
    async fn dial_attendant(
        &self,
        destination: &TransferDestination,
        conference: &str,
    ) -> Result<Uuid, TransferError> {
        let attempts = destination.max_retries + 1;
        let mut last = TransferError::DialFailed("no attempts".into());

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(destination.retry_delay_secs)).await;
            }
            self.bus.emit(
                EventKind::TransferDialing,
                serde_json::json!({ "attempt": attempt + 1, "address": destination.address }),
                "transfer",
            );
            match self
                .switch
                .originate_to_conference(
                    &destination.address,
                    conference,
                    destination.ring_timeout_secs,
                    &format!("Transfer: {}", self.caller_name_or_number()),
                )
                .await
            {
                Ok(uuid_str) => {
                    let uuid = Uuid::parse_str(&uuid_str).map_err(|_| {
                        TransferError::DialFailed(format!("switch returned bad uuid {uuid_str}"))
                    })?;
                    return Ok(uuid);
                }
                Err(e) => {
                    warn!(
                        "dial attempt {}/{} to {} failed: {e}",
                        attempt + 1,
                        attempts,
                        destination.address
                    );
                    last = TransferError::from(e);
                }
            }
        }
        Err(last)
    }

    async fn accept(&self, conference: &str, b_leg: Uuid) -> TransferOutcome {
        let call = short_id(&self.call_id);
        self.machine.apply(Trigger::TransferAccepted);
        self.announcer.teardown(b_leg).await;

        // Step 8: open the caller's audio; the two legs converse in the
        // room. The main provider session is torn down by the session on
        // seeing `bridged` — the call itself stays up.
        if let Err(e) = self.switch.conference_unmute(conference, &self.a_leg.to_string()).await {
            warn!("call {call}: unmute failed after accept: {e}");
            return self.abort(conference, Some(b_leg)).await;
        }
        self.bus.emit(EventKind::HoldEnded, serde_json::json!({}), "transfer");
        self.machine.apply(Trigger::BridgeComplete);
        self.bus.emit(
            EventKind::TransferCompleted,
            serde_json::json!({ "conference": conference, "b_leg": b_leg.to_string() }),
            "transfer",
        );
        info!("call {call}: transfer completed into {conference}");
        TransferOutcome::Bridged
    }

    async fn reject(
        &self,
        conference: &str,
        b_leg: Uuid,
        destination: &TransferDestination,
        reason: &str,
    ) -> TransferOutcome {
        let call = short_id(&self.call_id);
        info!("call {call}: transfer rejected ({reason})");
        self.announcer.teardown(b_leg).await;
        self.kick_quietly(conference, &b_leg.to_string()).await;
        self.undo_conference(conference).await;
        self.machine.apply(Trigger::TransferRejected);
        self.fallback(destination, reason).await
    }

    /// Return the caller to the agent (or onward) per the destination's
    /// fallback action. The machine is already back in `active.listening`
    /// (or `ending` for the hang-up action).
    async fn fallback(&self, destination: &TransferDestination, reason: &str) -> TransferOutcome {
        let secretary = &self.tenant.secretary;
        match destination.fallback {
            FallbackAction::OfferTicket => TransferOutcome::ReturnedToAgent {
                speak: secretary.ticket_offer_message.clone(),
                offer_ticket: true,
            },
            FallbackAction::AutoTicket => TransferOutcome::ReturnedToAgent {
                speak: format!(
                    "Tell the caller {} couldn't be reached ({reason}) and a ticket was opened; someone will follow up.",
                    destination.name
                ),
                offer_ticket: false,
            },
            FallbackAction::Voicemail => {
                let vm = destination.address.strip_prefix("vm:").unwrap_or(&destination.address);
                if let Err(e) = self.switch.transfer(&self.a_leg.to_string(), &format!("voicemail:{vm}")).await {
                    warn!("voicemail fallback failed: {e}");
                    return TransferOutcome::ReturnedToAgent {
                        speak: secretary.failure_message.clone(),
                        offer_ticket: self.tenant.ticket_on_error,
                    };
                }
                TransferOutcome::SentToVoicemail
            }
            FallbackAction::ReturnToAgent => TransferOutcome::ReturnedToAgent {
                speak: format!(
                    "Tell the caller {} isn't available right now ({reason}) and ask how else you can help.",
                    destination.name
                ),
                offer_ticket: false,
            },
            FallbackAction::HangUp => {
                let _ = self.switch.hangup(&self.a_leg.to_string(), "NORMAL_CLEARING").await;
                self.machine.apply(Trigger::EndCall);
                TransferOutcome::Aborted
            }
        }
    }

    /// Unwind everything after an unrecoverable mid-protocol failure:
    /// empty the room, kill the side session, put the caller back with
    /// the agent if the call is still up.
    async fn abort(&self, conference: &str, b_leg: Option<Uuid>) -> TransferOutcome {
        if let Some(b) = b_leg {
            self.announcer.teardown(b).await;
            self.kick_quietly(conference, &b.to_string()).await;
        }
        self.undo_conference(conference).await;
        self.bus.emit(
            EventKind::TransferFailed,
            serde_json::json!({ "stage": "abort" }),
            "transfer",
        );
        self.machine.apply(Trigger::TransferTimeout);
        TransferOutcome::Aborted
    }

    /// Remove the A-leg from the conference, back to its parked state
    /// where the media stream still runs.
    async fn undo_conference(&self, conference: &str) {
        self.kick_quietly(conference, &self.a_leg.to_string()).await;
        // Anyone left (failed half-joins) goes too; an empty room dies.
        if let Ok(members) = self.switch.conference_list(conference).await {
            for member in members {
                self.kick_quietly(conference, &member).await;
            }
        }
        self.bus.emit(EventKind::HoldEnded, serde_json::json!({}), "transfer");
    }

    async fn kick_quietly(&self, conference: &str, member: &str) {
        if let Err(e) = self.switch.conference_kick(conference, member).await {
            match e {
                // Already gone is fine.
                SwitchError::CommandFailed(_) => {}
                other => warn!("kick {member} from {conference}: {other}"),
            }
        }
    }

    fn caller_name_or_number(&self) -> &str {
        if self.caller_name.trim().is_empty() {
            &self.caller_number
        } else {
            &self.caller_name
        }
    }

    fn announcement_text(&self, request: &TransferRequest) -> String {
        let who = self.caller_name_or_number();
        if request.reason.trim().is_empty() {
            format!("You have a call from {who}. Say accept to take it, or reject if you can't.")
        } else {
            format!(
                "You have a call from {who} regarding {}. Say accept to take it, or reject if you can't.",
                request.reason
            )
        }
    }
}
