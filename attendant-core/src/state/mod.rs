//! Call lifecycle state machine.
//!
//! The single source of truth for where a call is in its life. Components
//! never keep their own "in transfer" / "on hold" booleans — they ask the
//! machine or subscribe to `state.changed`.
//!
//! Hierarchy:
//! ```text
//! idle → connecting → active{listening|speaking|processing}
//!                       ├── on_hold
//!                       ├── transferring{validating|dialing|announcing|waiting|bridging} → bridged
//!                       └── ending → ended
//! ```
//!
//! Invalid triggers are dropped (never panic, never propagate) and emit
//! `state.transition.blocked`.

use crate::audio_constants::TRANSITION_HISTORY_LIMIT;
use crate::bus::{short_id, EventBus, EventKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivePhase {
    Listening,
    Speaking,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Validating,
    Dialing,
    Announcing,
    Waiting,
    Bridging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Active(ActivePhase),
    OnHold,
    Transferring(TransferPhase),
    Bridged,
    Ending,
    Ended,
}

impl CallState {
    /// Dotted hierarchical name ("transferring.waiting").
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active(ActivePhase::Listening) => "active.listening",
            Self::Active(ActivePhase::Speaking) => "active.speaking",
            Self::Active(ActivePhase::Processing) => "active.processing",
            Self::OnHold => "on_hold",
            Self::Transferring(TransferPhase::Validating) => "transferring.validating",
            Self::Transferring(TransferPhase::Dialing) => "transferring.dialing",
            Self::Transferring(TransferPhase::Announcing) => "transferring.announcing",
            Self::Transferring(TransferPhase::Waiting) => "transferring.waiting",
            Self::Transferring(TransferPhase::Bridging) => "transferring.bridging",
            Self::Bridged => "bridged",
            Self::Ending => "ending",
            Self::Ended => "ended",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn is_transferring(&self) -> bool {
        matches!(self, Self::Transferring(_))
    }

    /// The "connected" super-state: the caller is on the line.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Active(_) | Self::OnHold | Self::Transferring(_) | Self::Bridged
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Every trigger the machine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartCall,
    CallConnected,
    UserStartsSpeaking,
    UserStopsSpeaking,
    AiStartsSpeaking,
    AiStopsSpeaking,
    Hold,
    Unhold,
    RequestTransfer,
    DestinationValidated,
    AttendantAnswered,
    AnnouncementDone,
    TransferAccepted,
    TransferRejected,
    TransferTimeout,
    BridgeComplete,
    EndCall,
    CallEnded,
    ForceEnd,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartCall => "start_call",
            Self::CallConnected => "call_connected",
            Self::UserStartsSpeaking => "user_starts_speaking",
            Self::UserStopsSpeaking => "user_stops_speaking",
            Self::AiStartsSpeaking => "ai_starts_speaking",
            Self::AiStopsSpeaking => "ai_stops_speaking",
            Self::Hold => "hold",
            Self::Unhold => "unhold",
            Self::RequestTransfer => "request_transfer",
            Self::DestinationValidated => "destination_validated",
            Self::AttendantAnswered => "attendant_answered",
            Self::AnnouncementDone => "announcement_done",
            Self::TransferAccepted => "transfer_accepted",
            Self::TransferRejected => "transfer_rejected",
            Self::TransferTimeout => "transfer_timeout",
            Self::BridgeComplete => "bridge_complete",
            Self::EndCall => "end_call",
            Self::CallEnded => "call_ended",
            Self::ForceEnd => "force_end",
        }
    }
}

/// Guard inputs the session keeps current. Only `request_transfer`
/// consults them today.
#[derive(Debug, Default, Clone, Copy)]
pub struct GuardFlags {
    /// A transfer destination was named (or a default exists).
    pub destination_present: bool,
    /// Caller id (or a spoken name) is known.
    pub caller_identified: bool,
}

/// Outcome of applying a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { old: CallState, new: CallState },
    Blocked { state: CallState },
}

impl TransitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub trigger: Trigger,
    pub old: CallState,
    pub new: CallState,
    pub at: Instant,
}

struct Inner {
    state: CallState,
    entered_at: Instant,
    guards: GuardFlags,
    history: VecDeque<TransitionRecord>,
}

pub struct StateMachine {
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl StateMachine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            inner: Mutex::new(Inner {
                state: CallState::Idle,
                entered_at: Instant::now(),
                guards: GuardFlags::default(),
                history: VecDeque::with_capacity(TRANSITION_HISTORY_LIMIT),
            }),
        }
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    pub fn entered_at(&self) -> Instant {
        self.inner.lock().entered_at
    }

    pub fn set_guards(&self, guards: GuardFlags) {
        self.inner.lock().guards = guards;
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Apply a trigger. Transitions are serialized: the lock is held while
    /// the target is computed and recorded, then `state.changed` (or
    /// `state.transition.blocked`) is published after release.
    pub fn apply(&self, trigger: Trigger) -> TransitionOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            let old = inner.state;
            match Self::target(old, trigger, inner.guards) {
                Some(new) => {
                    inner.state = new;
                    let entered_at = Instant::now();
                    inner.entered_at = entered_at;
                    if inner.history.len() >= TRANSITION_HISTORY_LIMIT {
                        inner.history.pop_front();
                    }
                    inner.history.push_back(TransitionRecord {
                        trigger,
                        old,
                        new,
                        at: entered_at,
                    });
                    TransitionOutcome::Applied { old, new }
                }
                None => TransitionOutcome::Blocked { state: old },
            }
        };

        match outcome {
            TransitionOutcome::Applied { old, new } => {
                if old != new {
                    info!(
                        "call {}: {} → {} ({})",
                        short_id(&self.bus.call_id()),
                        old,
                        new,
                        trigger.as_str()
                    );
                } else {
                    debug!(
                        "call {}: {} self-transition ({})",
                        short_id(&self.bus.call_id()),
                        old,
                        trigger.as_str()
                    );
                }
                self.bus.emit(
                    EventKind::StateChanged,
                    serde_json::json!({
                        "old": old.name(),
                        "new": new.name(),
                        "trigger": trigger.as_str(),
                    }),
                    "state_machine",
                );
            }
            TransitionOutcome::Blocked { state } => {
                warn!(
                    "call {}: trigger {} blocked in {}",
                    short_id(&self.bus.call_id()),
                    trigger.as_str(),
                    state
                );
                self.bus.emit(
                    EventKind::StateTransitionBlocked,
                    serde_json::json!({
                        "state": state.name(),
                        "trigger": trigger.as_str(),
                    }),
                    "state_machine",
                );
            }
        }
        outcome
    }

    /// The transition table. Returns `None` when the trigger is invalid in
    /// the current state or a guard fails.
    fn target(state: CallState, trigger: Trigger, guards: GuardFlags) -> Option<CallState> {
        use ActivePhase as A;
        use CallState as S;
        use TransferPhase as T;
        use Trigger as Tr;

        match (state, trigger) {
            (S::Idle, Tr::StartCall) => Some(S::Connecting),
            (S::Connecting, Tr::CallConnected) => Some(S::Active(A::Listening)),

            // Conversation turn-taking.
            (S::Active(A::Listening), Tr::UserStartsSpeaking) => Some(S::Active(A::Listening)),
            // Barge-in: the user talking over the AI wins immediately.
            (S::Active(A::Speaking), Tr::UserStartsSpeaking) => Some(S::Active(A::Listening)),
            (S::Active(A::Listening), Tr::UserStopsSpeaking) => Some(S::Active(A::Processing)),
            (S::Active(A::Processing) | S::Active(A::Listening), Tr::AiStartsSpeaking) => {
                Some(S::Active(A::Speaking))
            }
            (S::Active(A::Speaking), Tr::AiStopsSpeaking) => Some(S::Active(A::Listening)),

            (S::Active(_), Tr::Hold) => Some(S::OnHold),
            (S::OnHold, Tr::Unhold) => Some(S::Active(A::Listening)),

            (S::Active(_), Tr::RequestTransfer) => {
                if guards.destination_present && guards.caller_identified {
                    Some(S::Transferring(T::Validating))
                } else {
                    None
                }
            }
            (S::Transferring(T::Validating), Tr::DestinationValidated) => {
                Some(S::Transferring(T::Dialing))
            }
            (S::Transferring(T::Dialing), Tr::AttendantAnswered) => {
                Some(S::Transferring(T::Announcing))
            }
            (S::Transferring(T::Announcing), Tr::AnnouncementDone) => {
                Some(S::Transferring(T::Waiting))
            }
            (S::Transferring(T::Waiting), Tr::TransferAccepted) => {
                Some(S::Transferring(T::Bridging))
            }
            (S::Transferring(_), Tr::TransferTimeout) => Some(S::Active(A::Listening)),
            // Rejection normally arrives in waiting, but the attendant can
            // also bail out mid-announcement.
            (S::Transferring(_), Tr::TransferRejected) => Some(S::Active(A::Listening)),
            (S::Transferring(T::Bridging), Tr::BridgeComplete) => Some(S::Bridged),

            (S::Ended, Tr::EndCall) => None,
            (_, Tr::EndCall) => Some(S::Ending),
            (S::Ending, Tr::CallEnded) => Some(S::Ended),
            (_, Tr::ForceEnd) => Some(S::Ended),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn machine() -> (Arc<EventBus>, StateMachine) {
        let bus = Arc::new(EventBus::new(Uuid::new_v4()));
        let sm = StateMachine::new(bus.clone());
        (bus, sm)
    }

    fn connect(sm: &StateMachine) {
        assert!(sm.apply(Trigger::StartCall).applied());
        assert!(sm.apply(Trigger::CallConnected).applied());
    }

    #[test]
    fn test_happy_path_to_active() {
        let (_bus, sm) = machine();
        assert_eq!(sm.state(), CallState::Idle);
        connect(&sm);
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Listening));
    }

    #[test]
    fn test_turn_taking_cycle() {
        let (_bus, sm) = machine();
        connect(&sm);
        assert!(sm.apply(Trigger::UserStartsSpeaking).applied());
        assert!(sm.apply(Trigger::UserStopsSpeaking).applied());
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Processing));
        assert!(sm.apply(Trigger::AiStartsSpeaking).applied());
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Speaking));
        assert!(sm.apply(Trigger::AiStopsSpeaking).applied());
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Listening));
    }

    #[test]
    fn test_barge_in_returns_to_listening() {
        let (_bus, sm) = machine();
        connect(&sm);
        sm.apply(Trigger::AiStartsSpeaking);
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Speaking));
        assert!(sm.apply(Trigger::UserStartsSpeaking).applied());
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Listening));
    }

    #[test]
    fn test_invalid_trigger_blocked_and_state_unchanged() {
        let (bus, sm) = machine();
        let outcome = sm.apply(Trigger::TransferAccepted);
        assert!(!outcome.applied());
        assert_eq!(sm.state(), CallState::Idle);

        let blocked = bus.history(Some(crate::bus::EventKind::StateTransitionBlocked), 10);
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].str_field("trigger"), Some("transfer_accepted"));
    }

    #[test]
    fn test_transfer_guard() {
        let (_bus, sm) = machine();
        connect(&sm);

        // No destination known → blocked.
        assert!(!sm.apply(Trigger::RequestTransfer).applied());
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Listening));

        sm.set_guards(GuardFlags { destination_present: true, caller_identified: true });
        assert!(sm.apply(Trigger::RequestTransfer).applied());
        assert_eq!(sm.state(), CallState::Transferring(TransferPhase::Validating));

        // Re-entry guarded: request_transfer is invalid while transferring.
        assert!(!sm.apply(Trigger::RequestTransfer).applied());
    }

    #[test]
    fn test_full_transfer_accept_path() {
        let (_bus, sm) = machine();
        connect(&sm);
        sm.set_guards(GuardFlags { destination_present: true, caller_identified: true });

        for trigger in [
            Trigger::RequestTransfer,
            Trigger::DestinationValidated,
            Trigger::AttendantAnswered,
            Trigger::AnnouncementDone,
            Trigger::TransferAccepted,
            Trigger::BridgeComplete,
        ] {
            assert!(sm.apply(trigger).applied(), "trigger {:?} should apply", trigger);
        }
        assert_eq!(sm.state(), CallState::Bridged);
    }

    #[test]
    fn test_transfer_reject_returns_to_listening() {
        let (_bus, sm) = machine();
        connect(&sm);
        sm.set_guards(GuardFlags { destination_present: true, caller_identified: true });
        sm.apply(Trigger::RequestTransfer);
        sm.apply(Trigger::DestinationValidated);
        sm.apply(Trigger::AttendantAnswered);
        sm.apply(Trigger::AnnouncementDone);
        assert!(sm.apply(Trigger::TransferRejected).applied());
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Listening));
    }

    #[test]
    fn test_transfer_timeout_from_any_phase() {
        let (_bus, sm) = machine();
        connect(&sm);
        sm.set_guards(GuardFlags { destination_present: true, caller_identified: true });
        sm.apply(Trigger::RequestTransfer);
        sm.apply(Trigger::DestinationValidated);
        assert_eq!(sm.state(), CallState::Transferring(TransferPhase::Dialing));
        assert!(sm.apply(Trigger::TransferTimeout).applied());
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Listening));
    }

    #[test]
    fn test_hold_unhold() {
        let (_bus, sm) = machine();
        connect(&sm);
        sm.apply(Trigger::AiStartsSpeaking);
        assert!(sm.apply(Trigger::Hold).applied());
        assert_eq!(sm.state(), CallState::OnHold);
        assert!(sm.apply(Trigger::Unhold).applied());
        assert_eq!(sm.state(), CallState::Active(ActivePhase::Listening));
    }

    #[test]
    fn test_end_from_anywhere_except_ended() {
        let (_bus, sm) = machine();
        connect(&sm);
        assert!(sm.apply(Trigger::EndCall).applied());
        assert_eq!(sm.state(), CallState::Ending);
        assert!(sm.apply(Trigger::CallEnded).applied());
        assert_eq!(sm.state(), CallState::Ended);

        // end_call from ended is invalid.
        assert!(!sm.apply(Trigger::EndCall).applied());
    }

    #[test]
    fn test_force_end_from_anywhere() {
        let (_bus, sm) = machine();
        connect(&sm);
        sm.set_guards(GuardFlags { destination_present: true, caller_identified: true });
        sm.apply(Trigger::RequestTransfer);
        assert!(sm.apply(Trigger::ForceEnd).applied());
        assert_eq!(sm.state(), CallState::Ended);
    }

    #[test]
    fn test_state_changed_events_carry_old_and_new() {
        let (bus, sm) = machine();
        connect(&sm);
        let changes = bus.history(Some(crate::bus::EventKind::StateChanged), 10);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].str_field("old"), Some("idle"));
        assert_eq!(changes[0].str_field("new"), Some("connecting"));
        assert_eq!(changes[1].str_field("old"), Some("connecting"));
        assert_eq!(changes[1].str_field("new"), Some("active.listening"));
    }

    #[test]
    fn test_history_records_transitions() {
        let (_bus, sm) = machine();
        connect(&sm);
        let history = sm.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].new, CallState::Active(ActivePhase::Listening));
    }
}
