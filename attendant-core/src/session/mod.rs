//! Per-call session: the composition root.
//!
//! One `Session` owns everything for one call — bus, state machine,
//! heartbeat, audio pipeline, provider session, tool registry, call
//! logger — and wires the two audio paths:
//!
//! ```text
//! switch → media ws → codec → resampler → AEC → provider
//! provider → resampler → codec → pacer → media ws → switch
//! ```
//!
//! The run loop is the only place that reacts to provider updates and
//! switch events, which keeps per-call processing serialized end to end.

pub mod registry;

pub use registry::SessionRegistry;

use crate::audio::aec::EchoCanceller;
use crate::audio::pacer::PlaybackPacer;
use crate::audio::resampler::FrameResampler;
use crate::audio_constants::{PROVIDER_SAMPLE_RATE, SWITCH_SAMPLE_RATE};
use crate::bus::{short_id, EventBus, EventKind, VoiceEvent};
use crate::config::TenantConfig;
use crate::error::ProviderError;
use crate::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::provider::protocol::{InputTranscription, SessionConfig, TurnDetection};
use crate::provider::{self, ProviderHandle, ProviderSettings, ProviderUpdate};
use crate::record::{CallLogger, CallOutcome, RecordSink, Ticket};
use crate::state::{ActivePhase, CallState, GuardFlags, StateMachine, Trigger};
use crate::switch::events::SwitchEvent;
use crate::switch::media::MediaRouter;
use crate::switch::SwitchControl;
use crate::tools::{ToolContext, ToolRegistry};
use crate::transfer::{Announcer, TransferOrchestrator, TransferOutcome, TransferRequest};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Immutable facts about one active call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Call id — the switch channel UUID of the A-leg, reused everywhere
    /// (media routing, record idempotency key).
    pub call_id: Uuid,
    pub tenant_id: String,
    pub caller_number: String,
    pub caller_name: String,
    pub dialed_number: String,
}

/// Server-level knobs shared by all sessions.
#[derive(Clone)]
pub struct SessionDeps {
    pub switch: Arc<dyn SwitchControl>,
    pub media_router: Arc<MediaRouter>,
    pub registry: Arc<SessionRegistry>,
    pub provider_settings: ProviderSettings,
    /// ws:// base URL the switch streams media to.
    pub media_url: String,
    pub heartbeat: HeartbeatConfig,
}

pub struct Session {
    pub context: CallContext,
    bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    logger: Arc<CallLogger>,
    pacer: Arc<PlaybackPacer>,
    heartbeat: Heartbeat,
    tenant: Arc<TenantConfig>,
    deps: SessionDeps,
    provider: Mutex<Option<ProviderHandle>>,
    registry_tools: Arc<ToolRegistry>,
    sink: Option<Arc<RecordSink>>,
    /// User turns so far (for the max-turn budget).
    turns: AtomicU32,
    /// A transfer orchestrator is live. The state machine guard is the
    /// authority; this is bookkeeping for teardown.
    transferring: AtomicBool,
    /// B-leg channel aliased into the registry while a transfer is live,
    /// so the attendant's hangup reaches this session's bus.
    b_leg_alias: Mutex<Option<Uuid>>,
    torn_down: AtomicBool,
    run_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    /// Build and start a session for an accepted ingress call. Everything
    /// is wired and running when this returns.
    pub fn spawn(
        context: CallContext,
        tenant: Arc<TenantConfig>,
        deps: SessionDeps,
        switch_events: mpsc::UnboundedReceiver<SwitchEvent>,
    ) -> Arc<Self> {
        let call_id = context.call_id;
        let bus = Arc::new(EventBus::new(call_id));
        let machine = Arc::new(StateMachine::new(bus.clone()));
        let logger = CallLogger::new(
            call_id,
            &tenant.tenant_id,
            &tenant.secretary.secretary_id,
            &context.caller_number,
            &context.caller_name,
        );
        logger.attach(&bus);

        // Media endpoints for the A-leg.
        let (ingress_tx, ingress_rx) = mpsc::channel::<Vec<i16>>(64);
        let (egress_tx, egress_rx) = mpsc::channel::<Vec<i16>>(64);
        deps.media_router.register(call_id, ingress_tx, egress_rx);

        let pacer = Arc::new(PlaybackPacer::new(bus.clone(), egress_tx));
        let heartbeat = Heartbeat::spawn(bus.clone(), machine.clone(), deps.heartbeat.clone());
        let registry_tools = Arc::new(ToolRegistry::for_tenant(&tenant, logger.clone()));
        let sink = tenant.record_sink_url.as_deref().map(|url| Arc::new(RecordSink::new(url)));

        let session = Arc::new(Self {
            context,
            bus: bus.clone(),
            machine: machine.clone(),
            logger,
            pacer,
            heartbeat,
            tenant,
            deps,
            provider: Mutex::new(None),
            registry_tools,
            sink,
            turns: AtomicU32::new(0),
            transferring: AtomicBool::new(false),
            b_leg_alias: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            run_task: Mutex::new(None),
        });

        session.deps.registry.register(call_id, &session);

        machine.apply(Trigger::StartCall);
        bus.emit(
            EventKind::CallStarted,
            serde_json::json!({
                "caller": session.context.caller_number,
                "dialed": session.context.dialed_number,
            }),
            "session",
        );

        // Provider session for the conversation.
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let reconnect_machine = machine.clone();
        let provider_handle = provider::session::spawn(
            session.deps.provider_settings.clone(),
            session.conversation_config(),
            bus.clone(),
            update_tx,
            Arc::new(move || {
                // Reconnect only mid-conversation; during a transfer or
                // after bridging, tear down instead.
                let state = reconnect_machine.state();
                state.is_active() || state == CallState::Connecting || state == CallState::OnHold
            }),
        );
        session.provider.lock().replace(provider_handle);

        // Pacer finishing a response is the authoritative "AI stopped
        // speaking" signal.
        {
            let machine = machine.clone();
            bus.subscribe(EventKind::AiSpeakingDone, move |_| {
                if machine.state() == CallState::Active(ActivePhase::Speaking) {
                    machine.apply(Trigger::AiStopsSpeaking);
                }
            });
        }
        // end_call tool (or any component) asking for a wind-down.
        {
            let weak = Arc::downgrade(&session);
            bus.subscribe(EventKind::CallEnding, move |event| {
                if let Some(session) = weak.upgrade() {
                    if event.str_field("initiated_by") == Some("tool") {
                        // The goodbye still has to play out; run loop ends
                        // the call when the pacer drains.
                        session.machine.apply(Trigger::EndCall);
                    }
                }
            });
        }
        // While a transfer is live, the attendant leg's channel events
        // must reach this session (the B-leg has no session of its own):
        // alias it in the registry from answer until the transfer settles.
        {
            let weak = Arc::downgrade(&session);
            bus.subscribe(EventKind::TransferAnswered, move |event| {
                let Some(session) = weak.upgrade() else { return };
                let Some(b_leg) =
                    event.str_field("b_leg").and_then(|s| Uuid::parse_str(s).ok())
                else {
                    return;
                };
                session.deps.registry.register(b_leg, &session);
                session.b_leg_alias.lock().replace(b_leg);
            });
            for kind in [
                EventKind::TransferCompleted,
                EventKind::TransferRejected,
                EventKind::TransferTimeout,
                EventKind::TransferFailed,
                EventKind::TransferCancelled,
            ] {
                let weak = Arc::downgrade(&session);
                bus.subscribe(kind, move |_| {
                    if let Some(session) = weak.upgrade() {
                        if let Some(b_leg) = session.b_leg_alias.lock().take() {
                            session.deps.registry.unregister(&b_leg);
                        }
                    }
                });
            }
        }

        let run_session = session.clone();
        let task = tokio::spawn(run_session.run(update_rx, switch_events, ingress_rx));
        session.run_task.lock().replace(task);

        info!(
            "📞 session {} up for tenant {} (caller {})",
            short_id(&call_id),
            session.tenant.tenant_id,
            session.context.caller_number
        );
        session
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Publish a normalized switch event onto this session's bus. Routing
    /// entry point for the shared control connection.
    pub fn publish_switch_event(&self, event: SwitchEvent) {
        let mut data = event.data.clone();
        data["channel_uuid"] = serde_json::Value::String(event.channel_uuid.to_string());
        self.bus.publish(VoiceEvent::new(event.kind, self.context.call_id, data, "switch"));
    }

    fn conversation_config(&self) -> SessionConfig {
        let secretary = &self.tenant.secretary;
        let mut instructions = secretary.instructions.clone();
        if !secretary.handoff_keywords.is_empty() {
            instructions.push_str(&format!(
                "\nIf the caller mentions any of these, offer a handoff to a person: {}.",
                secretary.handoff_keywords.join(", ")
            ));
        }
        SessionConfig {
            instructions,
            voice: secretary.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_sample_rate: PROVIDER_SAMPLE_RATE,
            output_sample_rate: PROVIDER_SAMPLE_RATE,
            turn_detection: TurnDetection::from_vad(&secretary.vad),
            input_audio_transcription: Some(InputTranscription { model: "whisper-1".to_string() }),
            tools: self.registry_tools.definitions(),
        }
    }

    /// The session's event loop: provider updates, switch events and
    /// inbound media, serialized in one task.
    async fn run(
        self: Arc<Self>,
        mut provider_rx: mpsc::UnboundedReceiver<ProviderUpdate>,
        mut switch_rx: mpsc::UnboundedReceiver<SwitchEvent>,
        mut ingress_rx: mpsc::Receiver<Vec<i16>>,
    ) {
        let call = short_id(&self.context.call_id);

        // Audio pipeline state lives with the loop — nothing else touches it.
        let mut to_provider = match FrameResampler::new(SWITCH_SAMPLE_RATE, PROVIDER_SAMPLE_RATE) {
            Ok(r) => r,
            Err(e) => {
                warn!("call {call}: resampler init failed: {e}");
                self.fail_call("resampler").await;
                return;
            }
        };
        let mut to_switch = match FrameResampler::new(PROVIDER_SAMPLE_RATE, SWITCH_SAMPLE_RATE) {
            Ok(r) => r,
            Err(e) => {
                warn!("call {call}: resampler init failed: {e}");
                self.fail_call("resampler").await;
                return;
            }
        };
        let mut aec = EchoCanceller::new(None, to_switch.output_delay_ms());
        let mut ingress_frames: u64 = 0;

        loop {
            tokio::select! {
                update = provider_rx.recv() => {
                    match update {
                        Some(update) => {
                            if self.handle_provider_update(update, &mut to_switch, &mut aec).await {
                                break;
                            }
                        }
                        None => {
                            debug!("call {call}: provider channel closed");
                            break;
                        }
                    }
                }

                event = switch_rx.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_switch_event(event).await {
                                break;
                            }
                        }
                        None => {
                            // Event socket gone — the channel is dead.
                            info!("call {call}: switch event stream closed");
                            break;
                        }
                    }
                }

                frame = ingress_rx.recv() => {
                    match frame {
                        Some(samples) => {
                            self.handle_ingress_audio(samples, &mut to_provider, &mut aec, &mut ingress_frames);
                        }
                        None => {
                            info!("call {call}: media stream closed");
                            break;
                        }
                    }
                }

                // Wind-down check needs to run even when no event arrives
                // (e.g. the goodbye just finished draining).
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }

            // Tool-initiated endings give the goodbye a short window to
            // arrive and play out before the channel is released.
            if self.machine.state() == CallState::Ending
                && !self.pacer.is_speaking()
                && self.machine.entered_at().elapsed() >= std::time::Duration::from_secs(2)
            {
                break;
            }
        }

        self.teardown().await;
    }

    /// Inbound caller audio: AEC → resample → provider. Suspended while
    /// transferring/bridged (the conference owns the caller then).
    fn handle_ingress_audio(
        &self,
        samples: Vec<i16>,
        to_provider: &mut FrameResampler,
        aec: &mut EchoCanceller,
        frames: &mut u64,
    ) {
        self.heartbeat.touch_inbound_audio();
        self.logger.bump_metric("audio_chunks_in", 1);
        *frames += 1;
        // A once-a-second liveness event, not one per frame.
        if *frames % 50 == 1 {
            self.bus.emit(
                EventKind::UserAudioReceived,
                serde_json::json!({ "frames": *frames }),
                "session",
            );
        }

        let state = self.machine.state();
        if !(state.is_active() || state == CallState::Connecting) {
            return;
        }

        let cleaned = aec.cancel(&samples);
        if let Some(provider) = self.provider.lock().as_ref() {
            for frame in to_provider.process(&cleaned) {
                provider.append_audio(&frame);
            }
        }
    }

    /// Returns true when the loop should exit.
    async fn handle_provider_update(
        self: &Arc<Self>,
        update: ProviderUpdate,
        to_switch: &mut FrameResampler,
        aec: &mut EchoCanceller,
    ) -> bool {
        let call = short_id(&self.context.call_id);
        self.heartbeat.touch_provider();

        match update {
            ProviderUpdate::Ready => {
                if self.machine.state() == CallState::Connecting {
                    self.machine.apply(Trigger::CallConnected);
                    self.bus.emit(EventKind::CallConnected, serde_json::json!({}), "session");
                    // Kick off the greeting.
                    if let Some(provider) = self.provider.lock().as_ref() {
                        provider.create_response(Some(format!(
                            "Greet the caller with exactly: \"{}\"",
                            self.tenant.secretary.greeting
                        )));
                        self.heartbeat.set_expecting_response(true);
                    }
                }
            }
            ProviderUpdate::AudioDelta(samples) => {
                self.heartbeat.set_expecting_response(false);
                self.heartbeat.touch_outbound_audio();
                if self.machine.state() == CallState::Active(ActivePhase::Processing)
                    || self.machine.state() == CallState::Active(ActivePhase::Listening)
                {
                    self.machine.apply(Trigger::AiStartsSpeaking);
                    self.bus.emit(EventKind::AiSpeakingStarted, serde_json::json!({}), "session");
                }
                for frame in to_switch.process(&samples) {
                    aec.push_reference(&frame);
                    self.pacer.push_frame(frame);
                }
            }
            ProviderUpdate::AudioDone => {
                self.pacer.mark_complete();
            }
            ProviderUpdate::SpeechStarted => {
                if self.machine.state() == CallState::Active(ActivePhase::Speaking) {
                    // Barge-in: cancel the response, drain within one
                    // frame, and go back to listening.
                    info!("call {call}: barge-in");
                    self.logger.bump_metric("barge_ins", 1);
                    if let Some(provider) = self.provider.lock().as_ref() {
                        provider.cancel_response();
                    }
                    self.pacer.drain();
                    aec.clear_reference();
                }
                self.machine.apply(Trigger::UserStartsSpeaking);
            }
            ProviderUpdate::SpeechStopped => {
                self.machine.apply(Trigger::UserStopsSpeaking);
                self.heartbeat.set_expecting_response(true);
                let turns = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
                let budget = self.tenant.secretary.max_turns;
                if budget > 0 && turns == budget {
                    info!("call {call}: max-turn budget ({budget}) reached, wrapping up");
                    if let Some(provider) = self.provider.lock().as_ref() {
                        provider.create_response(Some(
                            "Politely wrap up: summarize, say goodbye, then call end_call."
                                .to_string(),
                        ));
                    }
                }
            }
            ProviderUpdate::UserTranscript(text) => {
                debug!("call {call}: caller said: {text}");
            }
            ProviderUpdate::ResponseDone => {
                self.heartbeat.set_expecting_response(false);
            }
            ProviderUpdate::ToolCall { call_id, name, arguments } => {
                self.dispatch_tool(&call_id, &name, arguments).await;
            }
            ProviderUpdate::Closed { reason } => {
                return self.handle_provider_closed(reason).await;
            }
        }
        false
    }

    async fn handle_provider_closed(&self, reason: ProviderError) -> bool {
        let call = short_id(&self.context.call_id);
        let state = self.machine.state();
        match reason {
            // After a successful handoff the provider is supposed to go.
            _ if state == CallState::Bridged => false,
            ProviderError::SessionCapReached => {
                info!("call {call}: provider session cap — ending call");
                self.speak_switch_fallback().await;
                self.machine.apply(Trigger::EndCall);
                true
            }
            ProviderError::ConfigRejected(message) => {
                warn!("call {call}: provider rejected configuration: {message}");
                self.logger.set_outcome(CallOutcome::Error);
                self.speak_switch_fallback().await;
                self.machine.apply(Trigger::EndCall);
                true
            }
            reason => {
                warn!("call {call}: provider gone ({reason}) — ending call");
                self.logger.set_outcome(CallOutcome::Error);
                self.speak_switch_fallback().await;
                self.machine.apply(Trigger::EndCall);
                true
            }
        }
    }

    /// Returns true when the loop should exit.
    async fn handle_switch_event(&self, event: SwitchEvent) -> bool {
        let is_own_channel = event.channel_uuid == self.context.call_id;
        match event.kind {
            EventKind::CallEnded if is_own_channel => {
                info!("call {}: caller hung up", short_id(&self.context.call_id));
                self.publish_switch_event(event);
                // If a transfer is mid-flight its orchestrator sees the
                // published event and unwinds; we still stop the loop.
                // Teardown walks ending → ended.
                self.machine.apply(Trigger::EndCall);
                true
            }
            EventKind::CallConnected => {
                // The switch answered before the provider was ready; the
                // provider Ready handler drives the actual transition.
                self.publish_switch_event(event);
                false
            }
            EventKind::UserDtmf => {
                // Digits are surfaced to the model, never short-circuited.
                if let Some(digit) = event.data.get("digit").and_then(|v| v.as_str()) {
                    if let Some(provider) = self.provider.lock().as_ref() {
                        provider.send_user_text(&format!("[caller pressed {digit} on the keypad]"));
                    }
                }
                self.publish_switch_event(event);
                false
            }
            _ => {
                self.publish_switch_event(event);
                false
            }
        }
    }

    async fn dispatch_tool(self: &Arc<Self>, provider_call_id: &str, name: &str, arguments: serde_json::Value) {
        let ctx = ToolContext {
            call_id: self.context.call_id,
            tenant: self.tenant.clone(),
            bus: self.bus.clone(),
            switch: self.deps.switch.clone(),
            state: self.machine.state(),
            channel_uuid: self.context.call_id.to_string(),
            caller_id: self.context.caller_number.clone(),
            sink: self.sink.clone(),
        };
        let outcome = self.registry_tools.dispatch(&ctx, name, arguments).await;
        if let Some(provider) = self.provider.lock().as_ref() {
            provider.send_tool_output(provider_call_id, &outcome.to_output());
        }

        // A successful handoff request spins up the orchestrator.
        if name == "request_handoff" && outcome.success {
            let requested = outcome
                .data
                .get("destination")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            self.start_transfer(&requested);
        }
    }

    /// Kick off the announced transfer on its own task — the run loop
    /// keeps draining switch events (the orchestrator depends on seeing a
    /// caller hangup through the bus).
    fn start_transfer(self: &Arc<Self>, destination_name: &str) {
        let call = short_id(&self.context.call_id);
        if self.transferring.swap(true, Ordering::SeqCst) {
            warn!("call {call}: transfer already in progress, ignoring");
            return;
        }
        let Some(destination) = self.tenant.resolve_destination(destination_name).cloned() else {
            self.transferring.store(false, Ordering::SeqCst);
            return;
        };

        self.machine.set_guards(GuardFlags {
            destination_present: true,
            caller_identified: !self.context.caller_number.is_empty(),
        });
        if !self.machine.apply(Trigger::RequestTransfer).applied() {
            self.transferring.store(false, Ordering::SeqCst);
            return;
        }

        let reason = self
            .bus
            .history(Some(EventKind::TransferRequested), 1)
            .first()
            .and_then(|e| e.str_field("reason").map(str::to_string))
            .unwrap_or_default();

        let announcer: Arc<dyn Announcer> = Arc::new(crate::transfer::announce::ProviderAnnouncer::new(
            self.context.call_id,
            self.deps.provider_settings.clone(),
            self.deps.media_router.clone(),
            self.deps.switch.clone(),
            &self.deps.media_url,
            self.bus.clone(),
            self.machine.clone(),
            self.tenant.clone(),
            self.logger.clone(),
        ));
        let orchestrator = TransferOrchestrator::new(
            self.context.call_id,
            self.context.call_id,
            &self.context.caller_number,
            &self.context.caller_name,
            self.bus.clone(),
            self.machine.clone(),
            self.deps.switch.clone(),
            self.tenant.clone(),
            announcer,
        );

        let session = self.clone();
        tokio::spawn(async move {
            let outcome = orchestrator.run(TransferRequest { destination, reason }).await;
            session.finish_transfer(outcome).await;
        });
    }

    async fn finish_transfer(&self, outcome: TransferOutcome) {
        let call = short_id(&self.context.call_id);
        self.transferring.store(false, Ordering::SeqCst);
        self.logger.bump_metric("transfer_attempts", 1);

        match outcome {
            TransferOutcome::Bridged => {
                // The humans are talking; the AI leaves quietly. Dropping
                // the handle closes the provider session gracefully.
                info!("call {call}: handoff complete, releasing provider session");
                self.provider.lock().take();
                self.pacer.stop();
            }
            TransferOutcome::ReturnedToAgent { speak, offer_ticket } => {
                if let Some(provider) = self.provider.lock().as_ref() {
                    let mut instruction = speak;
                    if offer_ticket {
                        instruction.push_str(
                            " If the caller says yes, call create_ticket with a short summary.",
                        );
                    }
                    provider.create_response(Some(instruction));
                }
            }
            TransferOutcome::SentToVoicemail => {
                self.provider.lock().take();
                self.machine.apply(Trigger::EndCall);
            }
            TransferOutcome::Aborted => {
                if self.machine.state() != CallState::Ended {
                    self.machine.apply(Trigger::EndCall);
                }
            }
        }
    }

    /// Abort path before the provider ever worked.
    async fn fail_call(&self, why: &str) {
        warn!("call {}: failing ({why})", short_id(&self.context.call_id));
        self.logger.set_outcome(CallOutcome::Error);
        self.speak_switch_fallback().await;
        self.machine.apply(Trigger::ForceEnd);
        self.teardown().await;
    }

    /// The provider can't speak for us when it's the thing that failed:
    /// play the switch's canned apology on the channel instead.
    async fn speak_switch_fallback(&self) {
        let _ = self
            .deps
            .switch
            .execute_on_uuid(
                &self.context.call_id.to_string(),
                "playback",
                "ivr/ivr-call_cannot_be_completed.wav",
            )
            .await;
    }

    /// Idempotent teardown: stop audio, drop the provider, release
    /// registrations, stamp and flush the record, hang up if needed.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let call = short_id(&self.context.call_id);
        let state = self.machine.state();

        if state != CallState::Ended {
            if state != CallState::Ending {
                self.machine.apply(Trigger::EndCall);
            }
            self.machine.apply(Trigger::CallEnded);
        }
        self.bus.emit(EventKind::CallEnded, serde_json::json!({ "external": false }), "session");

        self.pacer.stop();
        self.heartbeat.stop();
        self.provider.lock().take();

        let uuid = self.context.call_id.to_string();
        let _ = self.deps.switch.stop_media_stream(&uuid).await;
        // Bridged calls stay up without us; anything else gets hung up.
        if state != CallState::Bridged {
            let _ = self.deps.switch.hangup(&uuid, "NORMAL_CLEARING").await;
        }

        self.deps.media_router.unregister(&self.context.call_id);
        self.deps.registry.unregister(&self.context.call_id);
        if let Some(b_leg) = self.b_leg_alias.lock().take() {
            self.deps.registry.unregister(&b_leg);
        }

        self.logger.mark_ended(self.machine.state().name());
        if let Some(record) = self.logger.take_for_flush() {
            let outcome_is_error = record.outcome == CallOutcome::Error;
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.flush(&record).await {
                    warn!("call {call}: record flush failed: {e}");
                }
                if outcome_is_error && self.tenant.ticket_on_error {
                    let ticket = Ticket::new(
                        self.context.call_id,
                        &self.tenant.tenant_id,
                        &self.context.caller_number,
                        "call_error",
                        "Call aborted on an error path; follow up with the caller.",
                    );
                    if let Err(e) = sink.create_ticket(&ticket).await {
                        warn!("call {call}: error ticket failed: {e}");
                    }
                }
            }
        }
        info!("📴 session {call} torn down ({})", self.machine.state());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
    }
}
