//! Side provider session for transfer announcements.
//!
//! When the attendant answers, a second, restricted provider session is
//! bound to the B-leg: it speaks the announcement, hears the attendant,
//! and exposes exactly two tools — `accept_transfer` and
//! `reject_transfer`. The decision tools publish onto the *main* call
//! bus, where the orchestrator is waiting; everything else about this
//! session (pacer events, audio plumbing) lives on a private side bus so
//! the main session never sees it.

use crate::audio::pacer::PlaybackPacer;
use crate::audio::resampler::FrameResampler;
use crate::audio_constants::{PROVIDER_SAMPLE_RATE, SWITCH_SAMPLE_RATE};
use crate::bus::EventBus;
use crate::config::{TenantConfig, VadConfig};
use crate::error::TransferError;
use crate::provider::protocol::{InputTranscription, SessionConfig, TurnDetection};
use crate::provider::{self, ProviderSettings, ProviderUpdate};
use crate::record::CallLogger;
use crate::state::StateMachine;
use crate::switch::media::MediaRouter;
use crate::switch::SwitchControl;
use crate::tools::{ToolContext, ToolRegistry};
use crate::transfer::Announcer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Give the model this long to get the announcement out before we treat
/// the side session as broken.
const ANNOUNCE_DEADLINE: Duration = Duration::from_secs(10);

struct ActiveSide {
    driver: tokio::task::JoinHandle<()>,
    pacer: Arc<PlaybackPacer>,
}

pub struct ProviderAnnouncer {
    call_id: Uuid,
    settings: ProviderSettings,
    router: Arc<MediaRouter>,
    switch: Arc<dyn SwitchControl>,
    /// ws:// base the switch should stream the B-leg's audio to.
    media_url: String,
    main_bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    tenant: Arc<TenantConfig>,
    logger: Arc<CallLogger>,
    active: Mutex<Option<ActiveSide>>,
}

impl ProviderAnnouncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: Uuid,
        settings: ProviderSettings,
        router: Arc<MediaRouter>,
        switch: Arc<dyn SwitchControl>,
        media_url: &str,
        main_bus: Arc<EventBus>,
        machine: Arc<StateMachine>,
        tenant: Arc<TenantConfig>,
        logger: Arc<CallLogger>,
    ) -> Self {
        Self {
            call_id,
            settings,
            router,
            switch,
            media_url: media_url.to_string(),
            main_bus,
            machine,
            tenant,
            logger,
            active: Mutex::new(None),
        }
    }

    fn side_session_config(&self, announcement: &str, registry: &ToolRegistry) -> SessionConfig {
        SessionConfig {
            instructions: format!(
                "You are announcing an incoming call transfer to a staff member. \
                 First say exactly this: \"{announcement}\" Then listen. When they agree to take \
                 the call, call accept_transfer. If they decline, can't talk, or ask you to take \
                 a message instead, call reject_transfer with their reason. Do not chat beyond \
                 clarifying the announcement."
            ),
            voice: self.tenant.secretary.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_sample_rate: PROVIDER_SAMPLE_RATE,
            output_sample_rate: PROVIDER_SAMPLE_RATE,
            turn_detection: TurnDetection::from_vad(&VadConfig::default()),
            input_audio_transcription: Some(InputTranscription { model: "whisper-1".to_string() }),
            tools: registry.definitions(),
        }
    }
}

#[async_trait]
impl Announcer for ProviderAnnouncer {
    async fn announce(&self, b_leg: Uuid, text: &str) -> Result<(), TransferError> {
        let registry = Arc::new(ToolRegistry::transfer_decision_only(self.logger.clone()));
        let session_config = self.side_session_config(text, &registry);

        // Private bus for side-leg plumbing; decisions go to main_bus via
        // the tool context below.
        let side_bus = Arc::new(EventBus::new(self.call_id));

        // Media endpoints for the B-leg, registered before the switch is
        // told to stream so the router lookup can't miss.
        let (ingress_tx, mut ingress_rx) = mpsc::channel::<Vec<i16>>(64);
        let (egress_tx, egress_rx) = mpsc::channel::<Vec<i16>>(64);
        self.router.register(b_leg, ingress_tx, egress_rx);

        let pacer = Arc::new(PlaybackPacer::new(side_bus.clone(), egress_tx));

        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let handle = provider::session::spawn(
            self.settings.clone(),
            session_config,
            side_bus.clone(),
            update_tx,
            // The side session never reconnects — any drop fails the
            // announcement and the orchestrator unwinds.
            Arc::new(|| false),
        );

        if let Err(e) = self
            .switch
            .start_media_stream(&b_leg.to_string(), &format!("{}/{}", self.media_url, b_leg))
            .await
        {
            self.router.unregister(&b_leg);
            return Err(TransferError::from(e));
        }

        let (announced_tx, announced_rx) = oneshot::channel::<()>();
        let driver = {
            let pacer = pacer.clone();
            let handle = handle.clone();
            let main_bus = self.main_bus.clone();
            let machine = self.machine.clone();
            let tenant = self.tenant.clone();
            let switch = self.switch.clone();
            let call_id = self.call_id;
            let b_leg_str = b_leg.to_string();

            tokio::spawn(async move {
                let mut announced_tx = Some(announced_tx);
                let mut up = match FrameResampler::new(SWITCH_SAMPLE_RATE, PROVIDER_SAMPLE_RATE) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("side session resampler: {e}");
                        return;
                    }
                };
                let mut down = match FrameResampler::new(PROVIDER_SAMPLE_RATE, SWITCH_SAMPLE_RATE) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("side session resampler: {e}");
                        return;
                    }
                };

                loop {
                    tokio::select! {
                        update = update_rx.recv() => {
                            match update {
                                Some(ProviderUpdate::Ready) => {
                                    // Session live: speak the announcement.
                                    handle.create_response(None);
                                }
                                Some(ProviderUpdate::AudioDelta(samples)) => {
                                    for frame in down.process(&samples) {
                                        pacer.push_frame(frame);
                                    }
                                }
                                Some(ProviderUpdate::AudioDone) => {
                                    pacer.mark_complete();
                                    if let Some(tx) = announced_tx.take() {
                                        let _ = tx.send(());
                                    }
                                }
                                Some(ProviderUpdate::ToolCall { call_id: tool_call_id, name, arguments }) => {
                                    let ctx = ToolContext {
                                        call_id,
                                        tenant: tenant.clone(),
                                        bus: main_bus.clone(),
                                        switch: switch.clone(),
                                        state: machine.state(),
                                        channel_uuid: b_leg_str.clone(),
                                        caller_id: String::new(),
                                        sink: None,
                                    };
                                    let outcome = registry.dispatch(&ctx, &name, arguments).await;
                                    handle.send_tool_output(&tool_call_id, &outcome.to_output());
                                }
                                Some(ProviderUpdate::Closed { reason }) => {
                                    debug!("side session closed: {reason}");
                                    break;
                                }
                                Some(_) => {}
                                None => break,
                            }
                        }
                        frame = ingress_rx.recv() => {
                            match frame {
                                Some(samples) => {
                                    for frame in up.process(&samples) {
                                        handle.append_audio(&frame);
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
            })
        };

        self.active.lock().replace(ActiveSide { driver, pacer });

        // Wait until the announcement has been spoken (first audio done).
        match tokio::time::timeout(ANNOUNCE_DEADLINE, announced_rx).await {
            Ok(Ok(())) => {
                info!("announcement delivered to B-leg {b_leg}");
                Ok(())
            }
            _ => {
                warn!("announcement to {b_leg} did not complete in time");
                self.teardown(b_leg).await;
                Err(TransferError::DialFailed("announcement failed".into()))
            }
        }
    }

    async fn teardown(&self, b_leg: Uuid) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.pacer.stop();
            active.driver.abort();
        }
        let _ = self.switch.stop_media_stream(&b_leg.to_string()).await;
        self.router.unregister(&b_leg);
        debug!("side session for {b_leg} torn down");
    }
}
