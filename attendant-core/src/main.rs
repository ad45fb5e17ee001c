//! Attendant Server — AI virtual secretary runtime.
//!
//! Connects the pieces per process:
//! - one shared inbound control connection to the switch (commands out,
//!   global events in)
//! - an outbound event-socket listener the switch dials per call
//! - a media WebSocket server for per-leg audio
//! - a session registry mapping channel UUIDs to live sessions
//!
//! Per-call state lives in `attendant_core::session::Session`; nothing
//! here is per-call beyond spawning one.

use attendant_core::config::ConfigStore;
use attendant_core::heartbeat::HeartbeatConfig;
use attendant_core::provider::ProviderSettings;
use attendant_core::session::{CallContext, Session, SessionDeps, SessionRegistry};
use attendant_core::switch::esl::InboundClient;
use attendant_core::switch::media::{MediaRouter, MediaServer};
use attendant_core::switch::outbound::{IngressHandler, OutboundListener};
use attendant_core::switch::{events, EslAdapter, SwitchControl};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_dir = PathBuf::from(env_or("ATTENDANT_CONFIG_DIR", "tenants"));
    let switch_addr = env_or("SWITCH_CONTROL_ADDR", "127.0.0.1:8021");
    let switch_password = env_or("SWITCH_CONTROL_PASSWORD", "ClueCon");
    let event_socket_bind = env_or("EVENT_SOCKET_BIND", "0.0.0.0:8084");
    let media_bind = env_or(
        "MEDIA_BIND",
        &format!("0.0.0.0:{}", attendant_core::audio_constants::MEDIA_SERVER_PORT),
    );
    let media_url = env_or(
        "MEDIA_URL",
        &format!("ws://127.0.0.1:{}", attendant_core::audio_constants::MEDIA_SERVER_PORT),
    );
    let provider_url = env_or("PROVIDER_URL", "wss://api.openai.com/v1/realtime");
    let provider_api_key = std::env::var("PROVIDER_API_KEY").unwrap_or_default();
    if provider_api_key.is_empty() {
        warn!("PROVIDER_API_KEY is empty — provider sessions will be rejected");
    }

    info!("🦀 Attendant Server starting...");
    let config = Arc::new(ConfigStore::load_dir(&config_dir)?);
    info!("✅ loaded {} tenant(s) from {}", config.tenant_count(), config_dir.display());

    let registry = SessionRegistry::new();
    let media_router = MediaRouter::new();

    // Shared control connection: commands out, global channel events in.
    let (switch_event_tx, mut switch_event_rx) = tokio::sync::mpsc::unbounded_channel();
    let client = InboundClient::connect(&switch_addr, &switch_password, switch_event_tx).await?;
    let switch: Arc<dyn SwitchControl> = Arc::new(EslAdapter::new(client));
    info!("✅ switch control connected ({switch_addr})");

    // Route global events to their sessions. Lookup retries cover the
    // window where the switch fires events before the session registered.
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            while let Some(msg) = switch_event_rx.recv().await {
                let Some(body) = msg.body.as_deref() else { continue };
                let Some(event) = events::normalize(body) else { continue };
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Some(session) = registry.get_with_retry(&event.channel_uuid).await {
                        // A-leg events already arrive on the call's own
                        // outbound socket (myevents); the shared
                        // connection only routes foreign legs, i.e. the
                        // transfer B-leg aliased to this session.
                        if event.channel_uuid != session.context.call_id {
                            session.publish_switch_event(event);
                        }
                    }
                });
            }
            error!("❌ switch event stream ended");
        });
    }

    // Media server.
    {
        let server = MediaServer::new(media_router.clone());
        let bind = media_bind.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(&bind).await {
                error!("❌ media server: {e}");
            }
        });
    }

    let deps = SessionDeps {
        switch: switch.clone(),
        media_router: media_router.clone(),
        registry: registry.clone(),
        provider_settings: ProviderSettings::new(&provider_url, &provider_api_key),
        media_url: media_url.clone(),
        heartbeat: HeartbeatConfig::default(),
    };

    // Per-call ingress: resolve the tenant, spawn the session, attach the
    // media stream.
    let handler: IngressHandler = {
        let config = config.clone();
        let deps = deps.clone();
        Arc::new(move |ingress, switch_events| {
            let tenant = match config.by_number(&ingress.dialed_number) {
                Ok(tenant) => tenant,
                Err(e) => {
                    warn!("rejecting call {}: {e}", ingress.channel_uuid);
                    return false;
                }
            };
            let context = CallContext {
                call_id: ingress.channel_uuid,
                tenant_id: tenant.tenant_id.clone(),
                caller_number: ingress.caller_number.clone(),
                caller_name: ingress.caller_name.clone(),
                dialed_number: ingress.dialed_number.clone(),
            };
            let session = Session::spawn(context, tenant, deps.clone(), switch_events);

            // Tell the switch to stream this leg's audio to us.
            let switch = deps.switch.clone();
            let url = format!("{}/{}", deps.media_url, ingress.channel_uuid);
            let uuid = ingress.channel_uuid.to_string();
            tokio::spawn(async move {
                if let Err(e) = switch.start_media_stream(&uuid, &url).await {
                    warn!("media stream attach failed for {uuid}: {e}");
                    session.teardown().await;
                }
            });
            true
        })
    };

    {
        let listener = OutboundListener::new(handler);
        let bind = event_socket_bind.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run(&bind).await {
                error!("❌ outbound event socket: {e}");
            }
        });
    }

    info!("✅ Attendant Server fully started (events {event_socket_bind}, media {media_bind})");

    // Drain on SIGINT/SIGTERM: give live calls a bounded window to flush.
    tokio::signal::ctrl_c().await?;
    let live = registry.drain_live();
    info!("shutting down — draining {} live session(s)", live.len());
    let drain = async {
        for session in live {
            session.teardown().await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("drain deadline hit; exiting with sessions still open");
    }
    info!("👋 Attendant Server stopped");
    Ok(())
}
