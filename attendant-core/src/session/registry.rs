//! Process-wide session registry.
//!
//! Maps channel UUID → `Weak<Session>` so control-channel events from the
//! switch can be correlated to their session without keeping a dead
//! session alive. Registration happens at session creation,
//! deregistration at teardown; lookups tolerate late registration with a
//! bounded retry, mirroring the media router.

use super::Session;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const LOOKUP_RETRIES: u32 = 5;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Weak<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, channel_uuid: Uuid, session: &Arc<Session>) {
        self.sessions.insert(channel_uuid, Arc::downgrade(session));
    }

    pub fn unregister(&self, channel_uuid: &Uuid) {
        self.sessions.remove(channel_uuid);
    }

    /// Upgrade-or-forget: a dead weak entry is pruned on touch.
    pub fn get(&self, channel_uuid: &Uuid) -> Option<Arc<Session>> {
        let found = self.sessions.get(channel_uuid)?.upgrade();
        if found.is_none() {
            debug!("pruning dead session entry {channel_uuid}");
            self.sessions.remove(channel_uuid);
        }
        found
    }

    pub async fn get_with_retry(&self, channel_uuid: &Uuid) -> Option<Arc<Session>> {
        for attempt in 0..=LOOKUP_RETRIES {
            if let Some(session) = self.get(channel_uuid) {
                return Some(session);
            }
            if attempt < LOOKUP_RETRIES {
                tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            }
        }
        None
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.value().strong_count() > 0).count()
    }

    /// Snapshot of every live session, for graceful shutdown.
    pub fn drain_live(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().filter_map(|e| e.value().upgrade()).collect()
    }
}
