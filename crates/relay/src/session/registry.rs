// Process-wide session registry: creation, lookup, idle eviction.

use std::collections::{hash_map::Entry, HashMap};
use std::sync::Arc;
use std::time::Duration;

use mapplan_common::types::SessionId;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::Session;

/// Attempts at drawing a fresh id before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("could not allocate a unique session id")]
    ResourceExhausted,
}

/// Maps session ids to live sessions.
///
/// Constructed once at startup and passed explicitly to everything that
/// needs it. Only create/get/evict touch the map itself; per-session state
/// is guarded by each session's own lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty session bound to `map_id` under a fresh UUID.
    pub async fn create(&self, map_id: &str) -> Result<Arc<Session>, RegistryError> {
        self.create_with_ids(map_id, || Uuid::new_v4().to_string()).await
    }

    pub(crate) async fn create_with_ids<F>(
        &self,
        map_id: &str,
        mut next_id: F,
    ) -> Result<Arc<Session>, RegistryError>
    where
        F: FnMut() -> String,
    {
        let mut sessions = self.sessions.write().await;
        for _ in 0..MAX_ID_ATTEMPTS {
            if let Entry::Vacant(vacant) = sessions.entry(next_id()) {
                let session = Arc::new(Session::new(vacant.key().clone(), map_id, Instant::now()));
                vacant.insert(Arc::clone(&session));
                info!(session_id = %session.id(), map_id = %map_id, "session created");
                return Ok(session);
            }
        }

        Err(RegistryError::ResourceExhausted)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, RegistryError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))
    }

    /// Drop every session that has had zero peers for at least `grace`.
    ///
    /// Sessions with at least one peer are never evicted. Evicted sessions
    /// are flagged so a connection holding a stale handle cannot join them.
    /// Session locks are taken outside the map lock, so lookups and creates
    /// are not held up by a busy session during the sweep.
    pub async fn evict_idle(&self, now: Instant, grace: Duration) -> Vec<SessionId> {
        let candidates: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();

        let mut evicted = Vec::new();
        for session in candidates {
            let mut state = session.lock().await;
            if state.idle_for(now, grace) {
                state.mark_evicted();
                evicted.push(Arc::clone(&session));
            }
        }

        if evicted.is_empty() {
            return Vec::new();
        }

        let mut sessions = self.sessions.write().await;
        evicted
            .into_iter()
            .map(|session| {
                if sessions.get(session.id()).is_some_and(|live| Arc::ptr_eq(live, &session)) {
                    sessions.remove(session.id());
                }
                info!(session_id = %session.id(), "idle session evicted");
                session.id().to_string()
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop all sessions. Used at shutdown.
    pub async fn clear(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let dropped = sessions.len();
        for session in sessions.values() {
            session.lock().await.mark_evicted();
        }
        sessions.clear();
        dropped
    }
}

/// Run [`SessionRegistry::evict_idle`] every `period` until the task is aborted.
pub fn spawn_eviction_loop(
    registry: Arc<SessionRegistry>,
    period: Duration,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.reset(); // skip immediate first tick
        loop {
            ticker.tick().await;
            let evicted = registry.evict_idle(Instant::now(), grace).await;
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "eviction sweep finished");
            }
        }
    })
}
