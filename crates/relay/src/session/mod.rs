// Planning sessions: identity, owned feature set, and the set of joined peers.

pub mod feature_set;
pub mod registry;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mapplan_common::types::{SessionId, SessionInfo};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::ws::connections::ConnectionId;

pub use feature_set::{FeatureSet, FeatureSetError};
pub use registry::{spawn_eviction_loop, RegistryError, SessionRegistry};

/// One collaboration room bound to a single map.
///
/// Identity fields are fixed at construction and readable without locking.
/// Everything that changes lives in [`SessionState`] behind one mutex, so all
/// mutations and broadcasts for a session are serialized through it.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    map_id: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

#[derive(Debug)]
pub struct SessionState {
    pub features: FeatureSet,
    peers: BTreeSet<ConnectionId>,
    idle_since: Option<Instant>,
    evicted: bool,
}

impl Session {
    pub fn new(id: SessionId, map_id: impl Into<String>, now: Instant) -> Self {
        Self {
            id,
            map_id: map_id.into(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                features: FeatureSet::new(),
                peers: BTreeSet::new(),
                idle_since: Some(now),
                evicted: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub async fn info(&self) -> SessionInfo {
        let state = self.lock().await;
        SessionInfo {
            id: self.id.clone(),
            map: self.map_id.clone(),
            created_at: self.created_at,
            peers: state.peers.len(),
            features: state.features.len(),
        }
    }
}

impl SessionState {
    pub fn peers(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.peers.iter().copied()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, connection: ConnectionId) -> bool {
        self.peers.contains(&connection)
    }

    /// Returns false if the peer was already present.
    pub(crate) fn add_peer(&mut self, connection: ConnectionId) -> bool {
        self.idle_since = None;
        self.peers.insert(connection)
    }

    /// Returns false if the peer was not present. The session becomes idle
    /// at `now` when its last peer leaves.
    pub(crate) fn remove_peer(&mut self, connection: ConnectionId, now: Instant) -> bool {
        let removed = self.peers.remove(&connection);
        if removed && self.peers.is_empty() {
            self.idle_since = Some(now);
        }
        removed
    }

    /// True when the session has had no peers for at least `grace`.
    pub fn idle_for(&self, now: Instant, grace: Duration) -> bool {
        self.peers.is_empty()
            && self
                .idle_since
                .is_some_and(|since| now.saturating_duration_since(since) >= grace)
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub(crate) fn mark_evicted(&mut self) {
        self.evicted = true;
    }
}
