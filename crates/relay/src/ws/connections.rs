// Per-session fan-out over a process-wide connection table.
//
// Sessions only hold opaque `ConnectionId`s. The outbound queue of each
// connection lives here, owned by the table entry; the socket task owns the
// receiving half and therefore the connection's lifetime.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use mapplan_common::protocol::ws::{FeatureEvent, ServerMessage};
use mapplan_common::types::SessionId;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionState};

/// Process-unique handle for one live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

pub type OutboundSender = mpsc::UnboundedSender<ServerMessage>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<ServerMessage>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("connection {0} already belongs to a session")]
    AlreadyJoined(ConnectionId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("connection {0} closed before it could join")]
    ConnectionClosed(ConnectionId),
}

#[derive(Debug)]
struct ConnectionEntry {
    session_id: SessionId,
    outbound: OutboundSender,
}

#[derive(Debug, Default)]
pub struct ConnectionManager {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Add `connection` to `session` and queue the snapshot as its first
    /// message. The snapshot is taken under the session lock, so the peer
    /// sees every later mutation exactly once, after the snapshot.
    ///
    /// `AlreadyJoined` guards current membership only. Once a connection has
    /// left it is forgotten; callers retire a connection id together with its
    /// socket and never join with it again.
    pub async fn join(
        &self,
        session: &Session,
        connection: ConnectionId,
        outbound: OutboundSender,
    ) -> Result<(), JoinError> {
        let mut state = session.lock().await;
        if state.is_evicted() {
            return Err(JoinError::SessionNotFound(session.id().to_string()));
        }

        {
            let mut connections = self.connections.write().await;
            if connections.contains_key(&connection) {
                return Err(JoinError::AlreadyJoined(connection));
            }

            let snapshot = FeatureEvent::Snapshot { features: state.features.snapshot() };
            if outbound.send(snapshot.into()).is_err() {
                debug!(connection_id = %connection, "connection closed before snapshot");
                return Err(JoinError::ConnectionClosed(connection));
            }

            connections
                .insert(connection, ConnectionEntry { session_id: session.id().to_string(), outbound });
        }

        state.add_peer(connection);
        info!(
            session_id = %session.id(),
            connection_id = %connection,
            peers = state.peer_count(),
            "peer joined"
        );
        Ok(())
    }

    /// Remove `connection` from `session`. Leaving twice is a no-op.
    pub async fn leave(&self, session: &Session, connection: ConnectionId) {
        let mut state = session.lock().await;
        self.leave_locked(session.id(), &mut state, connection).await;
    }

    pub(crate) async fn leave_locked(
        &self,
        session_id: &str,
        state: &mut SessionState,
        connection: ConnectionId,
    ) -> bool {
        let removed_peer = state.remove_peer(connection, Instant::now());

        let mut connections = self.connections.write().await;
        if connections.get(&connection).is_some_and(|entry| entry.session_id == session_id) {
            connections.remove(&connection);
        }

        if removed_peer {
            info!(
                session_id = %session_id,
                connection_id = %connection,
                peers = state.peer_count(),
                "peer left"
            );
        }
        removed_peer
    }

    /// Deliver `message` to every peer of `session` except `excluding`.
    pub async fn broadcast(
        &self,
        session: &Session,
        message: &ServerMessage,
        excluding: Option<ConnectionId>,
    ) -> usize {
        let mut state = session.lock().await;
        self.broadcast_locked(session.id(), &mut state, message, excluding).await
    }

    /// Broadcast with the session lock already held by the caller.
    ///
    /// A peer whose queue is closed is logged and removed as if it had left;
    /// delivery to the remaining peers continues. Returns the number of peers
    /// the message was queued for.
    pub(crate) async fn broadcast_locked(
        &self,
        session_id: &str,
        state: &mut SessionState,
        message: &ServerMessage,
        excluding: Option<ConnectionId>,
    ) -> usize {
        let mut delivered = 0;
        let mut unreachable = Vec::new();
        {
            let connections = self.connections.read().await;
            for peer in state.peers() {
                if Some(peer) == excluding {
                    continue;
                }
                let sent = connections
                    .get(&peer)
                    .is_some_and(|entry| entry.outbound.send(message.clone()).is_ok());
                if sent {
                    delivered += 1;
                } else {
                    unreachable.push(peer);
                }
            }
        }

        for peer in unreachable {
            warn!(
                session_id = %session_id,
                connection_id = %peer,
                "delivery failed, dropping peer"
            );
            self.leave_locked(session_id, state, peer).await;
        }

        delivered
    }

    /// Queue `message` for a single connection. Returns false when the
    /// connection is unknown or its socket is gone.
    pub async fn send_to(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        self.connections
            .read()
            .await
            .get(&connection)
            .is_some_and(|entry| entry.outbound.send(message).is_ok())
    }

    pub async fn session_of(&self, connection: ConnectionId) -> Option<SessionId> {
        self.connections.read().await.get(&connection).map(|entry| entry.session_id.clone())
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}
