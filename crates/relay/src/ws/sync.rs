// Per-connection sync protocol: decode, apply to the session, fan out.

use std::sync::Arc;

use mapplan_common::protocol::ws::{
    decode_client_message, ClientMessage, ErrorFrame, ErrorKind, FeatureEvent, ServerMessage,
};
use mapplan_common::types::{Feature, FeatureId};
use thiserror::Error;
use tracing::{debug, warn};

use super::connections::{ConnectionId, ConnectionManager, JoinError, OutboundSender};
use crate::session::{FeatureSetError, Session, SessionRegistry, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("expected version {expected}, feature {} is at {}", .current.id, .current.version)]
    VersionConflict { expected: u64, current: Feature },

    #[error("feature {0} does not exist")]
    FeatureNotFound(FeatureId),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("feature id or version space exhausted")]
    ResourceExhausted,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::FeatureNotFound(_) => ErrorKind::FeatureNotFound,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::ResourceExhausted => ErrorKind::ResourceExhausted,
        }
    }

    pub fn to_frame(&self, request_id: Option<String>) -> ErrorFrame {
        let mut frame = ErrorFrame::new(self.kind(), self.to_string()).with_request_id(request_id);
        match self {
            Self::VersionConflict { current, .. } => {
                frame.feature_id = Some(current.id.clone());
                frame.current = Some(current.clone());
            }
            Self::FeatureNotFound(id) => frame.feature_id = Some(id.clone()),
            Self::ProtocolViolation(_) | Self::ResourceExhausted => {}
        }
        frame
    }
}

impl From<FeatureSetError> for SyncError {
    fn from(error: FeatureSetError) -> Self {
        match error {
            FeatureSetError::NotFound(id) => Self::FeatureNotFound(id),
            FeatureSetError::VersionConflict { expected, current } => {
                Self::VersionConflict { expected, current }
            }
            FeatureSetError::Exhausted => Self::ResourceExhausted,
        }
    }
}

/// What an accepted mutation produced: the broadcast for peers and the ack
/// for the sender.
struct Applied {
    broadcast: FeatureEvent,
    id: FeatureId,
    version: u64,
}

/// Drives one joined connection.
///
/// Each inbound message is applied and broadcast while the session lock is
/// held, so peers observe changes in exactly the order they were applied.
pub struct SyncProtocolHandler {
    session: Arc<Session>,
    connections: Arc<ConnectionManager>,
    connection: ConnectionId,
    state: ConnectionState,
}

impl SyncProtocolHandler {
    /// Look up `session_id` and join `connection` to it.
    pub async fn open(
        registry: &SessionRegistry,
        connections: Arc<ConnectionManager>,
        session_id: &str,
        connection: ConnectionId,
        outbound: OutboundSender,
    ) -> Result<Self, JoinError> {
        let session = registry
            .get(session_id)
            .await
            .map_err(|_| JoinError::SessionNotFound(session_id.to_string()))?;
        connections.join(&session, connection, outbound).await?;

        Ok(Self { session, connections, connection, state: ConnectionState::Connected })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle one raw inbound frame. A frame that does not decode closes the
    /// connection; every other failure is reported to the sender only.
    pub async fn handle_frame(&mut self, raw: &[u8]) -> ConnectionState {
        if self.state == ConnectionState::Closed {
            return ConnectionState::Closed;
        }

        match decode_client_message(raw) {
            Ok(message) => self.handle_message(message).await,
            Err(error) => {
                self.violation(SyncError::ProtocolViolation(error.to_string())).await;
                ConnectionState::Closed
            }
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> ConnectionState {
        if self.state == ConnectionState::Closed {
            return ConnectionState::Closed;
        }

        let request_id = message.request_id().map(ToOwned::to_owned);
        let mut state = self.session.lock().await;
        if !state.has_peer(self.connection) {
            // Dropped after a failed delivery; nothing to apply into.
            drop(state);
            self.state = ConnectionState::Closed;
            return self.state;
        }

        match apply(&mut state, message) {
            Ok(applied) => {
                self.connections
                    .broadcast_locked(
                        self.session.id(),
                        &mut state,
                        &applied.broadcast.into(),
                        Some(self.connection),
                    )
                    .await;
                let ack = FeatureEvent::Ack { request_id, id: applied.id, version: applied.version };
                self.reply(ack.into()).await;
            }
            Err(error) => {
                debug!(
                    session_id = %self.session.id(),
                    connection_id = %self.connection,
                    error = %error,
                    "mutation rejected"
                );
                self.reply(error.to_frame(request_id).into()).await;
            }
        }

        self.state
    }

    /// Leave the session. Safe to call more than once.
    pub async fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.connections.leave(&self.session, self.connection).await;
    }

    async fn reply(&self, message: ServerMessage) {
        if !self.connections.send_to(self.connection, message).await {
            debug!(connection_id = %self.connection, "reply dropped, connection gone");
        }
    }

    async fn violation(&mut self, error: SyncError) {
        warn!(
            session_id = %self.session.id(),
            connection_id = %self.connection,
            error = %error,
            "closing connection"
        );
        self.reply(error.to_frame(None).into()).await;
        self.close().await;
    }
}

fn apply(state: &mut SessionState, message: ClientMessage) -> Result<Applied, SyncError> {
    match message {
        ClientMessage::Insert { payload, .. } => {
            let feature = state.features.insert(payload)?;
            Ok(Applied {
                id: feature.id.clone(),
                version: feature.version,
                broadcast: FeatureEvent::Insert {
                    id: feature.id.clone(),
                    payload: feature.payload.clone(),
                    version: feature.version,
                },
            })
        }
        ClientMessage::Update { feature_id, expected_version, payload, .. } => {
            let feature = state.features.update(&feature_id, expected_version, payload)?;
            Ok(Applied {
                id: feature.id.clone(),
                version: feature.version,
                broadcast: FeatureEvent::Update {
                    id: feature.id.clone(),
                    payload: feature.payload.clone(),
                    version: feature.version,
                },
            })
        }
        ClientMessage::Remove { feature_id, .. } => {
            let removed = state.features.remove(&feature_id)?;
            Ok(Applied {
                broadcast: FeatureEvent::Remove { id: removed.id.clone() },
                id: removed.id,
                version: removed.version,
            })
        }
    }
}
