pub mod connections;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use mapplan_common::protocol::ws::{
    ErrorKind, ServerMessage, CLOSE_PROTOCOL_VIOLATION, CLOSE_SESSION_NOT_FOUND,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope};
use crate::session::SessionRegistry;
use crate::validation::MAX_WS_FRAME_BYTES;
use self::connections::{ConnectionManager, JoinError, OutboundReceiver};
use self::sync::{ConnectionState, SyncProtocolHandler};

#[derive(Clone)]
pub struct SyncRouterState {
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionManager>,
    heartbeat: HeartbeatConfig,
}

pub fn router(
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionManager>,
    heartbeat: HeartbeatConfig,
) -> Router {
    let state = SyncRouterState { registry, connections, heartbeat };

    Router::new().route("/ws/{session_id}", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    Path(session_id): Path<String>,
    State(state): State<SyncRouterState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_WS_FRAME_BYTES)
        .max_message_size(MAX_WS_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, session_id, socket)).await;
        })
}

async fn handle_socket(state: SyncRouterState, session_id: String, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let connection = state.connections.allocate_id();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerMessage>();

    let mut handler = match SyncProtocolHandler::open(
        &state.registry,
        Arc::clone(&state.connections),
        &session_id,
        connection,
        outbound_sender,
    )
    .await
    {
        Ok(handler) => handler,
        Err(error) => {
            let (code, kind) = match error {
                JoinError::SessionNotFound(_) => (CLOSE_SESSION_NOT_FOUND, ErrorKind::SessionNotFound),
                JoinError::AlreadyJoined(_) => (CLOSE_PROTOCOL_VIOLATION, ErrorKind::AlreadyJoined),
                JoinError::ConnectionClosed(_) => {
                    debug!(
                        session_id = %session_id,
                        connection_id = %connection,
                        "outbound queue closed before join"
                    );
                    return;
                }
            };
            info!(
                session_id = %session_id,
                connection_id = %connection,
                request_id = %request_id,
                error = %error,
                "rejecting websocket join"
            );
            let _ = close_socket(&mut socket, code, kind).await;
            return;
        }
    };

    let mut heartbeat_interval = tokio::time::interval(state.heartbeat.interval);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut heartbeat = Heartbeat::new(state.heartbeat.timeout);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if heartbeat.on_tick(Instant::now()) == HeartbeatAction::TimedOut {
                    warn!(
                        session_id = %session_id,
                        connection_id = %connection,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                let outcome = match message {
                    Ok(Message::Text(raw_message)) => {
                        handler.handle_frame(raw_message.as_str().as_bytes()).await
                    }
                    Ok(Message::Binary(raw_message)) => handler.handle_frame(&raw_message).await,
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                        ConnectionState::Connected
                    }
                    Ok(Message::Pong(_)) => {
                        heartbeat.on_pong();
                        ConnectionState::Connected
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        debug!(connection_id = %connection, error = %error, "websocket read failed");
                        break;
                    }
                };

                if outcome == ConnectionState::Closed {
                    flush_outbound(&mut socket, &mut outbound_receiver).await;
                    let _ = close_socket(&mut socket, CLOSE_PROTOCOL_VIOLATION, ErrorKind::ProtocolViolation)
                        .await;
                    break;
                }
            }
        }
    }

    handler.close().await;
}

/// Send whatever the handler queued (typically the violation frame) before
/// the close frame goes out.
async fn flush_outbound(socket: &mut WebSocket, outbound: &mut OutboundReceiver) {
    while let Ok(message) = outbound.try_recv() {
        if send_ws_message(socket, &message).await.is_err() {
            return;
        }
    }
}

async fn close_socket(socket: &mut WebSocket, code: u16, kind: ErrorKind) -> Result<(), ()> {
    socket
        .send(Message::Close(Some(CloseFrame { code, reason: Utf8Bytes::from_static(kind.as_str()) })))
        .await
        .map_err(|_| ())
}

async fn send_ws_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let encoded = serde_json::to_string(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatAction {
    Ping,
    TimedOut,
}

/// Tracks the oldest unanswered ping.
#[derive(Debug)]
struct Heartbeat {
    timeout: Duration,
    awaiting_since: Option<Instant>,
}

impl Heartbeat {
    fn new(timeout: Duration) -> Self {
        Self { timeout, awaiting_since: None }
    }

    fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        match self.awaiting_since {
            Some(sent) if now.saturating_duration_since(sent) >= self.timeout => {
                HeartbeatAction::TimedOut
            }
            Some(_) => HeartbeatAction::Ping,
            None => {
                self.awaiting_since = Some(now);
                HeartbeatAction::Ping
            }
        }
    }

    fn on_pong(&mut self) {
        self.awaiting_since = None;
    }
}
