use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use mapplan_common::types::{CreateSessionRequest, CreateSessionResponse, SessionInfo};
use tracing::debug;

use crate::error::RelayError;
use crate::session::SessionRegistry;
use crate::validation::{require_non_blank, ValidatedJson};

#[derive(Clone)]
struct SessionApiState {
    registry: Arc<SessionRegistry>,
}

// ── Router ─────────────────────────────────────────────────────────

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    let state = SessionApiState { registry };

    Router::new()
        .route("/api/session", post(create_session))
        .route("/api/session/{session_id}", get(get_session))
        .with_state(state)
}

// ── Handlers ───────────────────────────────────────────────────────

async fn create_session(
    State(state): State<SessionApiState>,
    ValidatedJson(payload): ValidatedJson<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), RelayError> {
    require_non_blank("map", &payload.map)?;

    let session = state.registry.create(&payload.map).await?;

    Ok((StatusCode::CREATED, Json(CreateSessionResponse { id: session.id().to_string() })))
}

async fn get_session(
    State(state): State<SessionApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, RelayError> {
    let session = state.registry.get(&session_id).await?;
    let info = session.info().await;
    debug!(session_id = %info.id, peers = info.peers, features = info.features, "session lookup");
    Ok(Json(info))
}
