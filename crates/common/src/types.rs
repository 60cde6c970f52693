// Core domain types shared between the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-assigned feature identifier, unique within one session.
pub type FeatureId = String;

/// Opaque session identifier handed out by `POST /api/session`.
pub type SessionId = String;

/// A single map annotation.
///
/// `payload` is opaque to the server (shape + properties as drawn by the
/// client). `version` starts at 1 and grows by one on every accepted update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    pub id: FeatureId,
    pub payload: serde_json::Value,
    pub version: u64,
}

/// Body of `POST /api/session`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub map: String,
}

/// Response of `POST /api/session`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSessionResponse {
    pub id: SessionId,
}

/// Response of `GET /api/session/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub map: String,
    pub created_at: DateTime<Utc>,
    /// Number of currently joined peers.
    pub peers: usize,
    /// Number of features currently in the session.
    pub features: usize,
}
