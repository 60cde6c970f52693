// WebSocket message types for the map planning sync protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Feature, FeatureId};

/// Close code sent when the requested session does not exist.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4404;

/// Close code sent after a protocol violation (RFC 6455 policy violation).
pub const CLOSE_PROTOCOL_VIOLATION: u16 = 1008;

/// Client -> Server: a feature mutation.
///
/// `requestId` is optional and opaque; the server echoes it on the ack or
/// error frame addressed to the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    Insert {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: serde_json::Value,
    },

    Update {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(rename = "featureId")]
        feature_id: FeatureId,
        #[serde(rename = "expectedVersion")]
        expected_version: u64,
        payload: serde_json::Value,
    },

    Remove {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(rename = "featureId")]
        feature_id: FeatureId,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Insert { request_id, .. }
            | Self::Update { request_id, .. }
            | Self::Remove { request_id, .. } => request_id.as_deref(),
        }
    }

    fn payload(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Insert { payload, .. } | Self::Update { payload, .. } => Some(payload),
            Self::Remove { .. } => None,
        }
    }
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    PayloadNotObject,
}

/// Decode and validate one inbound frame.
///
/// Unknown `op` values, missing required fields, and non-object payloads are
/// all rejected; callers treat every rejection as a protocol violation.
pub fn decode_client_message(raw: &[u8]) -> Result<ClientMessage, DecodeError> {
    let message: ClientMessage = serde_json::from_slice(raw)?;
    match message.payload() {
        Some(payload) if !payload.is_object() => Err(DecodeError::PayloadNotObject),
        _ => Ok(message),
    }
}

/// Server -> Client: state changes, keyed by `op`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FeatureEvent {
    /// First frame on every joined connection: full feature list in order.
    Snapshot { features: Vec<Feature> },

    /// Broadcast to peers: a feature was added.
    Insert { id: FeatureId, payload: serde_json::Value, version: u64 },

    /// Broadcast to peers: a feature was replaced.
    Update { id: FeatureId, payload: serde_json::Value, version: u64 },

    /// Broadcast to peers: a feature was removed.
    Remove { id: FeatureId },

    /// Sent only to the originator of an accepted mutation.
    Ack {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        id: FeatureId,
        version: u64,
    },
}

/// Error categories reported on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    SessionNotFound,
    AlreadyJoined,
    VersionConflict,
    FeatureNotFound,
    ProtocolViolation,
    ResourceExhausted,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionNotFound => "SessionNotFound",
            Self::AlreadyJoined => "AlreadyJoined",
            Self::VersionConflict => "VersionConflict",
            Self::FeatureNotFound => "FeatureNotFound",
            Self::ProtocolViolation => "ProtocolViolation",
            Self::ResourceExhausted => "ResourceExhausted",
        }
    }
}

/// Server -> originator only: a rejected message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub error: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<FeatureId>,
    /// Authoritative state of the feature after a version conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Feature>,
}

impl ErrorFrame {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self { error, message: message.into(), request_id: None, feature_id: None, current: None }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Everything the server writes to a socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(FeatureEvent),
    Error(ErrorFrame),
}

impl From<FeatureEvent> for ServerMessage {
    fn from(event: FeatureEvent) -> Self {
        Self::Event(event)
    }
}

impl From<ErrorFrame> for ServerMessage {
    fn from(frame: ErrorFrame) -> Self {
        Self::Error(frame)
    }
}
