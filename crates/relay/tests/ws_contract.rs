use mapplan_common::protocol::ws::{
    ErrorFrame, ErrorKind, FeatureEvent, ServerMessage, CLOSE_PROTOCOL_VIOLATION,
    CLOSE_SESSION_NOT_FOUND,
};
use mapplan_common::types::Feature;
use serde_json::{json, Value};

const RELAY_CONFIG_SOURCE: &str = include_str!("../src/config.rs");
const RELAY_VALIDATION_SOURCE: &str = include_str!("../src/validation.rs");

#[test]
fn websocket_contract_heartbeat_and_lifecycle_defaults() {
    let heartbeat_interval_ms = parse_u64_const(RELAY_CONFIG_SOURCE, "DEFAULT_HEARTBEAT_INTERVAL_MS");
    let heartbeat_timeout_ms = parse_u64_const(RELAY_CONFIG_SOURCE, "DEFAULT_HEARTBEAT_TIMEOUT_MS");
    let idle_grace_ms = parse_u64_const(RELAY_CONFIG_SOURCE, "DEFAULT_IDLE_GRACE_MS");
    let evict_interval_ms = parse_u64_const(RELAY_CONFIG_SOURCE, "DEFAULT_EVICT_INTERVAL_MS");

    assert_eq!(heartbeat_interval_ms, 15_000);
    assert_eq!(heartbeat_timeout_ms, 10_000);
    assert_eq!(idle_grace_ms, 300_000);
    assert_eq!(evict_interval_ms, 30_000);
    assert!(
        heartbeat_timeout_ms < heartbeat_interval_ms,
        "pong timeout must be shorter than heartbeat interval",
    );
    assert!(evict_interval_ms < idle_grace_ms, "sweeps must run more often than the grace period");
}

#[test]
fn websocket_contract_frame_limit_is_256_kib() {
    assert_eq!(parse_u64_const(RELAY_VALIDATION_SOURCE, "MAX_WS_FRAME_BYTES"), 262_144);
}

#[test]
fn websocket_contract_close_codes() {
    assert_eq!(CLOSE_SESSION_NOT_FOUND, 4404);
    assert_eq!(CLOSE_PROTOCOL_VIOLATION, 1008);
}

#[test]
fn websocket_contract_message_shapes() {
    let feature = Feature { id: "f1".to_string(), payload: json!({ "kind": "pin" }), version: 2 };

    let samples: [(ServerMessage, &str, &[&str]); 5] = [
        (
            FeatureEvent::Snapshot { features: vec![feature.clone()] }.into(),
            "snapshot",
            &["op", "features"],
        ),
        (
            FeatureEvent::Insert { id: "f1".to_string(), payload: json!({}), version: 1 }.into(),
            "insert",
            &["op", "id", "payload", "version"],
        ),
        (
            FeatureEvent::Update { id: "f1".to_string(), payload: json!({}), version: 2 }.into(),
            "update",
            &["op", "id", "payload", "version"],
        ),
        (FeatureEvent::Remove { id: "f1".to_string() }.into(), "remove", &["op", "id"]),
        (
            FeatureEvent::Ack { request_id: Some("r-1".to_string()), id: "f1".to_string(), version: 1 }
                .into(),
            "ack",
            &["op", "requestId", "id", "version"],
        ),
    ];

    for (message, expected_op, expected_keys) in samples {
        let value = serde_json::to_value(message).expect("server message should serialize");
        assert_eq!(value["op"], expected_op);
        assert_eq!(object_keys(&value), sorted(expected_keys), "`{expected_op}` frame keys");
    }

    let snapshot = serde_json::to_value(ServerMessage::from(FeatureEvent::Snapshot {
        features: vec![feature],
    }))
    .expect("snapshot should serialize");
    assert_eq!(object_keys(&snapshot["features"][0]), sorted(&["id", "payload", "version"]));
}

#[test]
fn websocket_contract_error_frames() {
    let mut conflict = ErrorFrame::new(ErrorKind::VersionConflict, "stale")
        .with_request_id(Some("r-7".to_string()));
    conflict.feature_id = Some("f1".to_string());
    conflict.current = Some(Feature { id: "f1".to_string(), payload: json!({}), version: 3 });

    let value = serde_json::to_value(ServerMessage::from(conflict)).expect("error should serialize");
    assert_eq!(value["error"], "VersionConflict");
    assert_eq!(
        object_keys(&value),
        sorted(&["error", "message", "requestId", "featureId", "current"])
    );
    assert!(value.get("op").is_none(), "error frames carry no op");

    let bare = serde_json::to_value(ServerMessage::from(ErrorFrame::new(
        ErrorKind::ProtocolViolation,
        "bad frame",
    )))
    .expect("error should serialize");
    assert_eq!(object_keys(&bare), sorted(&["error", "message"]));

    for kind in [
        ErrorKind::SessionNotFound,
        ErrorKind::AlreadyJoined,
        ErrorKind::VersionConflict,
        ErrorKind::FeatureNotFound,
        ErrorKind::ProtocolViolation,
        ErrorKind::ResourceExhausted,
    ] {
        assert_eq!(serde_json::to_value(kind).expect("kind should serialize"), kind.as_str());
    }
}

#[test]
fn websocket_contract_ack_omits_absent_request_id() {
    let value = serde_json::to_value(ServerMessage::from(FeatureEvent::Ack {
        request_id: None,
        id: "f3".to_string(),
        version: 1,
    }))
    .expect("ack should serialize");
    assert_eq!(object_keys(&value), sorted(&["op", "id", "version"]));
}

fn object_keys(value: &Value) -> Vec<String> {
    let mut keys =
        value.as_object().expect("value should be an object").keys().cloned().collect::<Vec<_>>();
    keys.sort();
    keys
}

fn sorted(keys: &[&str]) -> Vec<String> {
    let mut keys = keys.iter().map(|key| key.to_string()).collect::<Vec<_>>();
    keys.sort();
    keys
}

/// Parse `const NAME: T = <expr>;` where `<expr>` is an integer literal or a
/// product of integer literals.
fn parse_u64_const(source: &str, name: &str) -> u64 {
    let needle = format!("const {name}:");
    let index = source.find(&needle).expect("constant must be declared");
    let line = source[index..].lines().next().expect("constant declaration line must exist");
    let raw_value = line
        .split('=')
        .nth(1)
        .expect("constant must have assignment")
        .trim()
        .trim_end_matches(';')
        .replace('_', "");
    raw_value
        .split('*')
        .map(|factor| {
            factor
                .trim()
                .parse::<u64>()
                .unwrap_or_else(|error| panic!("failed to parse `{name}` from `{line}`: {error}"))
        })
        .product()
}
