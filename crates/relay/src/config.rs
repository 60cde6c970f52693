// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. CORS origins are parsed separately in cors.rs.

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_IDLE_GRACE_MS: u64 = 300_000;
const DEFAULT_EVICT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `mapplan_relay=debug`).
    pub log_filter: String,
    /// How long a session may sit with zero peers before eviction.
    pub idle_grace: Duration,
    /// How often the eviction sweep runs.
    pub evict_interval: Duration,
    pub heartbeat: HeartbeatConfig,
}

/// Server-initiated ping cadence for joined sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// A socket is dropped when no pong has arrived for this long at a tick.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `MAPPLAN_RELAY_HOST` | `0.0.0.0` |
    /// | `MAPPLAN_RELAY_PORT` | `8080` |
    /// | `MAPPLAN_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `MAPPLAN_RELAY_LOG_FILTER` | `info` |
    /// | `MAPPLAN_RELAY_IDLE_GRACE_MS` | `300000` |
    /// | `MAPPLAN_RELAY_EVICT_INTERVAL_MS` | `30000` |
    /// | `MAPPLAN_RELAY_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `MAPPLAN_RELAY_HEARTBEAT_TIMEOUT_MS` | `10000` |
    ///
    /// Durations that fail to parse use the default; zero is clamped to 1 ms.
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("MAPPLAN_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("MAPPLAN_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let cors_origins = env("MAPPLAN_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("MAPPLAN_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let millis = |key: &str, default: u64| {
            let ms = env(key).ok().and_then(|v| v.trim().parse::<u64>().ok()).unwrap_or(default);
            Duration::from_millis(ms.max(1))
        };

        Self {
            listen_addr,
            cors_origins,
            log_filter,
            idle_grace: millis("MAPPLAN_RELAY_IDLE_GRACE_MS", DEFAULT_IDLE_GRACE_MS),
            evict_interval: millis("MAPPLAN_RELAY_EVICT_INTERVAL_MS", DEFAULT_EVICT_INTERVAL_MS),
            heartbeat: HeartbeatConfig {
                interval: millis(
                    "MAPPLAN_RELAY_HEARTBEAT_INTERVAL_MS",
                    DEFAULT_HEARTBEAT_INTERVAL_MS,
                ),
                timeout: millis("MAPPLAN_RELAY_HEARTBEAT_TIMEOUT_MS", DEFAULT_HEARTBEAT_TIMEOUT_MS),
            },
        }
    }
}
