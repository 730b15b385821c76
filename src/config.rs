//! Construct-then-freeze configuration, the way h2's `proto::Config`
//! is assembled from a `Builder` once and never mutated for the life of
//! a connection (spec.md §4.3 names every knob below by name).

use std::time::Duration;

/// Knobs governing one session's handshake, heartbeat, and grace
/// behavior. Shared by both sides of a connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub protocol_version: String,
    pub heartbeat_interval: Duration,
    pub heartbeats_until_dead: u32,
    pub session_disconnect_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            protocol_version: crate::proto::handshake::PROTOCOL_VERSION.to_string(),
            heartbeat_interval: Duration::from_secs(2),
            heartbeats_until_dead: 2,
            session_disconnect_grace: Duration::from_secs(60),
        }
    }
}

/// Client-only reconnect policy.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub reconnect_on_connection_drop: bool,
    pub connect_on_invoke: bool,
    pub attempt_budget_capacity: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            session: SessionConfig::default(),
            reconnect_on_connection_drop: true,
            connect_on_invoke: true,
            attempt_budget_capacity: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Server-only surface; currently just the shared session knobs, kept
/// as its own type so server-specific settings (e.g. a future
/// concurrent-stream cap) have a natural home without disturbing the
/// client's config shape.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            session: SessionConfig::default(),
        }
    }
}
