//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the Beacon gateway server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket sessions.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Disconnect a client silent for this many seconds.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-session outbound queue length.
    pub send_queue_capacity: usize,
    /// Shortest accepted `userId`.
    pub min_user_id_length: usize,
    /// Identifies this process in ephemeral queue names and consumer tags.
    pub instance_id: String,
    /// Bounded wait for broker readiness on subscribe.
    pub broker_ready_timeout_ms: u64,
    /// Readiness poll interval.
    pub broker_ready_poll_ms: u64,
    /// `x-message-ttl` for per-user queues.
    pub user_queue_ttl_secs: u64,
    /// `x-expires` for per-user queues.
    pub user_queue_expiry_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
            send_queue_capacity: 256,
            min_user_id_length: 3,
            instance_id: uuid::Uuid::now_v7().simple().to_string(),
            broker_ready_timeout_ms: 10_000,
            broker_ready_poll_ms: 250,
            user_queue_ttl_secs: 7 * 24 * 3600,
            user_queue_expiry_secs: 7 * 24 * 3600,
        }
    }
}

impl ServerConfig {
    /// Ping cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence limit.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Readiness wait bound.
    pub fn broker_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_ready_timeout_ms)
    }

    /// Readiness poll interval.
    pub fn broker_ready_poll(&self) -> Duration {
        Duration::from_millis(self.broker_ready_poll_ms)
    }
}
