//! `/health` body.

use std::time::Instant;

use beacon_broker::BrokerStatus;
use serde::Serialize;

use crate::websocket::registry::RegistryStats;

/// Store probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    /// Whether a trivial query succeeded.
    pub reachable: bool,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"` when store and broker are both usable, else `"degraded"`.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Store probe.
    pub store: StoreHealth,
    /// Broker connection.
    pub broker: BrokerStatus,
    /// Session registry counters.
    pub sessions: RegistryStats,
}

/// Assemble a health response.
pub fn health_check(
    start_time: Instant,
    store_reachable: bool,
    broker: BrokerStatus,
    sessions: RegistryStats,
) -> HealthResponse {
    let status = if store_reachable && broker.ready { "ok" } else { "degraded" };
    HealthResponse {
        status,
        uptime_secs: start_time.elapsed().as_secs(),
        store: StoreHealth {
            reachable: store_reachable,
        },
        broker,
        sessions,
    }
}
