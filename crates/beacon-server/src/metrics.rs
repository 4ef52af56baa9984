//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before anything records. A second install fails.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally.
///
/// Renders empty output; for servers built without the global recorder.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket sessions opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket sessions closed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live sessions (gauge).
pub const WS_SESSIONS_ACTIVE: &str = "ws_sessions_active";
/// Sessions closed because the same user connected again (counter).
pub const WS_SESSIONS_SUPERSEDED_TOTAL: &str = "ws_sessions_superseded_total";
/// Push attempts (counter, labels: delivered).
pub const WS_PUSH_TOTAL: &str = "ws_push_total";
/// Outbound messages dropped on a full send queue (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Session lifetime (histogram).
pub const WS_SESSION_DURATION_SECONDS: &str = "ws_session_duration_seconds";
/// Live bridge consumers (gauge, labels: kind).
pub const BRIDGE_SUBSCRIPTIONS_ACTIVE: &str = "bridge_subscriptions_active";
/// Broker messages seen by the bridge (counter, labels: kind, outcome).
pub const BRIDGE_EVENTS_TOTAL: &str = "bridge_events_total";
