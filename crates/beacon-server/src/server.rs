//! `BeaconServer`: axum HTTP + WebSocket gateway.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use beacon_broker::Broker;
use beacon_core::routing::is_routing_word;
use beacon_dispatch::NotificationPusher;
use beacon_store::NotificationStore;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{self, ApiError};
use crate::bridge::{BridgeConfig, SubscriptionBridge};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::pusher::SessionPusher;
use crate::websocket::connection::CLOSE_GOING_AWAY;
use crate::websocket::protocol::ServiceType;
use crate::websocket::registry::{RegistryStats, SessionRegistry};
use crate::websocket::session::run_session;

/// Shared state accessible from axum handlers and sessions.
#[derive(Clone)]
pub struct AppState {
    /// Server settings.
    pub config: Arc<ServerConfig>,
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Broker subscriptions feeding sessions.
    pub bridge: Arc<SubscriptionBridge>,
    /// Broker connection.
    pub broker: Arc<dyn Broker>,
    /// Notification store.
    pub store: NotificationStore,
    /// Push seam shared with the dispatch engine.
    pub pusher: Arc<dyn NotificationPusher>,
    /// Cancelled on shutdown; sessions hold child tokens.
    pub shutdown: CancellationToken,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    /// Wire registry, bridge and pusher around a broker and store.
    ///
    /// `handled_event_types` are the routing keys the dispatch engine owns.
    pub fn new(
        config: ServerConfig,
        broker: Arc<dyn Broker>,
        store: NotificationStore,
        handled_event_types: BTreeSet<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let bridge = Arc::new(SubscriptionBridge::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            BridgeConfig::from_server_config(&config),
            handled_event_types,
            shutdown.child_token(),
        ));
        let pusher = Arc::new(SessionPusher::new(Arc::clone(&registry), Arc::clone(&broker)));
        Self {
            config: Arc::new(config),
            registry,
            bridge,
            broker,
            store,
            pusher,
            shutdown,
            metrics: metrics::detached_handle(),
            start_time: Instant::now(),
        }
    }

    /// Render `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = handle;
        self
    }
}

/// The Beacon gateway server.
pub struct BeaconServer {
    state: AppState,
}

impl BeaconServer {
    /// Create a server over prepared state.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Server settings.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Build the router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .route(
                "/notifications",
                get(api::list_notifications).post(api::create_notification),
            )
            .route("/notifications/{id}/read", post(api::mark_read))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the target-extraction consumer.
    pub fn spawn_fanout(&self) -> JoinHandle<()> {
        self.state.bridge.spawn_fanout()
    }

    /// Bind and serve until the shutdown token fires.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let bind = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let registry = Arc::clone(&self.state.registry);
        let shutdown = self.state.shutdown.clone();

        let handle = tokio::spawn(async move {
            let signal = async move {
                shutdown.cancelled().await;
                registry.close_all(CLOSE_GOING_AWAY, "server shutting down");
            };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
            {
                warn!(error = %err, "http server exited with error");
            }
        });
        info!(%addr, "beacon server listening");
        Ok((addr, handle))
    }
}

/// `/ws` query parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Connecting user.
    pub user_id: Option<String>,
    /// Surface; defaults to `notifications`.
    pub service_type: Option<String>,
}

/// `GET /ws?userId=&serviceType=`: validate, then upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let min_len = state.config.min_user_id_length;
    let user_id = match params.user_id.map(|u| u.trim().to_owned()) {
        Some(user_id) if user_id.chars().count() >= min_len => user_id,
        _ => {
            return ApiError::bad_request(
                "INVALID_USER_ID",
                format!("userId is required and must be at least {min_len} characters"),
            )
            .into_response();
        }
    };
    if !is_routing_word(&user_id) {
        return ApiError::bad_request("INVALID_USER_ID", "userId must not contain '.', '*' or '#'")
            .into_response();
    }
    let service_type = match params.service_type.as_deref().map(str::parse::<ServiceType>) {
        None => ServiceType::default(),
        Some(Ok(service_type)) => service_type,
        Some(Err(message)) => return ApiError::bad_request("INVALID_SERVICE_TYPE", message).into_response(),
    };
    if state.shutdown.is_cancelled() {
        return ApiError::unavailable("SHUTTING_DOWN", "server is shutting down").into_response();
    }
    if state.registry.len() >= state.config.max_connections && !state.registry.contains(&user_id) {
        return ApiError::unavailable("CAPACITY", "too many connections").into_response();
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let max_message_size = state.config.max_message_size;
    upgrade
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| run_session(socket, user_id, service_type, state))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_reachable = state.store.ping().await.is_ok();
    Json(health::health_check(
        state.start_time,
        store_reachable,
        state.broker.status(),
        state.registry.stats(),
    ))
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    metrics::render(&state.metrics)
}
