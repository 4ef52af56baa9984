//! # beacon-server
//!
//! Axum HTTP + WebSocket gateway for the Beacon fanout layer.
//!
//! - [`websocket`]: wire protocol, per-socket sessions, the
//!   [`SessionRegistry`](websocket::registry::SessionRegistry) and heartbeat
//! - [`bridge`]: broker queues feeding sessions (per user, per room, fanout)
//! - [`pusher::SessionPusher`]: the dispatch engine's push seam
//! - [`api`]: notification create/list/read over HTTP
//! - [`health`], [`metrics`], [`shutdown`]: operational surface

#![deny(unsafe_code)]

pub mod api;
pub mod bridge;
pub mod config;
pub mod health;
pub mod metrics;
pub mod pusher;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use bridge::{BridgeConfig, BridgeError, SubscriptionBridge};
pub use config::ServerConfig;
pub use pusher::SessionPusher;
pub use server::{AppState, BeaconServer};
pub use shutdown::ShutdownCoordinator;
pub use websocket::protocol::{ClientMessage, ServerMessage, ServiceType};
pub use websocket::registry::{RegistryStats, SessionRegistry};
