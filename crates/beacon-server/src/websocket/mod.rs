//! WebSocket layer: protocol, sessions, registry and handling.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod session;
