//! # beacon-dispatch
//!
//! Consumes the notification subsystem's domain queues and turns events
//! into stored, pushed notifications.
//!
//! - [`HandlerRegistry`]: routing key → [`EventHandler`], built once
//! - [`rules`]: the declarative default handlers
//! - [`DispatchContext::deliver`]: dedup-guarded create, then push, then `sent`
//! - [`DispatchEngine`]: dispatch and ack/reject settlement
//! - [`consumer`]: reconnect-tolerant per-queue loops
//! - [`notification_topology`]: exchanges, queues and bindings from the handler table

#![deny(unsafe_code)]

pub mod consumer;
pub mod context;
pub mod engine;
pub mod errors;
pub mod handler;
pub mod pusher;
pub mod rules;
pub mod topology;

pub use consumer::{ConsumerConfig, run_consumer, spawn_all};
pub use context::{DEFAULT_DEDUP_WINDOW, DispatchContext};
pub use engine::{DispatchEngine, DispatchOutcome};
pub use errors::{DispatchError, Result};
pub use handler::{EventHandler, HandlerEntry, HandlerOutput, HandlerRegistry};
pub use pusher::{NotificationPusher, OfflinePusher};
pub use rules::{Audience, NotificationRule, default_rules};
pub use topology::notification_topology;
