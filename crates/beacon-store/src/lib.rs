//! # beacon-store
//!
//! Durable notification records backed by `SQLite`.
//!
//! - [`connection`]: r2d2 pool with per-connection pragmas
//! - [`migrations`]: embedded, versioned schema
//! - [`repository::NotificationRepo`]: stateless SQL over a `&Connection`
//! - [`store::NotificationStore`]: async façade running queries on the
//!   blocking pool, including the check-and-insert used for dedup
//!
//! Rows are append-only. The only mutations are the monotonic `read_at`
//! transition and the `sent` flag; triggers reject anything else.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod migrations;
pub mod repository;
pub mod store;

pub use connection::{ConnectionConfig, ConnectionPool, new_file, new_in_memory};
pub use errors::{Result, StoreError};
pub use migrations::run_migrations;
pub use repository::{ListQuery, NotificationRepo};
pub use store::{CreateOutcome, NotificationStore};
