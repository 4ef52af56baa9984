//! # beacon-core
//!
//! Foundation types shared by every Beacon crate:
//!
//! - **Envelopes**: [`envelope::EventEnvelope`], the immutable unit of communication on the broker
//! - **Notifications**: [`notification::Notification`] and the create contract [`notification::NewNotification`]
//! - **Branded IDs**: `NotificationId`, `EventId`, `SessionId` as newtypes for type safety
//! - **Routing**: exchange/queue names and the routing-key taxonomy in [`routing`]
//! - **Backoff**: capped exponential backoff math used by broker reconnection

#![deny(unsafe_code)]

pub mod backoff;
pub mod envelope;
pub mod ids;
pub mod notification;
pub mod routing;

pub use envelope::EventEnvelope;
pub use ids::{EventId, NotificationId, SessionId};
pub use notification::{NewNotification, Notification, NotificationCategory};
