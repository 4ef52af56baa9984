//! Dispatch error types.

use beacon_broker::BrokerError;
use beacon_store::StoreError;

/// Errors a handler can raise. Any of them rejects the delivery without
/// requeue.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The notification store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A required payload field is absent.
    #[error("{event_type}: missing field {field}")]
    MissingField {
        /// Routing key of the offending event.
        event_type: String,
        /// Payload field that was expected.
        field: String,
    },

    /// The broker failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, DispatchError>;
