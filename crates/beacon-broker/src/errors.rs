//! Broker error types.

use std::time::Duration;

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No live connection.
    #[error("broker not connected")]
    NotConnected,

    /// Readiness wait elapsed.
    #[error("broker not ready after {waited:?}")]
    NotReady {
        /// How long the caller waited.
        waited: Duration,
    },

    /// Publish or bind against an undeclared exchange.
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Consume, bind or delete against an undeclared queue.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// An entity already exists with different properties.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A topology failed validation before declaration.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Envelope (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// AMQP client error.
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_displays_wait() {
        let err = BrokerError::NotReady {
            waited: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "broker not ready after 250ms");
    }
}
