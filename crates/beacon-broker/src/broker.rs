//! The broker seam.
//!
//! Everything above this crate talks to a `dyn Broker`; the gateway picks
//! [`crate::AmqpBroker`] in production and [`crate::MemoryBroker`] for
//! tests and single-node runs.

use async_trait::async_trait;
use beacon_core::EventEnvelope;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::delivery::Delivery;
use crate::errors::Result;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};

/// Stream of deliveries for one consumer. Ends when the consumer is
/// cancelled, the queue is deleted, or the connection drops.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Connection health as reported on `/health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    /// Whether operations can currently succeed.
    pub ready: bool,
    /// Backend name: `amqp` or `memory`.
    pub backend: &'static str,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u64,
    /// Most recent connection error, if any.
    pub last_error: Option<String>,
}

/// Topic broker operations.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a topic exchange if absent.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    /// Declare a queue if absent.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Bind a queue to an exchange under a routing-key pattern.
    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()>;

    /// Delete a queue and its bindings. Deleting an absent queue succeeds.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Publish a message body.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Start consuming a queue under `consumer_tag`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Stop a consumer. Cancelling an unknown tag succeeds.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Whether the connection is currently usable.
    fn is_ready(&self) -> bool;

    /// Snapshot for health reporting.
    fn status(&self) -> BrokerStatus;
}

/// Serialize and publish an envelope.
pub async fn publish_envelope(
    broker: &dyn Broker,
    exchange: &str,
    routing_key: &str,
    envelope: &EventEnvelope,
) -> Result<()> {
    let body = envelope.to_bytes()?;
    broker.publish(exchange, routing_key, &body).await
}
