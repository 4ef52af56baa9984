//! A consumed message and its settlement handle.

use beacon_core::EventEnvelope;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};

use crate::errors::Result;
use crate::memory::MemoryAcker;

pub(crate) enum Acker {
    Memory(MemoryAcker),
    Amqp(lapin::acker::Acker),
}

/// One message handed to a consumer.
///
/// Exactly one of [`ack`](Self::ack), [`reject`](Self::reject) or
/// [`requeue`](Self::requeue) settles it. An in-memory delivery dropped
/// unsettled goes back to the head of its queue.
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw body.
    pub body: Vec<u8>,
    /// Whether this message was delivered before.
    pub redelivered: bool,
    acker: Acker,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub(crate) fn new(
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        redelivered: bool,
        acker: Acker,
    ) -> Self {
        Self {
            exchange,
            routing_key,
            body,
            redelivered,
            acker,
        }
    }

    pub(crate) fn from_amqp(delivery: lapin::message::Delivery) -> Self {
        Self::new(
            delivery.exchange.to_string(),
            delivery.routing_key.to_string(),
            delivery.data,
            delivery.redelivered,
            Acker::Amqp(delivery.acker),
        )
    }

    /// Parse the body as an event envelope.
    pub fn envelope(&self) -> serde_json::Result<EventEnvelope> {
        EventEnvelope::from_slice(&self.body)
    }

    /// Settle as processed.
    pub async fn ack(self) -> Result<()> {
        match self.acker {
            Acker::Memory(acker) => acker.ack(),
            Acker::Amqp(acker) => acker.ack(BasicAckOptions::default()).await?,
        }
        Ok(())
    }

    /// Settle as failed and discard.
    pub async fn reject(self) -> Result<()> {
        match self.acker {
            Acker::Memory(acker) => acker.ack(),
            Acker::Amqp(acker) => {
                acker
                    .reject(BasicRejectOptions { requeue: false })
                    .await?;
            }
        }
        Ok(())
    }

    /// Return the message to its queue for another consumer.
    pub async fn requeue(self) -> Result<()> {
        match self.acker {
            Acker::Memory(acker) => acker.requeue(),
            Acker::Amqp(acker) => {
                acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
