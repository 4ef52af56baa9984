//! # beacon-broker
//!
//! Topic broker abstraction used by dispatch and the WebSocket bridge.
//!
//! - [`Broker`]: the async seam (declare, bind, publish, consume, settle)
//! - [`Topology`]: exchanges, queues and bindings declared as one validated unit
//! - [`MemoryBroker`]: in-process backend with AMQP topic semantics
//! - [`AmqpBroker`]: RabbitMQ backend over `lapin` with a reconnect supervisor
//! - [`wait_until_ready`]: bounded readiness wait for subscribe/publish paths

#![deny(unsafe_code)]

pub mod amqp;
pub mod broker;
pub mod delivery;
pub mod errors;
pub mod memory;
pub mod pattern;
pub mod readiness;
pub mod topology;

pub use amqp::{AmqpBroker, AmqpConfig};
pub use broker::{Broker, BrokerStatus, DeliveryStream, publish_envelope};
pub use delivery::Delivery;
pub use errors::{BrokerError, Result};
pub use memory::MemoryBroker;
pub use pattern::topic_matches;
pub use readiness::wait_until_ready;
pub use topology::{BindingSpec, ExchangeSpec, QueueSpec, Topology, TopologyReport};
