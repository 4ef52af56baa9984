//! Topology derived from the handler table.

use std::time::Duration;

use beacon_broker::{ExchangeSpec, QueueSpec, Topology};
use beacon_core::routing::{Domain, NOTIFICATIONS_EXCHANGE, PLATFORM_EXCHANGE};

use crate::handler::HandlerRegistry;

/// Exchanges, durable domain queues, and one binding per handled routing
/// key. Adding a handler adds a binding, never an exchange.
pub fn notification_topology(registry: &HandlerRegistry, message_ttl: Duration) -> Topology {
    let mut topology = Topology::new()
        .exchange(ExchangeSpec::topic(NOTIFICATIONS_EXCHANGE))
        .exchange(ExchangeSpec::topic(PLATFORM_EXCHANGE));
    for domain in Domain::ALL {
        topology = topology
            .exchange(ExchangeSpec::topic(domain.exchange()))
            .queue(QueueSpec::durable(domain.notification_queue()).with_message_ttl(message_ttl));
    }
    for (domain, routing_key) in registry.bindings() {
        topology = topology.bind(domain.notification_queue(), domain.exchange(), routing_key);
    }
    topology
}
