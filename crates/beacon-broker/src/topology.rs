//! Declarative broker topology.
//!
//! A [`Topology`] is plain data: exchanges, queues and bindings. It is
//! validated as a whole, then declared entity by entity. Declaration is
//! idempotent; redeclaring an entity with different properties fails with
//! [`BrokerError::PreconditionFailed`].

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info};

use crate::broker::Broker;
use crate::errors::{BrokerError, Result};

/// A topic exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name.
    pub name: String,
    /// Survives broker restart.
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// A queue and its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Survives broker restart.
    pub durable: bool,
    /// Removed when its last consumer goes away.
    pub auto_delete: bool,
    /// Restricted to the declaring connection.
    pub exclusive: bool,
    /// Per-message TTL (`x-message-ttl`).
    pub message_ttl: Option<Duration>,
    /// Idle expiry of the queue itself (`x-expires`).
    pub expires: Option<Duration>,
}

impl QueueSpec {
    /// Durable, shared queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            message_ttl: None,
            expires: None,
        }
    }

    /// Non-durable queue deleted with its last consumer.
    pub fn ephemeral(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: true,
            exclusive: false,
            message_ttl: None,
            expires: None,
        }
    }

    /// Set the per-message TTL.
    #[must_use]
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Set the idle expiry.
    #[must_use]
    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// Queue-to-exchange binding.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BindingSpec {
    /// Bound queue.
    pub queue: String,
    /// Source exchange.
    pub exchange: String,
    /// Routing-key pattern.
    pub routing_key: String,
}

impl BindingSpec {
    /// Build a binding.
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// What [`Topology::declare`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopologyReport {
    /// Exchanges declared.
    pub exchanges: usize,
    /// Queues declared.
    pub queues: usize,
    /// Bindings declared.
    pub bindings: usize,
}

/// A set of exchanges, queues and bindings declared together.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: BTreeSet<BindingSpec>,
}

impl Topology {
    /// Empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exchange. Identical repeats collapse.
    #[must_use]
    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        if !self.exchanges.contains(&spec) {
            self.exchanges.push(spec);
        }
        self
    }

    /// Add a queue. Identical repeats collapse.
    #[must_use]
    pub fn queue(mut self, spec: QueueSpec) -> Self {
        if !self.queues.contains(&spec) {
            self.queues.push(spec);
        }
        self
    }

    /// Add a binding.
    #[must_use]
    pub fn bind(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        let _ = self
            .bindings
            .insert(BindingSpec::new(queue, exchange, routing_key));
        self
    }

    /// Declared exchanges.
    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    /// Declared queues.
    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    /// Declared bindings, sorted.
    pub fn bindings(&self) -> impl Iterator<Item = &BindingSpec> {
        self.bindings.iter()
    }

    /// Check internal consistency: no conflicting duplicates, every binding
    /// references a declared queue and exchange.
    pub fn validate(&self) -> Result<()> {
        for (i, a) in self.exchanges.iter().enumerate() {
            if a.name.is_empty() {
                return Err(BrokerError::InvalidTopology("empty exchange name".into()));
            }
            if self.exchanges[i + 1..].iter().any(|b| b.name == a.name) {
                return Err(BrokerError::InvalidTopology(format!(
                    "exchange {} declared with conflicting properties",
                    a.name
                )));
            }
        }
        for (i, a) in self.queues.iter().enumerate() {
            if a.name.is_empty() {
                return Err(BrokerError::InvalidTopology("empty queue name".into()));
            }
            if self.queues[i + 1..].iter().any(|b| b.name == a.name) {
                return Err(BrokerError::InvalidTopology(format!(
                    "queue {} declared with conflicting properties",
                    a.name
                )));
            }
        }
        for binding in &self.bindings {
            if !self.exchanges.iter().any(|e| e.name == binding.exchange) {
                return Err(BrokerError::InvalidTopology(format!(
                    "binding {} -> {} references undeclared exchange",
                    binding.routing_key, binding.exchange
                )));
            }
            if !self.queues.iter().any(|q| q.name == binding.queue) {
                return Err(BrokerError::InvalidTopology(format!(
                    "binding {} -> {} references undeclared queue",
                    binding.routing_key, binding.queue
                )));
            }
        }
        Ok(())
    }

    /// Validate, then declare exchanges, queues and bindings in that order.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<TopologyReport> {
        self.validate()?;
        for exchange in &self.exchanges {
            debug!(exchange = %exchange.name, "declaring exchange");
            broker.declare_exchange(exchange).await?;
        }
        for queue in &self.queues {
            debug!(queue = %queue.name, "declaring queue");
            broker.declare_queue(queue).await?;
        }
        for binding in &self.bindings {
            broker.bind_queue(binding).await?;
        }
        let report = TopologyReport {
            exchanges: self.exchanges.len(),
            queues: self.queues.len(),
            bindings: self.bindings.len(),
        };
        info!(
            exchanges = report.exchanges,
            queues = report.queues,
            bindings = report.bindings,
            "topology declared"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use assert_matches::assert_matches;

    fn gig_topology() -> Topology {
        Topology::new()
            .exchange(ExchangeSpec::topic("gig.events"))
            .queue(QueueSpec::durable("notifications.gig").with_message_ttl(Duration::from_secs(60)))
            .bind("notifications.gig", "gig.events", "gig_created")
            .bind("notifications.gig", "gig.events", "gig_completed")
    }

    #[test]
    fn duplicate_bindings_collapse() {
        let topology = gig_topology().bind("notifications.gig", "gig.events", "gig_created");
        assert_eq!(topology.bindings().count(), 2);
    }

    #[test]
    fn identical_entities_collapse() {
        let topology = gig_topology()
            .exchange(ExchangeSpec::topic("gig.events"))
            .queue(QueueSpec::durable("notifications.gig").with_message_ttl(Duration::from_secs(60)));
        assert_eq!(topology.exchanges().len(), 1);
        assert_eq!(topology.queues().len(), 1);
        topology.validate().unwrap();
    }

    #[test]
    fn binding_to_undeclared_exchange_is_invalid() {
        let topology = gig_topology().bind("notifications.gig", "clan.events", "clan.member.joined");
        assert_matches!(topology.validate(), Err(BrokerError::InvalidTopology(_)));
    }

    #[test]
    fn binding_to_undeclared_queue_is_invalid() {
        let topology = gig_topology().bind("notifications.clan", "gig.events", "gig_created");
        assert_matches!(topology.validate(), Err(BrokerError::InvalidTopology(_)));
    }

    #[test]
    fn conflicting_queue_definitions_are_invalid() {
        let topology = gig_topology().queue(QueueSpec::durable("notifications.gig"));
        assert_matches!(topology.validate(), Err(BrokerError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let broker = MemoryBroker::new();
        let topology = gig_topology();
        let first = topology.declare(&broker).await.unwrap();
        let second = topology.declare(&broker).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.bindings, 2);
        assert_eq!(broker.bindings_for("notifications.gig").len(), 2);
    }

    #[tokio::test]
    async fn redeclare_with_different_properties_fails() {
        let broker = MemoryBroker::new();
        let _ = gig_topology().declare(&broker).await.unwrap();
        let changed = Topology::new()
            .exchange(ExchangeSpec::topic("gig.events"))
            .queue(QueueSpec::durable("notifications.gig").with_message_ttl(Duration::from_secs(5)));
        assert_matches!(
            changed.declare(&broker).await,
            Err(BrokerError::PreconditionFailed(_))
        );
    }
}
