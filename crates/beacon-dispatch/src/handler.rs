//! Routing-key to handler registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::EventEnvelope;
use beacon_core::routing::Domain;

use crate::context::DispatchContext;
use crate::errors::Result;

/// What one handler invocation wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandlerOutput {
    /// Rows created.
    pub created: usize,
    /// Writes suppressed as duplicates.
    pub suppressed: usize,
}

/// Trait implemented by every event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one envelope. Must be safe to run more than once.
    async fn handle(&self, envelope: &EventEnvelope, ctx: &DispatchContext)
    -> Result<HandlerOutput>;
}

/// A handler and the domain whose queue receives its events.
#[derive(Clone)]
pub struct HandlerEntry {
    /// Producing domain.
    pub domain: Domain,
    /// The handler.
    pub handler: Arc<dyn EventHandler>,
}

/// Registry mapping routing keys to handlers. Built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a routing key, replacing any previous one.
    pub fn register(
        &mut self,
        domain: Domain,
        routing_key: &str,
        handler: impl EventHandler + 'static,
    ) {
        let _ = self.handlers.insert(
            routing_key.to_owned(),
            HandlerEntry {
                domain,
                handler: Arc::new(handler),
            },
        );
    }

    /// Handler for a routing key.
    pub fn get(&self, routing_key: &str) -> Option<&HandlerEntry> {
        self.handlers.get(routing_key)
    }

    /// All handled routing keys (sorted).
    pub fn routing_keys(&self) -> BTreeSet<String> {
        self.handlers.keys().cloned().collect()
    }

    /// `(domain, routing_key)` pairs, sorted, one per required binding.
    pub fn bindings(&self) -> Vec<(Domain, String)> {
        let mut pairs: Vec<(Domain, String)> = self
            .handlers
            .iter()
            .map(|(key, entry)| (entry.domain, key.clone()))
            .collect();
        pairs.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()).then_with(|| a.1.cmp(&b.1)));
        pairs
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
