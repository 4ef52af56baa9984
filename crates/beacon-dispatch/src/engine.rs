//! Envelope dispatch and delivery settlement.

use std::sync::Arc;
use std::time::Instant;

use beacon_broker::Delivery;
use beacon_core::EventEnvelope;
use metrics::{counter, histogram};
use tracing::{debug, error, instrument, warn};

use crate::context::DispatchContext;
use crate::errors::Result;
use crate::handler::{HandlerOutput, HandlerRegistry};

/// Result of dispatching one envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion.
    Handled(HandlerOutput),
    /// No handler for the routing key.
    Unmapped,
}

/// Routes envelopes to handlers.
#[derive(Clone)]
pub struct DispatchEngine {
    registry: Arc<HandlerRegistry>,
    ctx: DispatchContext,
}

impl DispatchEngine {
    /// Build an engine.
    pub fn new(registry: Arc<HandlerRegistry>, ctx: DispatchContext) -> Self {
        Self { registry, ctx }
    }

    /// The handler table.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Run the handler for `routing_key`, if any.
    pub async fn dispatch(
        &self,
        envelope: &EventEnvelope,
        routing_key: &str,
    ) -> Result<DispatchOutcome> {
        let Some(entry) = self.registry.get(routing_key) else {
            return Ok(DispatchOutcome::Unmapped);
        };
        let start = Instant::now();
        let result = entry.handler.handle(envelope, &self.ctx).await;
        histogram!("dispatch_handler_duration_seconds", "routing_key" => routing_key.to_owned())
            .record(start.elapsed().as_secs_f64());
        result.map(DispatchOutcome::Handled)
    }

    /// Parse, dispatch and settle one delivery.
    ///
    /// Acks on success and on unmapped keys; rejects without requeue on
    /// parse or handler failure.
    #[instrument(skip_all, fields(routing_key = %delivery.routing_key))]
    pub async fn process_delivery(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key.clone();
        let envelope = match delivery.envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    error = %err,
                    payload = %String::from_utf8_lossy(&delivery.body),
                    "unparseable envelope, rejecting"
                );
                record(&routing_key, "invalid");
                settle(delivery.reject().await);
                return;
            }
        };

        match self.dispatch(&envelope, &routing_key).await {
            Ok(DispatchOutcome::Handled(output)) => {
                debug!(
                    event_id = %envelope.event_id,
                    created = output.created,
                    suppressed = output.suppressed,
                    "event handled"
                );
                record(&routing_key, "handled");
                settle(delivery.ack().await);
            }
            Ok(DispatchOutcome::Unmapped) => {
                debug!("no handler for routing key, acknowledging");
                record(&routing_key, "unmapped");
                settle(delivery.ack().await);
            }
            Err(err) => {
                error!(
                    error = %err,
                    event_id = %envelope.event_id,
                    payload = %serde_json::Value::Object(envelope.payload.clone()),
                    "handler failed, rejecting"
                );
                record(&routing_key, "failed");
                settle(delivery.reject().await);
            }
        }
    }
}

fn record(routing_key: &str, outcome: &'static str) {
    counter!(
        "dispatch_events_total",
        "routing_key" => routing_key.to_owned(),
        "outcome" => outcome
    )
    .increment(1);
}

fn settle(result: beacon_broker::Result<()>) {
    if let Err(err) = result {
        warn!(error = %err, "failed to settle delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pusher::MockNotificationPusher;
    use assert_matches::assert_matches;
    use beacon_broker::{BindingSpec, Broker, BrokerError, ExchangeSpec, MemoryBroker, QueueSpec};
    use futures::StreamExt;
    use std::time::Duration;
    use beacon_store::{ListQuery, NotificationStore};

    fn engine(pusher: MockNotificationPusher) -> DispatchEngine {
        let ctx = DispatchContext::new(NotificationStore::open_in_memory().unwrap(), Arc::new(pusher));
        DispatchEngine::new(Arc::new(HandlerRegistry::with_default_rules()), ctx)
    }

    #[tokio::test]
    async fn unmapped_key_is_a_noop() {
        let engine = engine(MockNotificationPusher::new());
        let env = EventEnvelope::new("gig_applied", "gig");
        assert_matches!(
            engine.dispatch(&env, "gig_applied").await,
            Ok(DispatchOutcome::Unmapped)
        );
    }

    #[tokio::test]
    async fn handled_event_pushes_each_recipient() {
        let mut pusher = MockNotificationPusher::new();
        let _ = pusher.expect_push().times(2).return_const(true);
        let engine = engine(pusher);
        let env = EventEnvelope::new("gig_completed", "gig")
            .with_field("gigId", "g1")
            .with_field("ownerId", "u1")
            .with_field("workerId", "u2");
        assert_matches!(
            engine.dispatch(&env, "gig_completed").await,
            Ok(DispatchOutcome::Handled(HandlerOutput { created: 2, .. }))
        );
    }

    #[tokio::test]
    async fn routing_key_selects_handler_not_event_type() {
        let mut pusher = MockNotificationPusher::new();
        let _ = pusher.expect_push().times(1).return_const(false);
        let engine = engine(pusher);
        let env = EventEnvelope::new("something.else", "identity").with_field("userId", "u1");
        let _ = engine.dispatch(&env, "user.verified").await.unwrap();
        let rows = engine
            .ctx
            .store
            .list_for_user("u1", ListQuery::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn process_delivery_settles_every_outcome() {
        let mut pusher = MockNotificationPusher::new();
        let _ = pusher.expect_push().times(1).return_const(false);
        let engine = engine(pusher);
        let broker = MemoryBroker::new();
        broker.declare_exchange(&ExchangeSpec::topic("identity.events")).await.unwrap();
        broker.declare_queue(&QueueSpec::durable("inbox")).await.unwrap();
        broker
            .bind_queue(&BindingSpec::new("inbox", "identity.events", "#"))
            .await
            .unwrap();

        let messages: [(&str, &[u8]); 4] = [
            ("user.registered", b"{oops"),
            ("gig_applied", br#"{"eventType":"gig_applied"}"#),
            ("user.registered", br#"{"eventType":"user.registered"}"#),
            ("user.registered", br#"{"eventType":"user.registered","userId":"u1"}"#),
        ];
        for (key, body) in messages {
            broker.publish("identity.events", key, body).await.unwrap();
        }

        let mut stream = broker.consume("inbox", "engine-test").await.unwrap();
        for _ in 0..messages.len() {
            let delivery = stream.next().await.unwrap().unwrap();
            engine.process_delivery(delivery).await;
        }

        assert_eq!(broker.queue_depth("inbox"), Some(0));
        let redelivered = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(redelivered.is_err(), "a settled delivery came back");
        let rows = engine
            .ctx
            .store
            .list_for_user("u1", ListQuery::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn settle_swallows_errors() {
        settle(Err(BrokerError::NotConnected));
    }
}
