//! In-process topic broker.
//!
//! Mirrors the AMQP semantics the rest of the workspace relies on: topic
//! routing with `*`/`#`, declare-if-absent with precondition checks,
//! per-message TTL, competing consumers, auto-delete on last consumer,
//! and requeue of unsettled deliveries. `set_connected(false)` simulates a
//! lost connection: consumers end and every operation fails until the
//! connection is restored.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::{Broker, BrokerStatus, DeliveryStream};
use crate::delivery::{Acker, Delivery};
use crate::errors::{BrokerError, Result};
use crate::pattern::topic_matches;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};

#[derive(Clone, Debug)]
struct Message {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
    expires_at: Option<Instant>,
}

struct QueueState {
    spec: QueueSpec,
    messages: Mutex<VecDeque<Message>>,
    ready: Notify,
    deleted: CancellationToken,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            messages: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            deleted: CancellationToken::new(),
        }
    }

    fn push_back(&self, message: Message) {
        self.messages.lock().push_back(message);
        self.ready.notify_waiters();
    }

    fn push_front(&self, message: Message) {
        self.messages.lock().push_front(message);
        self.ready.notify_waiters();
    }

    fn pop(&self) -> Option<Message> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        while let Some(message) = messages.pop_front() {
            match message.expires_at {
                Some(at) if at <= now => {}
                _ => return Some(message),
            }
        }
        None
    }

    fn depth(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter(|m| m.expires_at.is_none_or(|at| at > now))
            .count()
    }
}

/// Settlement handle for an in-memory delivery.
pub(crate) struct MemoryAcker {
    queue: Arc<QueueState>,
    message: Option<Message>,
}

impl MemoryAcker {
    pub(crate) fn ack(mut self) {
        let _ = self.message.take();
    }

    pub(crate) fn requeue(mut self) {
        if let Some(mut message) = self.message.take() {
            message.redelivered = true;
            self.queue.push_front(message);
        }
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(mut message) = self.message.take() {
            message.redelivered = true;
            self.queue.push_front(message);
        }
    }
}

struct ConsumerEntry {
    id: u64,
    queue: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, Arc<QueueState>>,
    bindings: Vec<BindingSpec>,
    consumers: HashMap<String, ConsumerEntry>,
}

struct Shared {
    state: Mutex<State>,
    connected: AtomicBool,
    next_consumer: AtomicU64,
}

impl Shared {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    /// Consumer teardown: drop the registration and auto-delete the queue
    /// when this was its last consumer.
    fn release_consumer(&self, tag: &str, id: u64, queue: &Arc<QueueState>) {
        let mut state = self.state.lock();
        if state.consumers.get(tag).is_some_and(|c| c.id == id) {
            let _ = state.consumers.remove(tag);
        }
        if !queue.spec.auto_delete {
            return;
        }
        let name = &queue.spec.name;
        let still_consumed = state.consumers.values().any(|c| &c.queue == name);
        let same_queue = state
            .queues
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, queue));
        if !still_consumed && same_queue {
            debug!(queue = %name, "auto-deleting queue after last consumer");
            let _ = state.queues.remove(name);
            state.bindings.retain(|b| &b.queue != name);
            queue.deleted.cancel();
        }
    }
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A connected, empty broker.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                connected: AtomicBool::new(true),
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate connection loss (`false`) or recovery (`true`).
    ///
    /// Losing the connection ends every consumer stream. Queued messages
    /// and topology survive, as they would on a real broker.
    pub fn set_connected(&self, connected: bool) {
        self.shared.connected.store(connected, Ordering::Release);
        if !connected {
            let consumers: Vec<ConsumerEntry> = {
                let mut state = self.shared.state.lock();
                state.consumers.drain().map(|(_, c)| c).collect()
            };
            for consumer in consumers {
                consumer.cancel.cancel();
            }
        }
    }

    /// Whether a queue currently exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    /// Ready (unexpired, unsettled-excluded) messages in a queue.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        let queue = self.shared.state.lock().queues.get(name).cloned();
        queue.map(|q| q.depth())
    }

    /// Bindings whose destination is `queue`.
    pub fn bindings_for(&self, queue: &str) -> Vec<BindingSpec> {
        self.shared
            .state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .cloned()
            .collect()
    }

    /// Active consumers on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .consumers
            .values()
            .filter(|c| c.queue == queue)
            .count()
    }
}

struct Cursor {
    shared: Arc<Shared>,
    queue: Arc<QueueState>,
    tag: String,
    id: u64,
    cancel: CancellationToken,
}

impl Cursor {
    async fn next(&self) -> Option<Delivery> {
        loop {
            if self.cancel.is_cancelled() || self.queue.deleted.is_cancelled() {
                return None;
            }
            let mut notified = pin!(self.queue.ready.notified());
            let _ = notified.as_mut().enable();
            if let Some(message) = self.queue.pop() {
                return Some(Delivery::new(
                    message.exchange.clone(),
                    message.routing_key.clone(),
                    message.body.clone(),
                    message.redelivered,
                    Acker::Memory(MemoryAcker {
                        queue: Arc::clone(&self.queue),
                        message: Some(message),
                    }),
                ));
            }
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                () = self.queue.deleted.cancelled() => return None,
                () = notified => {}
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.shared.release_consumer(&self.tag, self.id, &self.queue);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.shared.ensure_connected()?;
        let mut state = self.shared.state.lock();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::PreconditionFailed(format!(
                "exchange {} exists with different properties",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                let _ = state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.shared.ensure_connected()?;
        let mut state = self.shared.state.lock();
        match state.queues.get(&spec.name) {
            Some(existing) if &existing.spec != spec => Err(BrokerError::PreconditionFailed(
                format!("queue {} exists with different properties", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                let _ = state
                    .queues
                    .insert(spec.name.clone(), Arc::new(QueueState::new(spec.clone())));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        self.shared.ensure_connected()?;
        let mut state = self.shared.state.lock();
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::ExchangeNotFound(binding.exchange.clone()));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::QueueNotFound(binding.queue.clone()));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.shared.ensure_connected()?;
        let removed = {
            let mut state = self.shared.state.lock();
            state.bindings.retain(|b| b.queue != name);
            state.queues.remove(name)
        };
        if let Some(queue) = removed {
            queue.deleted.cancel();
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.shared.ensure_connected()?;
        let targets: Vec<Arc<QueueState>> = {
            let state = self.shared.state.lock();
            if !state.exchanges.contains_key(exchange) {
                return Err(BrokerError::ExchangeNotFound(exchange.to_owned()));
            }
            let mut names: Vec<&str> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.routing_key, routing_key))
                .map(|b| b.queue.as_str())
                .collect();
            names.sort_unstable();
            names.dedup();
            names
                .into_iter()
                .filter_map(|name| state.queues.get(name).cloned())
                .collect()
        };

        let now = Instant::now();
        for queue in targets {
            queue.push_back(Message {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                body: body.to_vec(),
                redelivered: false,
                expires_at: queue.spec.message_ttl.map(|ttl| now + ttl),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.shared.ensure_connected()?;
        let id = self.shared.next_consumer.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let queue_state = {
            let mut state = self.shared.state.lock();
            let queue_state = state
                .queues
                .get(queue)
                .cloned()
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_owned()))?;
            if state.consumers.contains_key(consumer_tag) {
                return Err(BrokerError::PreconditionFailed(format!(
                    "consumer tag {consumer_tag} already in use"
                )));
            }
            let _ = state.consumers.insert(
                consumer_tag.to_owned(),
                ConsumerEntry {
                    id,
                    queue: queue.to_owned(),
                    cancel: cancel.clone(),
                },
            );
            queue_state
        };

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            queue: queue_state,
            tag: consumer_tag.to_owned(),
            id,
            cancel,
        };
        let stream = futures::stream::unfold(cursor, |cursor| async move {
            let delivery = cursor.next().await?;
            Some((Ok(delivery), cursor))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let entry = self.shared.state.lock().consumers.remove(consumer_tag);
        if let Some(entry) = entry {
            entry.cancel.cancel();
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn status(&self) -> BrokerStatus {
        BrokerStatus {
            ready: self.is_ready(),
            backend: "memory",
            reconnect_attempts: 0,
            last_error: (!self.is_ready()).then(|| "connection lost".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use assert_matches::assert_matches;

    async fn broker_with_queue(spec: QueueSpec, pattern: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::topic("clan.events"))
            .await
            .unwrap();
        let name = spec.name.clone();
        broker.declare_queue(&spec).await.unwrap();
        broker
            .bind_queue(&BindingSpec::new(name, "clan.events", pattern))
            .await
            .unwrap();
        broker
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery within 1s")
            .expect("stream open")
            .unwrap()
    }

    #[tokio::test]
    async fn routes_by_pattern() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "clan.room.r1.*").await;
        broker
            .publish("clan.events", "clan.room.r1.message", b"a")
            .await
            .unwrap();
        broker
            .publish("clan.events", "clan.room.r2.message", b"b")
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), Some(1));

        let mut stream = broker.consume("q", "c1").await.unwrap();
        let delivery = next(&mut stream).await;
        assert_eq!(delivery.body, b"a");
        assert_eq!(delivery.routing_key, "clan.room.r1.message");
        delivery.ack().await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn overlapping_bindings_deliver_once() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "clan.#").await;
        broker
            .bind_queue(&BindingSpec::new("q", "clan.events", "clan.room.*.message"))
            .await
            .unwrap();
        broker
            .publish("clan.events", "clan.room.r1.message", b"x")
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), Some(1));
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        assert_matches!(
            broker.publish("nope", "k", b"").await,
            Err(BrokerError::ExchangeNotFound(_))
        );
    }

    #[tokio::test]
    async fn consume_unknown_queue_fails() {
        let broker = MemoryBroker::new();
        assert_matches!(
            broker.consume("nope", "c").await.map(|_| ()),
            Err(BrokerError::QueueNotFound(_))
        );
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "#").await;
        broker.publish("clan.events", "k", b"x").await.unwrap();
        let mut stream = broker.consume("q", "c1").await.unwrap();
        drop(next(&mut stream).await);
        let again = next(&mut stream).await;
        assert!(again.redelivered);
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn requeue_puts_message_back_for_next_consumer() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "#").await;
        broker.publish("clan.events", "k", b"x").await.unwrap();
        {
            let mut stream = broker.consume("q", "c1").await.unwrap();
            next(&mut stream).await.requeue().await.unwrap();
            broker.cancel("c1").await.unwrap();
            assert!(stream.next().await.is_none());
        }
        assert_eq!(broker.queue_depth("q"), Some(1));
        let mut stream = broker.consume("q", "c2").await.unwrap();
        assert!(next(&mut stream).await.redelivered);
    }

    #[tokio::test]
    async fn reject_discards() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "#").await;
        broker.publish("clan.events", "k", b"x").await.unwrap();
        let mut stream = broker.consume("q", "c1").await.unwrap();
        next(&mut stream).await.reject().await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_skipped() {
        let spec = QueueSpec::durable("q").with_message_ttl(Duration::from_secs(10));
        let broker = broker_with_queue(spec, "#").await;
        broker.publish("clan.events", "k", b"old").await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        broker.publish("clan.events", "k", b"new").await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(1));
        let mut stream = broker.consume("q", "c1").await.unwrap();
        assert_eq!(next(&mut stream).await.body, b"new");
    }

    #[tokio::test]
    async fn auto_delete_queue_goes_with_last_consumer() {
        let broker = broker_with_queue(QueueSpec::ephemeral("room.r1.i1"), "clan.room.r1.*").await;
        let stream = broker.consume("room.r1.i1", "c1").await.unwrap();
        assert!(broker.has_queue("room.r1.i1"));
        drop(stream);
        assert!(!broker.has_queue("room.r1.i1"));
        assert!(broker.bindings_for("room.r1.i1").is_empty());
    }

    #[tokio::test]
    async fn durable_queue_survives_consumer() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "#").await;
        drop(broker.consume("q", "c1").await.unwrap());
        assert!(broker.has_queue("q"));
        assert_eq!(broker.consumer_count("q"), 0);
    }

    #[tokio::test]
    async fn delete_queue_ends_consumers() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "#").await;
        let mut stream = broker.consume("q", "c1").await.unwrap();
        broker.delete_queue("q").await.unwrap();
        assert!(stream.next().await.is_none());
        broker.delete_queue("q").await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_ends_consumers_and_fails_ops() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "#").await;
        let mut stream = broker.consume("q", "c1").await.unwrap();
        broker.set_connected(false);
        assert!(stream.next().await.is_none());
        assert!(!broker.is_ready());
        assert_matches!(
            broker.publish("clan.events", "k", b"").await,
            Err(BrokerError::NotConnected)
        );
        broker.set_connected(true);
        broker.publish("clan.events", "k", b"x").await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(1));
    }

    #[tokio::test]
    async fn duplicate_consumer_tag_rejected() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "#").await;
        let _stream = broker.consume("q", "c1").await.unwrap();
        assert_matches!(
            broker.consume("q", "c1").await.map(|_| ()),
            Err(BrokerError::PreconditionFailed(_))
        );
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let broker = broker_with_queue(QueueSpec::durable("q"), "#").await;
        let mut stream = broker.consume("q", "c1").await.unwrap();
        let publisher = broker.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("clan.events", "k", b"late").await.unwrap();
        });
        assert_eq!(next(&mut stream).await.body, b"late");
    }
}
