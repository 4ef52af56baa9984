//! Broker ↔ session bridge.
//!
//! Three kinds of broker subscriptions feed live sessions:
//!
//! - **user**: durable `notifications.user.<userId>` queue, one consumer per
//!   subscribed session. A message for an offline user is requeued and the
//!   consumer stops, so the queue keeps it for the user's next connection.
//!   A full send queue requeues and pauses instead.
//! - **room**: auto-delete `room.<roomId>.<instanceId>` queue shared by every
//!   local member of the room; deleted when the last member leaves.
//! - **fanout**: one auto-delete `fanout.<instanceId>` queue bound to every
//!   platform event; targets are extracted from the payload.
//!
//! Every consumer task re-declares its queue and re-consumes after a broker
//! reconnect until it is cancelled.

pub mod targets;
pub mod translate;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use beacon_broker::{
    BindingSpec, Broker, BrokerError, Delivery, ExchangeSpec, QueueSpec, wait_until_ready,
};
use beacon_core::SessionId;
use beacon_core::routing::{
    self, Domain, NOTIFICATIONS_EXCHANGE, PLATFORM_EXCHANGE, user_notification_key,
    user_notification_queue,
};
use futures::StreamExt;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::metrics::{BRIDGE_EVENTS_TOTAL, BRIDGE_SUBSCRIPTIONS_ACTIVE};
use crate::websocket::connection::Session;
use crate::websocket::protocol::ServerMessage;
use crate::websocket::registry::{PushOutcome, SessionRegistry};

/// Bridge failures surfaced to the session handler.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Broker not ready within the bound, or a declare failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The session was superseded, or the room emptied, while the broker
    /// was awaited.
    #[error("no registered session holds this subscription")]
    Stale,

    /// The user id cannot be used as a routing-key word.
    #[error("user id {0:?} is not a routing word")]
    UnroutableUser(String),
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge settings.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Instance-unique suffix for ephemeral queues and consumer tags.
    pub instance_id: String,
    /// Bounded readiness wait on subscribe.
    pub ready_timeout: Duration,
    /// Readiness poll interval.
    pub ready_poll: Duration,
    /// `x-message-ttl` on user queues.
    pub user_message_ttl: Duration,
    /// `x-expires` on user queues.
    pub user_queue_expiry: Duration,
    /// Pause after a failed declare or consume.
    pub retry_delay: Duration,
}

impl BridgeConfig {
    /// Derive from server settings.
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            ready_timeout: config.broker_ready_timeout(),
            ready_poll: config.broker_ready_poll(),
            user_message_ttl: Duration::from_secs(config.user_queue_ttl_secs),
            user_queue_expiry: Duration::from_secs(config.user_queue_expiry_secs),
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_server_config(&ServerConfig::default())
    }
}

/// Queue, binding and consumer tag for one subscription.
#[derive(Clone, Debug)]
struct Wiring {
    queue: QueueSpec,
    binding: BindingSpec,
    tag: String,
}

impl Wiring {
    async fn declare(&self, broker: &dyn Broker) -> beacon_broker::Result<()> {
        broker
            .declare_exchange(&ExchangeSpec::topic(self.binding.exchange.clone()))
            .await?;
        broker.declare_queue(&self.queue).await?;
        broker.bind_queue(&self.binding).await
    }
}

/// Where a subscription's messages go.
#[derive(Clone, Debug)]
enum Sink {
    User(String),
    Room(String),
    Fanout(Arc<BTreeSet<String>>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Backoff,
    Stop,
}

impl Sink {
    fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Room(_) => "room",
            Self::Fanout(_) => "fanout",
        }
    }

    async fn deliver(&self, registry: &SessionRegistry, delivery: Delivery) -> Flow {
        let kind = self.kind();
        let envelope = match delivery.envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(kind, routing_key = %delivery.routing_key, error = %err, "unparseable bridge message");
                counter!(BRIDGE_EVENTS_TOTAL, "kind" => kind, "outcome" => "invalid").increment(1);
                settle(delivery.reject().await);
                return Flow::Continue;
            }
        };

        let (outcome, flow) = match self {
            Self::User(user_id) => match registry.try_push(user_id, &translate::user_frame(envelope)) {
                PushOutcome::Delivered => {
                    settle(delivery.ack().await);
                    ("delivered", Flow::Continue)
                }
                PushOutcome::Full => {
                    debug!(user_id = %user_id, "send queue full, message returned to queue");
                    settle(delivery.requeue().await);
                    ("backoff", Flow::Backoff)
                }
                PushOutcome::Offline => {
                    debug!(user_id = %user_id, "session gone, message returned to queue");
                    settle(delivery.requeue().await);
                    ("requeued", Flow::Stop)
                }
            },
            Self::Room(room_id) => {
                let outcome = match translate::room_frame(&envelope, room_id) {
                    Some(frame) => {
                        let _ = registry.broadcast_room(room_id, &frame.message, frame.except.as_deref());
                        "delivered"
                    }
                    None => "dropped",
                };
                settle(delivery.ack().await);
                (outcome, Flow::Continue)
            }
            Self::Fanout(skip) => {
                let outcome = if skip.contains(&envelope.event_type) {
                    "skipped"
                } else {
                    fan_out(registry, envelope)
                };
                settle(delivery.ack().await);
                (outcome, Flow::Continue)
            }
        };
        counter!(BRIDGE_EVENTS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
        flow
    }
}

fn fan_out(registry: &SessionRegistry, envelope: beacon_core::EventEnvelope) -> &'static str {
    let local: Vec<_> = targets::extract_targets(&envelope)
        .iter()
        .filter_map(|user| registry.get(user))
        .collect();
    if local.is_empty() {
        return "dropped";
    }
    match ServerMessage::raw_event(envelope).encode() {
        Ok(frame) => {
            for session in local {
                let _ = session.send_raw(frame.clone());
            }
            "delivered"
        }
        Err(err) => {
            warn!(error = %err, "failed to encode fanout frame");
            "dropped"
        }
    }
}

fn settle(result: beacon_broker::Result<()>) {
    if let Err(err) = result {
        warn!(error = %err, "failed to settle bridge delivery");
    }
}

struct Subscription {
    owner: Option<SessionId>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every broker subscription that feeds local sessions.
pub struct SubscriptionBridge {
    broker: Arc<dyn Broker>,
    registry: Arc<SessionRegistry>,
    config: BridgeConfig,
    skip: Arc<BTreeSet<String>>,
    users: parking_lot::Mutex<HashMap<String, Subscription>>,
    rooms: tokio::sync::Mutex<HashMap<String, Subscription>>,
    tag_seq: AtomicU64,
    cancel: CancellationToken,
}

impl SubscriptionBridge {
    /// Build a bridge.
    ///
    /// `handled_event_types` are the routing keys the dispatch engine owns;
    /// target extraction skips them. `cancel` ends every consumer.
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<SessionRegistry>,
        config: BridgeConfig,
        handled_event_types: BTreeSet<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker,
            registry,
            config,
            skip: Arc::new(handled_event_types),
            users: parking_lot::Mutex::new(HashMap::new()),
            rooms: tokio::sync::Mutex::new(HashMap::new()),
            tag_seq: AtomicU64::new(0),
            cancel,
        }
    }

    /// Bridge settings.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn next_tag(&self, label: &str) -> String {
        let seq = self.tag_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}.{label}.{seq}", self.config.instance_id)
    }

    fn user_wiring(&self, user_id: &str) -> Wiring {
        let queue = user_notification_queue(user_id);
        Wiring {
            binding: BindingSpec::new(&queue, NOTIFICATIONS_EXCHANGE, user_notification_key(user_id)),
            queue: QueueSpec::durable(queue)
                .with_message_ttl(self.config.user_message_ttl)
                .with_expires(self.config.user_queue_expiry),
            tag: self.next_tag(&format!("user.{user_id}")),
        }
    }

    fn room_wiring(&self, room_id: &str) -> Wiring {
        let queue = routing::room_queue(room_id, &self.config.instance_id);
        Wiring {
            binding: BindingSpec::new(&queue, Domain::Clan.exchange(), routing::room_binding_pattern(room_id)),
            queue: QueueSpec::ephemeral(queue),
            tag: self.next_tag(&format!("room.{room_id}")),
        }
    }

    fn fanout_wiring(&self) -> Wiring {
        let queue = routing::fanout_queue(&self.config.instance_id);
        Wiring {
            binding: BindingSpec::new(&queue, PLATFORM_EXCHANGE, "#"),
            queue: QueueSpec::ephemeral(queue),
            tag: self.next_tag("fanout"),
        }
    }

    async fn declare_now(&self, wiring: &Wiring) -> Result<()> {
        wait_until_ready(self.broker.as_ref(), self.config.ready_timeout, self.config.ready_poll).await?;
        wiring.declare(self.broker.as_ref()).await?;
        Ok(())
    }

    fn spawn(&self, wiring: Wiring, sink: Sink, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run_subscription(
            Arc::clone(&self.broker),
            Arc::clone(&self.registry),
            wiring,
            sink,
            self.config.clone(),
            cancel,
        ))
    }

    /// Start the session's per-user notification consumer.
    ///
    /// Waits (bounded) for the broker, declares the durable user queue, then
    /// consumes in the background. Replaces any earlier consumer for the user.
    /// Fails with [`BridgeError::Stale`] when the session stopped being
    /// current during the wait.
    pub async fn subscribe_notifications(&self, session: &Session) -> Result<()> {
        if !routing::is_routing_word(&session.user_id) {
            return Err(BridgeError::UnroutableUser(session.user_id.clone()));
        }
        let wiring = self.user_wiring(&session.user_id);
        self.declare_now(&wiring).await?;

        let previous = {
            let mut users = self.users.lock();
            // Checked under the users lock so a concurrent release_session
            // either sees this entry or runs before it exists.
            if !self.registry.is_current(session) {
                return Err(BridgeError::Stale);
            }
            let cancel = self.cancel.child_token();
            let handle = self.spawn(wiring, Sink::User(session.user_id.clone()), cancel.clone());
            users.insert(
                session.user_id.clone(),
                Subscription {
                    owner: Some(session.id.clone()),
                    cancel,
                    handle,
                },
            )
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        info!(user_id = %session.user_id, "notification subscription started");
        Ok(())
    }

    /// Stop the session's notification consumer. The durable queue stays.
    ///
    /// Returns `false` when the running consumer belongs to another session.
    pub fn unsubscribe_notifications(&self, session: &Session) -> bool {
        let removed = {
            let mut users = self.users.lock();
            let owned = users
                .get(&session.user_id)
                .is_some_and(|sub| sub.owner.as_ref() == Some(&session.id));
            if owned {
                users.remove(&session.user_id)
            } else {
                None
            }
        };
        match removed {
            Some(sub) => {
                sub.cancel.cancel();
                info!(user_id = %session.user_id, "notification subscription stopped");
                true
            }
            None => false,
        }
    }

    /// Whether a notification consumer is running for the user.
    pub fn has_user_subscription(&self, user_id: &str) -> bool {
        self.users
            .lock()
            .get(user_id)
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Make sure this instance consumes the room's events.
    ///
    /// Fails with [`BridgeError::Stale`] when the room has no local member
    /// by the time the broker is ready.
    pub async fn ensure_room(&self, room_id: &str) -> Result<()> {
        wait_until_ready(self.broker.as_ref(), self.config.ready_timeout, self.config.ready_poll).await?;

        let mut rooms = self.rooms.lock().await;
        if !self.registry.has_room(room_id) {
            return Err(BridgeError::Stale);
        }
        if rooms.get(room_id).is_some_and(|s| !s.handle.is_finished()) {
            return Ok(());
        }
        let wiring = self.room_wiring(room_id);
        wiring.declare(self.broker.as_ref()).await?;

        let cancel = self.cancel.child_token();
        let handle = self.spawn(wiring, Sink::Room(room_id.to_owned()), cancel.clone());
        if let Some(stale) = rooms.insert(
            room_id.to_owned(),
            Subscription {
                owner: None,
                cancel,
                handle,
            },
        ) {
            stale.cancel.cancel();
        }
        info!(room_id, "room subscription started");
        Ok(())
    }

    /// Stop consuming a room and delete its queue, unless a local member
    /// rejoined in the meantime. Delete failures are logged only.
    pub async fn release_room(&self, room_id: &str) {
        let mut rooms = self.rooms.lock().await;
        if self.registry.has_room(room_id) {
            return;
        }
        let Some(sub) = rooms.remove(room_id) else {
            return;
        };
        sub.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(1), sub.handle).await.is_err() {
            warn!(room_id, "room consumer did not stop in time");
        }
        let queue = routing::room_queue(room_id, &self.config.instance_id);
        if let Err(err) = self.broker.delete_queue(&queue).await {
            warn!(room_id, queue = %queue, error = %err, "failed to delete room queue");
        }
        info!(room_id, "room subscription released");
    }

    /// Whether a room consumer is running.
    pub async fn has_room_subscription(&self, room_id: &str) -> bool {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Tear down whatever a removed session held.
    pub async fn release_session(&self, session: &Session, notifications: bool, emptied_rooms: &[String]) {
        if notifications {
            let _ = self.unsubscribe_notifications(session);
        }
        for room in emptied_rooms {
            self.release_room(room).await;
        }
    }

    /// Start the instance's target-extraction consumer.
    pub fn spawn_fanout(&self) -> JoinHandle<()> {
        let sink = Sink::Fanout(Arc::clone(&self.skip));
        self.spawn(self.fanout_wiring(), sink, self.cancel.child_token())
    }
}

/// Consume one subscription until cancelled or told to stop.
async fn run_subscription(
    broker: Arc<dyn Broker>,
    registry: Arc<SessionRegistry>,
    wiring: Wiring,
    sink: Sink,
    config: BridgeConfig,
    cancel: CancellationToken,
) {
    let kind = sink.kind();
    let queue = wiring.queue.name.clone();
    gauge!(BRIDGE_SUBSCRIPTIONS_ACTIVE, "kind" => kind).increment(1.0);

    'outer: loop {
        let ready = tokio::select! {
            () = cancel.cancelled() => break,
            r = wait_until_ready(broker.as_ref(), Duration::from_secs(60), config.ready_poll) => r,
        };
        if ready.is_err() {
            continue;
        }

        let consumed = match wiring.declare(broker.as_ref()).await {
            Ok(()) => broker.consume(&queue, &wiring.tag).await,
            Err(err) => Err(err),
        };
        let mut stream = match consumed {
            Ok(stream) => stream,
            Err(err) => {
                warn!(kind, queue = %queue, error = %err, "bridge subscribe failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(config.retry_delay) => continue,
                }
            }
        };
        debug!(kind, queue = %queue, "bridge consumer started");

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };
            match next {
                None => break 'outer,
                Some(Some(Ok(delivery))) => match sink.deliver(&registry, delivery).await {
                    Flow::Continue => {}
                    Flow::Backoff => tokio::select! {
                        () = cancel.cancelled() => break 'outer,
                        () = tokio::time::sleep(config.retry_delay) => {}
                    },
                    Flow::Stop => break 'outer,
                },
                Some(Some(Err(err))) => {
                    warn!(kind, queue = %queue, error = %err, "bridge stream error");
                    break;
                }
                Some(None) => {
                    debug!(kind, queue = %queue, "bridge stream ended, re-consuming");
                    break;
                }
            }
        }
    }

    if let Err(err) = broker.cancel(&wiring.tag).await {
        debug!(kind, queue = %queue, error = %err, "bridge consumer cancel failed");
    }
    gauge!(BRIDGE_SUBSCRIPTIONS_ACTIVE, "kind" => kind).decrement(1.0);
    debug!(kind, queue = %queue, "bridge consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::tests::session;
    use assert_matches::assert_matches;
    use beacon_broker::{MemoryBroker, publish_envelope};
    use beacon_core::EventEnvelope;
    use beacon_core::routing::{GATEWAY_SERVICE, RoomEvent};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        broker: MemoryBroker,
        registry: Arc<SessionRegistry>,
        bridge: SubscriptionBridge,
    }

    fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let registry = Arc::new(SessionRegistry::new());
        let config = BridgeConfig {
            instance_id: "i1".into(),
            ready_timeout: Duration::from_millis(300),
            ready_poll: Duration::from_millis(10),
            retry_delay: Duration::from_millis(20),
            ..BridgeConfig::default()
        };
        let bridge = SubscriptionBridge::new(
            Arc::new(broker.clone()),
            registry.clone(),
            config,
            BTreeSet::from(["gig_completed".to_owned()]),
            CancellationToken::new(),
        );
        Fixture {
            broker,
            registry,
            bridge,
        }
    }

    async fn next_json(rx: &mut mpsc::Receiver<Arc<String>>) -> serde_json::Value {
        let frame = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("session channel closed");
        serde_json::from_str(&frame).unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn user_queue_delivers_to_session() {
        let f = fixture();
        let (s, mut rx) = session("u1", 8);
        let _ = f.registry.register(s.clone());
        f.bridge.subscribe_notifications(&s).await.unwrap();

        assert!(f.broker.has_queue("notifications.user.u1"));
        let env = EventEnvelope::new("achievement.unlocked", "credit-service").with_field("userId", "u1");
        publish_envelope(&f.broker, NOTIFICATIONS_EXCHANGE, "notification.user.u1", &env)
            .await
            .unwrap();

        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "notification");
        assert_eq!(frame["event"]["eventType"], "achievement.unlocked");
        eventually(|| f.broker.queue_depth("notifications.user.u1") == Some(0)).await;
    }

    #[tokio::test]
    async fn undeliverable_message_is_kept_and_consumer_stops() {
        let f = fixture();
        let (s, _rx) = session("u1", 8);
        let _ = f.registry.register(s.clone());
        f.bridge.subscribe_notifications(&s).await.unwrap();
        let _ = f.registry.unregister(&s);

        let env = EventEnvelope::new("achievement.unlocked", "credit-service");
        publish_envelope(&f.broker, NOTIFICATIONS_EXCHANGE, "notification.user.u1", &env)
            .await
            .unwrap();

        eventually(|| !f.bridge.has_user_subscription("u1")).await;
        assert_eq!(f.broker.queue_depth("notifications.user.u1"), Some(1));
    }

    #[tokio::test]
    async fn full_send_queue_backs_off_without_dropping_subscription() {
        let f = fixture();
        let (s, mut rx) = session("u1", 1);
        let _ = f.registry.register(s.clone());
        f.bridge.subscribe_notifications(&s).await.unwrap();

        for n in 0..3 {
            let env = EventEnvelope::new("achievement.unlocked", "credit-service").with_field("n", n);
            publish_envelope(&f.broker, NOTIFICATIONS_EXCHANGE, "notification.user.u1", &env)
                .await
                .unwrap();
        }
        for n in 0..3 {
            assert_eq!(next_json(&mut rx).await["event"]["n"], n);
        }
        assert!(f.bridge.has_user_subscription("u1"));

        let env = EventEnvelope::new("achievement.unlocked", "credit-service").with_field("n", 3);
        publish_envelope(&f.broker, NOTIFICATIONS_EXCHANGE, "notification.user.u1", &env)
            .await
            .unwrap();
        assert_eq!(next_json(&mut rx).await["event"]["n"], 3);
        assert!(f.bridge.has_user_subscription("u1"));
        eventually(|| f.broker.queue_depth("notifications.user.u1") == Some(0)).await;
    }

    #[tokio::test]
    async fn wildcard_user_cannot_bind_user_queue() {
        let f = fixture();
        let (s, _rx) = session("#.#", 8);
        let _ = f.registry.register(s.clone());
        let err = f.bridge.subscribe_notifications(&s).await.unwrap_err();
        assert_matches!(err, BridgeError::UnroutableUser(_));
        assert!(f.broker.bindings_for("notifications.user.#.#").is_empty());
        assert!(!f.bridge.has_user_subscription("#.#"));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_session_does_not_start_consumers() {
        let f = fixture();
        f.broker.set_connected(false);
        let (old, _rx1) = session("u1", 8);
        let _ = f.registry.register(old.clone());
        let _ = f.registry.join_room(&old, "r1");

        let bridge = Arc::new(f.bridge);
        let pending = {
            let (bridge, old) = (Arc::clone(&bridge), old.clone());
            tokio::spawn(async move {
                let user = bridge.subscribe_notifications(&old).await;
                let room = bridge.ensure_room("r1").await;
                (user, room)
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (new, _rx2) = session("u1", 8);
        let _ = f.registry.register(new);
        f.broker.set_connected(true);

        let (user, room) = pending.await.unwrap();
        assert_matches!(user, Err(BridgeError::Stale));
        assert_matches!(room, Err(BridgeError::Stale));
        assert!(!bridge.has_user_subscription("u1"));
        assert!(!bridge.has_room_subscription("r1").await);
        assert!(!f.broker.has_queue("room.r1.i1"));
    }

    #[tokio::test]
    async fn unsubscribe_keeps_durable_queue() {
        let f = fixture();
        let (s, _rx) = session("u1", 8);
        let _ = f.registry.register(s.clone());
        f.bridge.subscribe_notifications(&s).await.unwrap();

        assert!(f.bridge.unsubscribe_notifications(&s));
        assert!(!f.bridge.unsubscribe_notifications(&s));
        eventually(|| f.broker.consumer_count("notifications.user.u1") == 0).await;
        assert!(f.broker.has_queue("notifications.user.u1"));
    }

    #[tokio::test]
    async fn stale_session_cannot_cancel_newer_subscription() {
        let f = fixture();
        let (old, _rx1) = session("u1", 8);
        let (new, _rx2) = session("u1", 8);
        let _ = f.registry.register(old.clone());
        f.bridge.subscribe_notifications(&old).await.unwrap();
        let _ = f.registry.register(new.clone());
        f.bridge.subscribe_notifications(&new).await.unwrap();

        assert!(!f.bridge.unsubscribe_notifications(&old));
        assert!(f.bridge.has_user_subscription("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_fails_when_broker_unreachable() {
        let f = fixture();
        f.broker.set_connected(false);
        let (s, _rx) = session("u1", 8);
        let _ = f.registry.register(s.clone());
        let err = f.bridge.subscribe_notifications(&s).await.unwrap_err();
        assert_matches!(err, BridgeError::Broker(BrokerError::NotReady { .. }));
        assert!(!f.bridge.has_user_subscription("u1"));
    }

    #[tokio::test]
    async fn room_events_reach_members_filtered_by_room() {
        let f = fixture();
        let (a, mut ra) = session("ua", 8);
        let (b, mut rb) = session("ub", 8);
        let _ = f.registry.register(a.clone());
        let _ = f.registry.register(b.clone());
        let _ = f.registry.join_room(&a, "r1");
        let _ = f.registry.join_room(&b, "r1");
        f.bridge.ensure_room("r1").await.unwrap();
        f.bridge.ensure_room("r1").await.unwrap();
        assert_eq!(f.broker.consumer_count("room.r1.i1"), 1);

        let typing = EventEnvelope::new(RoomEvent::Typing.event_type(), GATEWAY_SERVICE)
            .with_field("roomId", "r1")
            .with_field("userId", "ua")
            .with_field("isTyping", true);
        publish_envelope(&f.broker, Domain::Clan.exchange(), &RoomEvent::Typing.routing_key("r1"), &typing)
            .await
            .unwrap();

        let frame = next_json(&mut rb).await;
        assert_eq!(frame["type"], "typing_indicator");
        assert_eq!(frame["userId"], "ua");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn release_room_deletes_queue_only_when_empty() {
        let f = fixture();
        let (a, _ra) = session("ua", 8);
        let _ = f.registry.register(a.clone());
        let _ = f.registry.join_room(&a, "r1");
        f.bridge.ensure_room("r1").await.unwrap();

        f.bridge.release_room("r1").await;
        assert!(f.bridge.has_room_subscription("r1").await);

        let _ = f.registry.leave_room(&a, "r1");
        f.bridge.release_room("r1").await;
        assert!(!f.bridge.has_room_subscription("r1").await);
        assert!(!f.broker.has_queue("room.r1.i1"));
    }

    #[tokio::test]
    async fn fanout_targets_local_users_and_skips_dispatch_types() {
        let f = fixture();
        let (poster, mut rp) = session("u9", 8);
        let _ = f.registry.register(poster.clone());
        let _fanout = f.bridge.spawn_fanout();
        eventually(|| f.broker.consumer_count("fanout.i1") == 1).await;

        let skipped = EventEnvelope::new("gig_completed", "gig-service").with_field("ownerId", "u9");
        publish_envelope(&f.broker, PLATFORM_EXCHANGE, "gig_completed", &skipped)
            .await
            .unwrap();
        let applied = EventEnvelope::new("gig_applied", "gig-service")
            .with_field("posterId", "u9")
            .with_field("applicantId", "offline-user");
        publish_envelope(&f.broker, PLATFORM_EXCHANGE, "gig_applied", &applied)
            .await
            .unwrap();

        let frame = next_json(&mut rp).await;
        assert_eq!(frame["event"]["eventType"], "gig_applied");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rp.try_recv().is_err());
    }

    #[tokio::test]
    async fn room_consumer_resumes_after_reconnect() {
        let f = fixture();
        let (a, mut ra) = session("ua", 8);
        let (b, _rb) = session("ub", 8);
        let _ = f.registry.register(a.clone());
        let _ = f.registry.register(b.clone());
        let _ = f.registry.join_room(&a, "r1");
        f.bridge.ensure_room("r1").await.unwrap();

        f.broker.set_connected(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        f.broker.set_connected(true);
        eventually(|| f.broker.consumer_count("room.r1.i1") == 1).await;

        let read = EventEnvelope::new(RoomEvent::Read.event_type(), GATEWAY_SERVICE)
            .with_field("roomId", "r1")
            .with_field("userId", "ub")
            .with_field("messageId", "m1");
        publish_envelope(&f.broker, Domain::Clan.exchange(), &RoomEvent::Read.routing_key("r1"), &read)
            .await
            .unwrap();
        assert_eq!(next_json(&mut ra).await["type"], "message_read");
    }
}
