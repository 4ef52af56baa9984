//! Gateway push: local session first, per-user queue otherwise.

use std::sync::Arc;

use async_trait::async_trait;
use beacon_broker::{Broker, publish_envelope};
use beacon_core::Notification;
use beacon_core::routing::{NOTIFICATIONS_EXCHANGE, user_notification_key};
use beacon_dispatch::NotificationPusher;
use tracing::{debug, warn};

use crate::bridge::translate::notification_envelope;
use crate::websocket::protocol::ServerMessage;
use crate::websocket::registry::SessionRegistry;

/// [`NotificationPusher`] backed by the session registry.
///
/// When the owner has no local session the notification is published to
/// `notification.user.<userId>`, so the user's durable queue carries it to
/// whichever instance holds the session. Only local delivery counts as
/// delivered.
pub struct SessionPusher {
    registry: Arc<SessionRegistry>,
    broker: Arc<dyn Broker>,
}

impl SessionPusher {
    /// Build a pusher.
    pub fn new(registry: Arc<SessionRegistry>, broker: Arc<dyn Broker>) -> Self {
        Self { registry, broker }
    }

    async fn forward(&self, notification: &Notification) {
        let envelope = match notification_envelope(notification) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(notification_id = %notification.id, error = %err, "failed to wrap notification");
                return;
            }
        };
        let key = user_notification_key(&notification.user_id);
        match publish_envelope(self.broker.as_ref(), NOTIFICATIONS_EXCHANGE, &key, &envelope).await {
            Ok(()) => debug!(user_id = %notification.user_id, "notification forwarded to user queue"),
            Err(err) => warn!(
                user_id = %notification.user_id,
                error = %err,
                "failed to forward notification to user queue"
            ),
        }
    }
}

#[async_trait]
impl NotificationPusher for SessionPusher {
    async fn push(&self, notification: &Notification) -> bool {
        let message = ServerMessage::stored_notification(notification.clone());
        if self.registry.push(&notification.user_id, &message) {
            return true;
        }
        self.forward(notification).await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::tests::session;
    use beacon_broker::{BindingSpec, ExchangeSpec, MemoryBroker, QueueSpec};
    use beacon_core::{NotificationCategory, NotificationId};
    use chrono::Utc;
    use serde_json::json;

    fn notification(user: &str) -> Notification {
        Notification {
            id: NotificationId::new(),
            user_id: user.into(),
            category: NotificationCategory::Credit,
            title: "Credits awarded".into(),
            message: "You earned 5 credits".into(),
            metadata: json!({}),
            priority: 1,
            read_at: None,
            sent: false,
            created_at: Utc::now(),
        }
    }

    async fn broker_with_user_queue(user: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        let queue = beacon_core::routing::user_notification_queue(user);
        broker
            .declare_exchange(&ExchangeSpec::topic(NOTIFICATIONS_EXCHANGE))
            .await
            .unwrap();
        broker.declare_queue(&QueueSpec::durable(&queue)).await.unwrap();
        broker
            .bind_queue(&BindingSpec::new(&queue, NOTIFICATIONS_EXCHANGE, user_notification_key(user)))
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn local_session_is_delivered() {
        let broker = broker_with_user_queue("u1").await;
        let registry = Arc::new(SessionRegistry::new());
        let (s, mut rx) = session("u1", 4);
        let _ = registry.register(s);
        let pusher = SessionPusher::new(registry, Arc::new(broker.clone()));

        assert!(pusher.push(&notification("u1")).await);
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["notification"]["userId"], "u1");
        assert_eq!(broker.queue_depth("notifications.user.u1"), Some(0));
    }

    #[tokio::test]
    async fn offline_user_gets_queued_copy() {
        let broker = broker_with_user_queue("u1").await;
        let pusher = SessionPusher::new(Arc::new(SessionRegistry::new()), Arc::new(broker.clone()));

        assert!(!pusher.push(&notification("u1")).await);
        assert_eq!(broker.queue_depth("notifications.user.u1"), Some(1));
    }

    #[tokio::test]
    async fn broker_down_is_still_just_false() {
        let broker = MemoryBroker::new();
        broker.set_connected(false);
        let pusher = SessionPusher::new(Arc::new(SessionRegistry::new()), Arc::new(broker));
        assert!(!pusher.push(&notification("u1")).await);
    }
}
