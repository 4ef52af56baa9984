//! Shared dependencies handed to every handler.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::NewNotification;
use beacon_store::{CreateOutcome, NotificationStore};
use metrics::counter;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::pusher::NotificationPusher;

/// Default trailing dedup window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Store, push seam and dedup policy.
#[derive(Clone)]
pub struct DispatchContext {
    /// Durable notification store.
    pub store: NotificationStore,
    /// Live-session push.
    pub pusher: Arc<dyn NotificationPusher>,
    /// Suppression window for repeated dedup keys.
    pub dedup_window: Duration,
}

impl DispatchContext {
    /// Build a context.
    pub fn new(store: NotificationStore, pusher: Arc<dyn NotificationPusher>) -> Self {
        Self {
            store,
            pusher,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }

    /// Override the dedup window.
    #[must_use]
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Persist unless suppressed, then push and record the attempt.
    ///
    /// Push outcome never affects the stored row beyond `sent`.
    pub async fn deliver(&self, new: NewNotification, dedup_key: String) -> Result<CreateOutcome> {
        let category = new.category;
        let outcome = self
            .store
            .create_unless_recent(new, dedup_key, self.dedup_window)
            .await?;

        let CreateOutcome::Created(notification) = &outcome else {
            counter!("notifications_suppressed_total").increment(1);
            return Ok(outcome);
        };
        counter!("notifications_created_total", "type" => category.as_str()).increment(1);

        let delivered = self.pusher.push(notification).await;
        debug!(
            user_id = %notification.user_id,
            notification_id = %notification.id,
            delivered,
            "notification pushed"
        );
        if let Err(err) = self.store.mark_sent(&notification.id).await {
            warn!(notification_id = %notification.id, error = %err, "failed to record push attempt");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pusher::MockNotificationPusher;
    use beacon_core::NotificationCategory;

    fn welcome(user: &str) -> NewNotification {
        NewNotification::new(user, NotificationCategory::System, "Welcome", "Hello")
    }

    #[tokio::test]
    async fn created_rows_are_pushed_and_marked_sent() {
        let mut pusher = MockNotificationPusher::new();
        let _ = pusher
            .expect_push()
            .withf(|n| n.user_id == "u1")
            .times(1)
            .return_const(false);
        let store = NotificationStore::open_in_memory().unwrap();
        let ctx = DispatchContext::new(store.clone(), Arc::new(pusher));

        let outcome = ctx.deliver(welcome("u1"), "k".into()).await.unwrap();
        let stored = store.get(&outcome.notification().id).await.unwrap().unwrap();
        assert!(stored.sent);
    }

    #[tokio::test]
    async fn suppressed_rows_are_not_pushed() {
        let mut pusher = MockNotificationPusher::new();
        let _ = pusher.expect_push().times(1).return_const(true);
        let store = NotificationStore::open_in_memory().unwrap();
        let ctx = DispatchContext::new(store, Arc::new(pusher));

        assert!(ctx.deliver(welcome("u1"), "k".into()).await.unwrap().is_created());
        assert!(!ctx.deliver(welcome("u1"), "k".into()).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn zero_window_disables_suppression() {
        let mut pusher = MockNotificationPusher::new();
        let _ = pusher.expect_push().times(2).return_const(false);
        let store = NotificationStore::open_in_memory().unwrap();
        let ctx = DispatchContext::new(store, Arc::new(pusher)).with_dedup_window(Duration::ZERO);

        let _ = ctx.deliver(welcome("u1"), "k".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(ctx.deliver(welcome("u1"), "k".into()).await.unwrap().is_created());
    }
}
