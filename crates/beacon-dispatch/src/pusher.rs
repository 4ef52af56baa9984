//! Push seam between dispatch and live sessions.

use async_trait::async_trait;
use beacon_core::Notification;

/// Best-effort delivery of a stored notification to its owner.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationPusher: Send + Sync {
    /// Returns `true` only when the notification reached a live session.
    /// Never fails: an offline user is `false`.
    async fn push(&self, notification: &Notification) -> bool;
}

/// Pusher for processes without sessions; always offline.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflinePusher;

#[async_trait]
impl NotificationPusher for OfflinePusher {
    async fn push(&self, _notification: &Notification) -> bool {
        false
    }
}
