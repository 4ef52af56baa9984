//! Async façade over the repository.
//!
//! Every query runs on tokio's blocking pool so callers on the reactor
//! never wait on `SQLite` I/O directly.

use std::time::Duration;

use beacon_core::{NewNotification, Notification};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tracing::debug;

use crate::connection::{self, ConnectionConfig, ConnectionPool};
use crate::errors::{Result, StoreError};
use crate::migrations::run_migrations;
use crate::repository::{ListQuery, NotificationRepo};

/// Result of a dedup-guarded create.
#[derive(Clone, Debug, PartialEq)]
pub enum CreateOutcome {
    /// A new row was written.
    Created(Notification),
    /// A matching row already existed inside the window; nothing was written.
    Suppressed(Notification),
}

impl CreateOutcome {
    /// The row that now represents this delivery.
    pub fn notification(&self) -> &Notification {
        match self {
            Self::Created(n) | Self::Suppressed(n) => n,
        }
    }

    /// Whether a new row was written.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Durable notification store.
#[derive(Clone)]
pub struct NotificationStore {
    pool: ConnectionPool,
}

impl NotificationStore {
    /// Wrap an existing pool. The schema must already be migrated.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Open a file-backed store and migrate it.
    pub fn open_file(path: &str, config: &ConnectionConfig) -> Result<Self> {
        let pool = connection::new_file(path, config)?;
        let _ = run_migrations(&*pool.get()?)?;
        Ok(Self::new(pool))
    }

    /// Open a migrated in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let pool = connection::new_in_memory(&ConnectionConfig::default())?;
        let _ = run_migrations(&*pool.get()?)?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// `createNotification`: validate and insert unconditionally.
    pub async fn create(&self, new: NewNotification) -> Result<Notification> {
        new.validate().map_err(StoreError::InvalidNotification)?;
        self.run(move |conn| NotificationRepo::insert(conn, &new, None))
            .await
    }

    /// Insert unless a row for the same user and `dedup_key` was created
    /// within `window`. Check and insert share one immediate transaction.
    pub async fn create_unless_recent(
        &self,
        new: NewNotification,
        dedup_key: String,
        window: Duration,
    ) -> Result<CreateOutcome> {
        new.validate().map_err(StoreError::InvalidNotification)?;
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let since = window_start(Utc::now(), window);
            if let Some(existing) =
                NotificationRepo::find_recent_by_dedup_key(&tx, &new.user_id, &dedup_key, since)?
            {
                debug!(
                    user_id = %new.user_id,
                    dedup_key = %dedup_key,
                    existing = %existing.id,
                    "duplicate notification suppressed"
                );
                tx.commit()?;
                return Ok(CreateOutcome::Suppressed(existing));
            }
            let created = NotificationRepo::insert(&tx, &new, Some(&dedup_key))?;
            tx.commit()?;
            Ok(CreateOutcome::Created(created))
        })
        .await
    }

    /// Fetch one notification.
    pub async fn get(&self, id: &str) -> Result<Option<Notification>> {
        let id = id.to_owned();
        self.run(move |conn| NotificationRepo::get(conn, &id)).await
    }

    /// Newest-first page of a user's notifications.
    pub async fn list_for_user(&self, user_id: &str, query: ListQuery) -> Result<Vec<Notification>> {
        let user_id = user_id.to_owned();
        self.run(move |conn| NotificationRepo::list_for_user(conn, &user_id, &query))
            .await
    }

    /// Number of unread notifications for a user.
    pub async fn unread_count(&self, user_id: &str) -> Result<u64> {
        let user_id = user_id.to_owned();
        self.run(move |conn| NotificationRepo::count_unread(conn, &user_id))
            .await
    }

    /// Acknowledge one notification. `None` when absent or not owned.
    pub async fn mark_read(&self, id: &str, user_id: &str) -> Result<Option<Notification>> {
        let (id, user_id) = (id.to_owned(), user_id.to_owned());
        self.run(move |conn| NotificationRepo::mark_read(conn, &id, &user_id, Utc::now()))
            .await
    }

    /// Acknowledge everything a user has.
    pub async fn mark_all_read(&self, user_id: &str) -> Result<usize> {
        let user_id = user_id.to_owned();
        self.run(move |conn| NotificationRepo::mark_all_read(conn, &user_id, Utc::now()))
            .await
    }

    /// Record that a push attempt was made.
    pub async fn mark_sent(&self, id: &str) -> Result<bool> {
        let id = id.to_owned();
        self.run(move |conn| NotificationRepo::mark_sent(conn, &id))
            .await
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<()> {
        self.run(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(())
        })
        .await
    }
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use beacon_core::NotificationCategory;
    use serde_json::json;

    fn owner_alert(user: &str) -> NewNotification {
        NewNotification::new(user, NotificationCategory::Gig, "New application", "Someone applied")
            .with_metadata(json!({"kind": "new_application", "subjectId": "g1"}))
    }

    #[tokio::test]
    async fn create_validates_contract() {
        let store = NotificationStore::open_in_memory().unwrap();
        let bad = NewNotification::new("", NotificationCategory::System, "t", "m");
        assert_matches!(
            store.create(bad).await,
            Err(StoreError::InvalidNotification(_))
        );
    }

    #[tokio::test]
    async fn create_and_list() {
        let store = NotificationStore::open_in_memory().unwrap();
        let created = store.create(owner_alert("u9")).await.unwrap();
        let rows = store.list_for_user("u9", ListQuery::default()).await.unwrap();
        assert_eq!(rows, vec![created]);
        assert_eq!(store.unread_count("u9").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_create_inside_window_is_suppressed() {
        let store = NotificationStore::open_in_memory().unwrap();
        let window = Duration::from_secs(5);
        let first = store
            .create_unless_recent(owner_alert("u9"), "new_application:g1".into(), window)
            .await
            .unwrap();
        let second = store
            .create_unless_recent(owner_alert("u9"), "new_application:g1".into(), window)
            .await
            .unwrap();

        assert!(first.is_created());
        assert_matches!(&second, CreateOutcome::Suppressed(n) if n.id == first.notification().id);
        assert_eq!(
            store.list_for_user("u9", ListQuery::default()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn zero_window_never_suppresses_older_rows() {
        let store = NotificationStore::open_in_memory().unwrap();
        let _ = store
            .create_unless_recent(owner_alert("u9"), "k".into(), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = store
            .create_unless_recent(owner_alert("u9"), "k".into(), Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_created());
    }

    #[tokio::test]
    async fn different_recipients_are_independent() {
        let store = NotificationStore::open_in_memory().unwrap();
        let window = Duration::from_secs(5);
        let a = store
            .create_unless_recent(owner_alert("u9"), "k".into(), window)
            .await
            .unwrap();
        let b = store
            .create_unless_recent(owner_alert("u2"), "k".into(), window)
            .await
            .unwrap();
        assert!(a.is_created() && b.is_created());
    }

    #[tokio::test]
    async fn mark_read_and_sent() {
        let store = NotificationStore::open_in_memory().unwrap();
        let n = store.create(owner_alert("u9")).await.unwrap();
        assert!(store.mark_sent(&n.id).await.unwrap());
        let read = store.mark_read(&n.id, "u9").await.unwrap().unwrap();
        assert!(read.sent);
        assert!(read.read_at.is_some());
        assert_eq!(store.unread_count("u9").await.unwrap(), 0);
        assert!(store.mark_read("missing", "u9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_all_read() {
        let store = NotificationStore::open_in_memory().unwrap();
        let _ = store.create(owner_alert("u9")).await.unwrap();
        let _ = store.create(owner_alert("u9")).await.unwrap();
        assert_eq!(store.mark_all_read("u9").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ping_succeeds() {
        let store = NotificationStore::open_in_memory().unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.db");
        let path = path.to_str().unwrap();
        {
            let store = NotificationStore::open_file(path, &ConnectionConfig::default()).unwrap();
            let _ = store.create(owner_alert("u9")).await.unwrap();
        }
        let reopened = NotificationStore::open_file(path, &ConnectionConfig::default()).unwrap();
        assert_eq!(reopened.unread_count("u9").await.unwrap(), 1);
    }

    #[test]
    fn window_start_saturates() {
        let now = Utc::now();
        assert_eq!(window_start(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(window_start(now, Duration::ZERO), now);
    }
}
