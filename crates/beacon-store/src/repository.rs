//! Notification repository: stateless, every method takes `&Connection`.

use beacon_core::{NewNotification, Notification, NotificationCategory, NotificationId};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::Result;

const COLUMNS: &str =
    "id, user_id, type, title, message, metadata, priority, read_at, sent, created_at";

/// Largest page returned by [`NotificationRepo::list_for_user`].
pub const MAX_LIST_LIMIT: u32 = 200;

/// Filter for listing a user's notifications.
#[derive(Clone, Debug)]
pub struct ListQuery {
    /// Only rows with `read_at IS NULL`.
    pub unread_only: bool,
    /// Page size, clamped to [`MAX_LIST_LIMIT`].
    pub limit: u32,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            unread_only: false,
            limit: 50,
        }
    }
}

/// Fixed-width UTC timestamp; lexicographic order equals time order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Notification SQL.
pub struct NotificationRepo;

impl NotificationRepo {
    /// Insert a new row. `dedup_key` is stored for later suppression checks.
    pub fn insert(
        conn: &Connection,
        new: &NewNotification,
        dedup_key: Option<&str>,
    ) -> Result<Notification> {
        let notification = Notification {
            id: NotificationId::new(),
            user_id: new.user_id.clone(),
            category: new.category,
            title: new.title.clone(),
            message: new.message.clone(),
            metadata: new.metadata.clone(),
            priority: new.priority,
            read_at: None,
            sent: false,
            // Stored with microsecond precision; keep the returned value identical.
            created_at: Utc::now().trunc_subsecs(6),
        };

        let _ = conn.execute(
            "INSERT INTO notifications (id, user_id, type, title, message, metadata,
                 priority, read_at, sent, dedup_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 0, ?8, ?9)",
            params![
                notification.id.as_str(),
                notification.user_id,
                notification.category.as_str(),
                notification.title,
                notification.message,
                notification.metadata,
                notification.priority,
                dedup_key,
                format_ts(notification.created_at),
            ],
        )?;
        Ok(notification)
    }

    /// Fetch one row.
    pub fn get(conn: &Connection, id: &str) -> Result<Option<Notification>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Newest-first page of a user's notifications.
    pub fn list_for_user(
        conn: &Connection,
        user_id: &str,
        query: &ListQuery,
    ) -> Result<Vec<Notification>> {
        let filter = if query.unread_only {
            " AND read_at IS NULL"
        } else {
            ""
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM notifications
             WHERE user_id = ?1{filter}
             ORDER BY created_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, query.limit.clamp(1, MAX_LIST_LIMIT)],
                Self::map_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Unread rows for a user.
    pub fn count_unread(conn: &Connection, user_id: &str) -> Result<u64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read_at IS NULL",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count.unsigned_abs())
    }

    /// Set `read_at` if unset. Returns the row as stored afterwards, or
    /// `None` when no row with that id belongs to `user_id`.
    ///
    /// Marking an already-read row keeps the original timestamp.
    pub fn mark_read(
        conn: &Connection,
        id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        let _ = conn.execute(
            "UPDATE notifications SET read_at = ?1
             WHERE id = ?2 AND user_id = ?3 AND read_at IS NULL",
            params![format_ts(at), id, user_id],
        )?;
        Ok(Self::get(conn, id)?.filter(|n| n.user_id == user_id))
    }

    /// Mark every unread row of a user. Returns how many changed.
    pub fn mark_all_read(conn: &Connection, user_id: &str, at: DateTime<Utc>) -> Result<usize> {
        let changed = conn.execute(
            "UPDATE notifications SET read_at = ?1 WHERE user_id = ?2 AND read_at IS NULL",
            params![format_ts(at), user_id],
        )?;
        Ok(changed)
    }

    /// Record that a push attempt was made.
    pub fn mark_sent(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE notifications SET sent = 1 WHERE id = ?1 AND sent = 0",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Most recent row for `(user_id, dedup_key)` created at or after `since`.
    pub fn find_recent_by_dedup_key(
        conn: &Connection,
        user_id: &str,
        dedup_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM notifications
                     WHERE user_id = ?1 AND dedup_key = ?2 AND created_at >= ?3
                     ORDER BY created_at DESC
                     LIMIT 1"
                ),
                params![user_id, dedup_key, format_ts(since)],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
        let category: String = row.get(2)?;
        let category = category
            .parse::<NotificationCategory>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
        let read_at: Option<String> = row.get(7)?;
        let created_at: String = row.get(9)?;

        Ok(Notification {
            id: NotificationId::from(row.get::<_, String>(0)?),
            user_id: row.get(1)?,
            category,
            title: row.get(3)?,
            message: row.get(4)?,
            metadata: row.get(5)?,
            priority: row.get(6)?,
            read_at: read_at.as_deref().map(|raw| parse_ts(7, raw)).transpose()?,
            sent: row.get(8)?,
            created_at: parse_ts(9, &created_at)?,
        })
    }
}
