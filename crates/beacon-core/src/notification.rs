//! Notification records and the create contract.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::NotificationId;

/// Default priority for new notifications.
pub const DEFAULT_PRIORITY: i64 = 1;

/// Coarse notification category, set by the producing domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationCategory {
    /// Account and platform notices.
    System,
    /// Gig marketplace activity.
    Gig,
    /// Clan and social activity.
    Clan,
    /// Credits and reputation.
    Credit,
}

impl NotificationCategory {
    /// Stored and wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Gig => "GIG",
            Self::Clan => "CLAN",
            Self::Credit => "CREDIT",
        }
    }
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not a known category.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown notification category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for NotificationCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYSTEM" => Ok(Self::System),
            "GIG" => Ok(Self::Gig),
            "CLAN" => Ok(Self::Clan),
            "CREDIT" => Ok(Self::Credit),
            other => Err(UnknownCategory(other.to_owned())),
        }
    }
}

/// One delivery obligation to one user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Generated on creation.
    pub id: NotificationId,
    /// Owner. Never empty.
    pub user_id: String,
    /// Category.
    #[serde(rename = "type")]
    pub category: NotificationCategory,
    /// Short headline.
    pub title: String,
    /// Human-readable body.
    pub message: String,
    /// Structured payload for client rendering.
    pub metadata: Value,
    /// Higher is more important.
    pub priority: i64,
    /// Set once when the user acknowledges; never reverts.
    pub read_at: Option<DateTime<Utc>>,
    /// Whether a push attempt was made.
    pub sent: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Input to `createNotification`.
///
/// The only write path into the store from outside the dispatch engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    /// Owner.
    pub user_id: String,
    /// Category.
    #[serde(rename = "type")]
    pub category: NotificationCategory,
    /// Short headline.
    pub title: String,
    /// Human-readable body.
    pub message: String,
    /// Structured payload; defaults to an empty object.
    #[serde(default = "empty_object")]
    pub metadata: Value,
    /// Defaults to [`DEFAULT_PRIORITY`].
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

impl NewNotification {
    /// Start a notification with default metadata and priority.
    pub fn new(
        user_id: impl Into<String>,
        category: NotificationCategory,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            category,
            title: title.into(),
            message: message.into(),
            metadata: empty_object(),
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Replace the metadata object.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Override the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Check the create contract. Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("userId is required".into());
        }
        if !crate::routing::is_routing_word(&self.user_id) {
            return Err("userId must not contain '.', '*' or '#'".into());
        }
        if self.title.trim().is_empty() {
            return Err("title is required".into());
        }
        if !self.metadata.is_object() {
            return Err("metadata must be a JSON object".into());
        }
        Ok(())
    }
}
