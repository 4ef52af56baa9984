//! Client/server wire vocabulary.
//!
//! Every frame is a JSON object tagged by `type` (snake_case) with
//! camelCase fields. Server frames also carry a `timestamp`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use beacon_core::{EventEnvelope, Notification};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest accepted chat message, in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

// ── Client → server ─────────────────────────────────────────────────────────

/// A validated client frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start the per-user notification stream.
    SubscribeNotifications,
    /// Stop the per-user notification stream.
    UnsubscribeNotifications,
    /// Join a chat room.
    SubscribeRoom {
        /// Room to join.
        room_id: String,
    },
    /// Leave a chat room.
    UnsubscribeRoom {
        /// Room to leave.
        room_id: String,
    },
    /// Post a chat message.
    SendMessage {
        /// Target room.
        room_id: String,
        /// Message text.
        content: String,
    },
    /// Typing indicator.
    Typing {
        /// Target room.
        room_id: String,
        /// Started or stopped.
        is_typing: bool,
    },
    /// Read receipt.
    ReadReceipt {
        /// Target room.
        room_id: String,
        /// Last message read.
        message_id: String,
    },
    /// Mark a stored notification read.
    AckNotification {
        /// Notification to acknowledge.
        notification_id: String,
    },
    /// Application-level keepalive.
    Ping,
}

impl ClientMessage {
    /// Every `type` tag the server understands.
    pub const TYPES: [&'static str; 9] = [
        "subscribe_notifications",
        "unsubscribe_notifications",
        "subscribe_room",
        "unsubscribe_room",
        "send_message",
        "typing",
        "read_receipt",
        "ack_notification",
        "ping",
    ];

    /// The room a frame targets, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::SubscribeRoom { room_id }
            | Self::UnsubscribeRoom { room_id }
            | Self::SendMessage { room_id, .. }
            | Self::Typing { room_id, .. }
            | Self::ReadReceipt { room_id, .. } => Some(room_id),
            _ => None,
        }
    }
}

/// Why a client frame was refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, not an object, no `type`, or a known type with bad fields.
    #[error("{0}")]
    InvalidMessage(String),
    /// A `type` outside the vocabulary.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    /// Client-visible error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Self::UnknownType(_) => ErrorCode::UnknownMessageType,
        }
    }
}

/// Parse and validate one text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::InvalidMessage(format!("malformed JSON: {e}")))?;
    let Some(obj) = value.as_object() else {
        return Err(ProtocolError::InvalidMessage("expected a JSON object".into()));
    };
    let Some(kind) = obj.get("type").and_then(Value::as_str) else {
        return Err(ProtocolError::InvalidMessage("missing string field `type`".into()));
    };
    if !ClientMessage::TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_owned()));
    }

    let message: ClientMessage = serde_json::from_value(value.clone())
        .map_err(|e| ProtocolError::InvalidMessage(format!("invalid {kind}: {e}")))?;
    validate(&message)?;
    Ok(message)
}

fn validate(message: &ClientMessage) -> Result<(), ProtocolError> {
    if let Some(room_id) = message.room_id() {
        validate_room_id(room_id)?;
    }
    match message {
        ClientMessage::SendMessage { content, .. } => {
            if content.trim().is_empty() {
                return Err(ProtocolError::InvalidMessage("content must not be empty".into()));
            }
            if content.chars().count() > MAX_CONTENT_CHARS {
                return Err(ProtocolError::InvalidMessage(format!(
                    "content exceeds {MAX_CONTENT_CHARS} characters"
                )));
            }
        }
        ClientMessage::ReadReceipt { message_id, .. } if message_id.is_empty() => {
            return Err(ProtocolError::InvalidMessage("messageId must not be empty".into()));
        }
        ClientMessage::AckNotification { notification_id } if notification_id.is_empty() => {
            return Err(ProtocolError::InvalidMessage(
                "notificationId must not be empty".into(),
            ));
        }
        _ => {}
    }
    Ok(())
}

/// Room ids become routing-key words, so topic metacharacters are refused.
fn validate_room_id(room_id: &str) -> Result<(), ProtocolError> {
    let ok = !room_id.is_empty()
        && room_id.len() <= 128
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::InvalidMessage(format!("invalid roomId: {room_id:?}")))
    }
}

// ── Connect parameters ──────────────────────────────────────────────────────

/// Which product surface a session serves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    /// Notification stream (default).
    #[default]
    Notifications,
    /// Clan chat rooms.
    ClanChat,
    /// Gig updates.
    Gig,
}

impl ServiceType {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notifications => "notifications",
            Self::ClanChat => "clan-chat",
            Self::Gig => "gig",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notifications" => Ok(Self::Notifications),
            "clan-chat" => Ok(Self::ClanChat),
            "gig" => Ok(Self::Gig),
            other => Err(format!("unknown serviceType: {other}")),
        }
    }
}

// ── Server → client ─────────────────────────────────────────────────────────

/// Client-visible error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed frame or bad field.
    InvalidMessage,
    /// `type` outside the vocabulary.
    UnknownMessageType,
    /// Broker not ready or publish failed.
    BrokerUnavailable,
    /// Operation needs a subscription the session does not hold.
    NotSubscribed,
    /// Referenced entity does not exist for this user.
    NotFound,
    /// Anything else; details stay in the log.
    InternalError,
}

/// Which stream a `subscription_confirmed` refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// The per-user notification stream.
    Notifications,
    /// A chat room.
    Room,
}

/// Server frame body, tagged by `type`. Field names are the wire contract.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerPayload {
    /// First frame of every session.
    Connected {
        user_id: String,
        service_type: ServiceType,
        session_id: String,
    },
    /// A stored notification, or a raw platform event.
    Notification {
        #[serde(skip_serializing_if = "Option::is_none")]
        notification: Option<Box<Notification>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<Box<EventEnvelope>>,
    },
    /// Chat message in a room.
    Chat {
        room_id: String,
        message_id: String,
        sender_id: String,
        content: String,
        sent_at: DateTime<Utc>,
    },
    /// Another member's typing state.
    TypingIndicator {
        room_id: String,
        user_id: String,
        is_typing: bool,
    },
    /// Another member's read position.
    MessageRead {
        room_id: String,
        user_id: String,
        message_id: String,
    },
    /// Result of a subscribe or unsubscribe.
    SubscriptionConfirmed {
        channel: Channel,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        subscribed: bool,
    },
    /// A refused client frame or failed operation.
    Error { code: ErrorCode, message: String },
    /// Reply to `ping`.
    Pong,
}

/// A timestamped server frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServerMessage {
    /// Body.
    #[serde(flatten)]
    pub payload: ServerPayload,
    /// When the server produced the frame.
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    /// Stamp a payload with the current time.
    pub fn new(payload: ServerPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    /// First frame of a session.
    pub fn connected(user_id: &str, service_type: ServiceType, session_id: &str) -> Self {
        Self::new(ServerPayload::Connected {
            user_id: user_id.to_owned(),
            service_type,
            session_id: session_id.to_owned(),
        })
    }

    /// A persisted notification.
    pub fn stored_notification(notification: Notification) -> Self {
        Self::new(ServerPayload::Notification {
            notification: Some(Box::new(notification)),
            event: None,
        })
    }

    /// A platform event forwarded as-is.
    pub fn raw_event(event: EventEnvelope) -> Self {
        Self::new(ServerPayload::Notification {
            notification: None,
            event: Some(Box::new(event)),
        })
    }

    /// Notification stream (un)subscribed.
    pub fn notifications_confirmed(subscribed: bool) -> Self {
        Self::new(ServerPayload::SubscriptionConfirmed {
            channel: Channel::Notifications,
            room_id: None,
            subscribed,
        })
    }

    /// Room (un)subscribed.
    pub fn room_confirmed(room_id: &str, subscribed: bool) -> Self {
        Self::new(ServerPayload::SubscriptionConfirmed {
            channel: Channel::Room,
            room_id: Some(room_id.to_owned()),
            subscribed,
        })
    }

    /// Typed error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ServerPayload::Error {
            code,
            message: message.into(),
        })
    }

    /// Reply to `ping`.
    pub fn pong() -> Self {
        Self::new(ServerPayload::Pong)
    }

    /// Serialize once for every recipient.
    pub fn encode(&self) -> Result<Arc<String>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::new)
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}
