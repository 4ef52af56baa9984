//! Broker envelope → client frame.

use beacon_core::routing::{NOTIFICATION_CREATED, RoomEvent};
use beacon_core::{EventEnvelope, Notification};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::websocket::protocol::{ServerMessage, ServerPayload};

/// A room frame plus the user it must not be echoed to.
#[derive(Debug, PartialEq)]
pub struct RoomFrame {
    /// Frame to broadcast.
    pub message: ServerMessage,
    /// Skip this user's session.
    pub except: Option<String>,
}

/// Translate a room event for `room_id`.
///
/// `None` for events of another room, unknown types, or missing fields.
pub fn room_frame(envelope: &EventEnvelope, room_id: &str) -> Option<RoomFrame> {
    if envelope.str_field("roomId") != Some(room_id) {
        return None;
    }
    let room_id = room_id.to_owned();
    match RoomEvent::from_event_type(&envelope.event_type)? {
        RoomEvent::Message => {
            let sent_at = envelope
                .str_field("sentAt")
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map_or(envelope.timestamp, |t| t.with_timezone(&Utc));
            Some(RoomFrame {
                message: ServerMessage::new(ServerPayload::Chat {
                    room_id,
                    message_id: envelope.str_field("messageId")?.to_owned(),
                    sender_id: envelope.str_field("senderId")?.to_owned(),
                    content: envelope.str_field("content")?.to_owned(),
                    sent_at,
                }),
                except: None,
            })
        }
        RoomEvent::Typing => {
            let user_id = envelope.str_field("userId")?.to_owned();
            let is_typing = envelope.payload.get("isTyping").and_then(Value::as_bool)?;
            Some(RoomFrame {
                message: ServerMessage::new(ServerPayload::TypingIndicator {
                    room_id,
                    user_id: user_id.clone(),
                    is_typing,
                }),
                except: Some(user_id),
            })
        }
        RoomEvent::Read => Some(RoomFrame {
            message: ServerMessage::new(ServerPayload::MessageRead {
                room_id,
                user_id: envelope.str_field("userId")?.to_owned(),
                message_id: envelope.str_field("messageId")?.to_owned(),
            }),
            except: None,
        }),
    }
}

/// Translate a message from a per-user queue.
///
/// `notification.created` envelopes carrying a stored row become a
/// `notification {notification}` frame; anything else is forwarded raw.
pub fn user_frame(envelope: EventEnvelope) -> ServerMessage {
    if envelope.event_type == NOTIFICATION_CREATED {
        if let Some(stored) = envelope
            .payload
            .get("notification")
            .and_then(|v| serde_json::from_value::<Notification>(v.clone()).ok())
        {
            return ServerMessage::stored_notification(stored);
        }
    }
    ServerMessage::raw_event(envelope)
}

/// Wrap a stored row for the per-user queue.
pub fn notification_envelope(notification: &Notification) -> serde_json::Result<EventEnvelope> {
    Ok(EventEnvelope::new(NOTIFICATION_CREATED, beacon_core::routing::GATEWAY_SERVICE)
        .with_field("userId", notification.user_id.clone())
        .with_field("notification", serde_json::to_value(notification)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::routing::GATEWAY_SERVICE;
    use beacon_core::{NotificationCategory, NotificationId};
    use serde_json::json;

    fn room_event(kind: RoomEvent, room: &str) -> EventEnvelope {
        EventEnvelope::new(kind.event_type(), GATEWAY_SERVICE).with_field("roomId", room)
    }

    #[test]
    fn chat_message() {
        let env = room_event(RoomEvent::Message, "r1")
            .with_field("messageId", "m1")
            .with_field("senderId", "ua")
            .with_field("content", "hello")
            .with_field("sentAt", "2026-01-02T03:04:05Z");
        let frame = room_frame(&env, "r1").unwrap();
        assert_eq!(frame.except, None);
        let v = serde_json::to_value(&frame.message).unwrap();
        assert_eq!(v["type"], "chat");
        assert_eq!(v["roomId"], "r1");
        assert_eq!(v["senderId"], "ua");
        assert_eq!(v["sentAt"], "2026-01-02T03:04:05Z");
    }

    #[test]
    fn chat_without_sent_at_uses_envelope_time() {
        let env = room_event(RoomEvent::Message, "r1")
            .with_field("messageId", "m1")
            .with_field("senderId", "ua")
            .with_field("content", "hello");
        let frame = room_frame(&env, "r1").unwrap();
        assert_eq!(
            frame.message.payload,
            ServerPayload::Chat {
                room_id: "r1".into(),
                message_id: "m1".into(),
                sender_id: "ua".into(),
                content: "hello".into(),
                sent_at: env.timestamp,
            }
        );
    }

    #[test]
    fn typing_is_not_echoed_to_typist() {
        let env = room_event(RoomEvent::Typing, "r1")
            .with_field("userId", "ua")
            .with_field("isTyping", true);
        let frame = room_frame(&env, "r1").unwrap();
        assert_eq!(frame.except.as_deref(), Some("ua"));
        assert_eq!(serde_json::to_value(&frame.message).unwrap()["type"], "typing_indicator");
    }

    #[test]
    fn read_receipt() {
        let env = room_event(RoomEvent::Read, "r1")
            .with_field("userId", "ub")
            .with_field("messageId", "m9");
        let v = serde_json::to_value(room_frame(&env, "r1").unwrap().message).unwrap();
        assert_eq!(v["type"], "message_read");
        assert_eq!(v["messageId"], "m9");
    }

    #[test]
    fn other_rooms_and_unknown_types_drop() {
        let env = room_event(RoomEvent::Read, "r2")
            .with_field("userId", "ub")
            .with_field("messageId", "m9");
        assert!(room_frame(&env, "r1").is_none());

        let env = EventEnvelope::new("clan.room.renamed", "clan-service").with_field("roomId", "r1");
        assert!(room_frame(&env, "r1").is_none());

        let incomplete = room_event(RoomEvent::Typing, "r1").with_field("userId", "ua");
        assert!(room_frame(&incomplete, "r1").is_none());
    }

    #[test]
    fn stored_notification_roundtrip() {
        let n = Notification {
            id: NotificationId::new(),
            user_id: "u1".into(),
            category: NotificationCategory::Gig,
            title: "t".into(),
            message: "m".into(),
            metadata: json!({"kind": "gig_created"}),
            priority: 1,
            read_at: None,
            sent: false,
            created_at: Utc::now(),
        };
        let env = notification_envelope(&n).unwrap();
        assert_eq!(env.event_type, NOTIFICATION_CREATED);
        assert_eq!(env.str_field("userId"), Some("u1"));
        assert_eq!(
            user_frame(env).payload,
            ServerMessage::stored_notification(n).payload
        );
    }

    #[test]
    fn other_user_queue_messages_forward_raw() {
        let env = EventEnvelope::new("achievement.unlocked", "credit-service").with_field("userId", "u1");
        let v = serde_json::to_value(user_frame(env)).unwrap();
        assert_eq!(v["event"]["eventType"], "achievement.unlocked");
    }
}
