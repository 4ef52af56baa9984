//! Client frame handling.

use std::sync::Arc;

use beacon_broker::publish_envelope;
use beacon_core::EventEnvelope;
use beacon_core::routing::{Domain, GATEWAY_SERVICE, RoomEvent};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, instrument, warn};

use super::connection::Session;
use super::protocol::{ClientMessage, ErrorCode, ServerMessage, parse_client_message};
use super::registry::{JoinOutcome, LeaveOutcome};
use crate::bridge::BridgeError;
use crate::server::AppState;

/// Handle one text frame. Returns the direct reply, if any.
///
/// Room events are not echoed here; members (the sender included) receive
/// them back through the room queue.
#[instrument(skip_all, fields(user_id = %session.user_id))]
pub async fn handle_message(text: &str, session: &Arc<Session>, state: &AppState) -> Option<ServerMessage> {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "rejected client frame");
            return Some(err.into());
        }
    };

    match message {
        ClientMessage::Ping => Some(ServerMessage::pong()),
        ClientMessage::SubscribeNotifications => Some(subscribe_notifications(session, state).await),
        ClientMessage::UnsubscribeNotifications => Some(unsubscribe_notifications(session, state)),
        ClientMessage::SubscribeRoom { room_id } => Some(subscribe_room(session, state, &room_id).await),
        ClientMessage::UnsubscribeRoom { room_id } => Some(unsubscribe_room(session, state, &room_id).await),
        ClientMessage::SendMessage { room_id, content } => {
            let envelope = EventEnvelope::new(RoomEvent::Message.event_type(), GATEWAY_SERVICE)
                .with_field("roomId", room_id.clone())
                .with_field("messageId", uuid::Uuid::now_v7().to_string())
                .with_field("senderId", session.user_id.clone())
                .with_field("content", content)
                .with_field("sentAt", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
            publish_room_event(session, state, &room_id, RoomEvent::Message, envelope).await
        }
        ClientMessage::Typing { room_id, is_typing } => {
            let envelope = EventEnvelope::new(RoomEvent::Typing.event_type(), GATEWAY_SERVICE)
                .with_field("roomId", room_id.clone())
                .with_field("userId", session.user_id.clone())
                .with_field("isTyping", is_typing);
            publish_room_event(session, state, &room_id, RoomEvent::Typing, envelope).await
        }
        ClientMessage::ReadReceipt { room_id, message_id } => {
            let envelope = EventEnvelope::new(RoomEvent::Read.event_type(), GATEWAY_SERVICE)
                .with_field("roomId", room_id.clone())
                .with_field("userId", session.user_id.clone())
                .with_field("messageId", message_id);
            publish_room_event(session, state, &room_id, RoomEvent::Read, envelope).await
        }
        ClientMessage::AckNotification { notification_id } => {
            ack_notification(session, state, &notification_id).await
        }
    }
}

fn subscribe_failed(err: &BridgeError) -> ServerMessage {
    match err {
        BridgeError::Stale => not_registered(),
        BridgeError::UnroutableUser(_) => ServerMessage::error(ErrorCode::InvalidMessage, err.to_string()),
        BridgeError::Broker(_) => {
            ServerMessage::error(ErrorCode::BrokerUnavailable, format!("broker unavailable: {err}"))
        }
    }
}

fn not_registered() -> ServerMessage {
    ServerMessage::error(ErrorCode::InternalError, "session is no longer active")
}

async fn subscribe_notifications(session: &Session, state: &AppState) -> ServerMessage {
    match state.registry.set_notifications(session, true) {
        None => return not_registered(),
        Some(true) => return ServerMessage::notifications_confirmed(true),
        Some(false) => {}
    }
    if let Err(err) = state.bridge.subscribe_notifications(session).await {
        warn!(error = %err, "notification subscribe failed");
        let _ = state.registry.set_notifications(session, false);
        return subscribe_failed(&err);
    }
    ServerMessage::notifications_confirmed(true)
}

fn unsubscribe_notifications(session: &Session, state: &AppState) -> ServerMessage {
    match state.registry.set_notifications(session, false) {
        Some(true) => {
            let _ = state.bridge.unsubscribe_notifications(session);
            ServerMessage::notifications_confirmed(false)
        }
        Some(false) => ServerMessage::error(ErrorCode::NotSubscribed, "not subscribed to notifications"),
        None => not_registered(),
    }
}

async fn subscribe_room(session: &Session, state: &AppState, room_id: &str) -> ServerMessage {
    match state.registry.join_room(session, room_id) {
        None => return not_registered(),
        Some(JoinOutcome::AlreadyMember) => return ServerMessage::room_confirmed(room_id, true),
        Some(JoinOutcome::Joined { .. }) => {}
    }
    if let Err(err) = state.bridge.ensure_room(room_id).await {
        warn!(room_id, error = %err, "room subscribe failed");
        if let LeaveOutcome::Left { room_empty: true } = state.registry.leave_room(session, room_id) {
            state.bridge.release_room(room_id).await;
        }
        return subscribe_failed(&err);
    }
    if !state.registry.is_current(session) {
        return not_registered();
    }
    ServerMessage::room_confirmed(room_id, true)
}

async fn unsubscribe_room(session: &Session, state: &AppState, room_id: &str) -> ServerMessage {
    match state.registry.leave_room(session, room_id) {
        LeaveOutcome::NotMember => {
            ServerMessage::error(ErrorCode::NotSubscribed, format!("not subscribed to room {room_id}"))
        }
        LeaveOutcome::Left { room_empty } => {
            if room_empty {
                state.bridge.release_room(room_id).await;
            }
            ServerMessage::room_confirmed(room_id, false)
        }
    }
}

async fn publish_room_event(
    session: &Session,
    state: &AppState,
    room_id: &str,
    kind: RoomEvent,
    envelope: EventEnvelope,
) -> Option<ServerMessage> {
    if !state.registry.is_member(&session.user_id, room_id) {
        return Some(ServerMessage::error(
            ErrorCode::NotSubscribed,
            format!("not subscribed to room {room_id}"),
        ));
    }
    if !state.broker.is_ready() {
        return Some(ServerMessage::error(ErrorCode::BrokerUnavailable, "broker not ready"));
    }
    let routing_key = kind.routing_key(room_id);
    match publish_envelope(state.broker.as_ref(), Domain::Clan.exchange(), &routing_key, &envelope).await {
        Ok(()) => None,
        Err(err) => {
            warn!(room_id, routing_key = %routing_key, error = %err, "room publish failed");
            Some(ServerMessage::error(ErrorCode::BrokerUnavailable, "failed to publish"))
        }
    }
}

async fn ack_notification(session: &Session, state: &AppState, notification_id: &str) -> Option<ServerMessage> {
    match state.store.mark_read(notification_id, &session.user_id).await {
        Ok(Some(_)) => None,
        Ok(None) => Some(ServerMessage::error(
            ErrorCode::NotFound,
            format!("notification {notification_id} not found"),
        )),
        Err(err) => {
            error!(notification_id, error = %err, "mark_read failed");
            Some(ServerMessage::error(ErrorCode::InternalError, "internal error"))
        }
    }
}
