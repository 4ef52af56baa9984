//! Exchange names, queue names, and the routing-key taxonomy.
//!
//! Every name that two components must agree on lives here so that the
//! topology, the dispatch engine, and the bridge cannot drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::notification::NotificationCategory;

/// Service name stamped on envelopes published by the gateway.
pub const GATEWAY_SERVICE: &str = "beacon-gateway";

/// Topic exchange carrying per-user notification handoffs.
pub const NOTIFICATIONS_EXCHANGE: &str = "notifications.direct";

/// General mirror exchange consumed by target-user extraction.
pub const PLATFORM_EXCHANGE: &str = "platform.events";

/// Event type of a persisted notification handed off through a user queue.
pub const NOTIFICATION_CREATED: &str = "notification.created";

/// A producing domain. Each owns one durable topic exchange and one
/// durable notification queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Accounts and authentication.
    Identity,
    /// Gig marketplace.
    Gig,
    /// Credits and reputation.
    Credit,
    /// Clans, rooms, social.
    Clan,
}

impl Domain {
    /// All domains in declaration order.
    pub const ALL: [Domain; 4] = [Domain::Identity, Domain::Gig, Domain::Credit, Domain::Clan];

    /// Short lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gig => "gig",
            Self::Credit => "credit",
            Self::Clan => "clan",
        }
    }

    /// Durable topic exchange producers publish to.
    pub fn exchange(self) -> &'static str {
        match self {
            Self::Identity => "identity.events",
            Self::Gig => "gig.events",
            Self::Credit => "credit.events",
            Self::Clan => "clan.events",
        }
    }

    /// Durable queue the dispatch engine consumes.
    pub fn notification_queue(self) -> &'static str {
        match self {
            Self::Identity => "notifications.identity",
            Self::Gig => "notifications.gig",
            Self::Credit => "notifications.credit",
            Self::Clan => "notifications.clan",
        }
    }

    /// Category assigned to notifications raised by this domain.
    pub fn category(self) -> NotificationCategory {
        match self {
            Self::Identity => NotificationCategory::System,
            Self::Gig => NotificationCategory::Gig,
            Self::Credit => NotificationCategory::Credit,
            Self::Clan => NotificationCategory::Clan,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Per-user notification routing ───────────────────────────────────────────

/// Whether `word` can sit in a topic routing key as one literal word.
///
/// Ids are spliced into keys and binding patterns, so `.` (word separator)
/// and the `*`/`#` wildcards are refused.
pub fn is_routing_word(word: &str) -> bool {
    !word.is_empty() && !word.contains(['.', '*', '#'])
}

/// Routing key for notifications addressed to one user.
pub fn user_notification_key(user_id: &str) -> String {
    format!("notification.user.{user_id}")
}

/// Durable, user-scoped queue name.
pub fn user_notification_queue(user_id: &str) -> String {
    format!("notifications.user.{user_id}")
}

// ── Room routing ────────────────────────────────────────────────────────────

/// Kinds of room events carried on the clan exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoomEvent {
    /// A chat message was posted.
    Message,
    /// A member started or stopped typing.
    Typing,
    /// A member read up to a message.
    Read,
}

impl RoomEvent {
    /// Envelope `eventType` for this kind.
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Message => "clan.message.sent",
            Self::Typing => "clan.typing",
            Self::Read => "clan.message.read",
        }
    }

    /// Last routing-key segment for this kind.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::Read => "read",
        }
    }

    /// Reverse of [`RoomEvent::event_type`].
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "clan.message.sent" => Some(Self::Message),
            "clan.typing" => Some(Self::Typing),
            "clan.message.read" => Some(Self::Read),
            _ => None,
        }
    }

    /// Routing key for this kind of event in one room.
    pub fn routing_key(self, room_id: &str) -> String {
        format!("clan.room.{room_id}.{}", self.suffix())
    }
}

/// Binding pattern matching every event kind of one room.
pub fn room_binding_pattern(room_id: &str) -> String {
    format!("clan.room.{room_id}.*")
}

/// Ephemeral per-room queue name, unique per gateway instance.
pub fn room_queue(room_id: &str, instance_id: &str) -> String {
    format!("room.{room_id}.{instance_id}")
}

/// Ephemeral target-extraction queue name, unique per gateway instance.
pub fn fanout_queue(instance_id: &str) -> String {
    format!("fanout.{instance_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_names_are_distinct() {
        let mut exchanges: Vec<_> = Domain::ALL.iter().map(|d| d.exchange()).collect();
        exchanges.dedup();
        assert_eq!(exchanges.len(), 4);
        assert_eq!(Domain::Gig.notification_queue(), "notifications.gig");
    }

    #[test]
    fn identity_domain_raises_system_notifications() {
        assert_eq!(Domain::Identity.category(), NotificationCategory::System);
        assert_eq!(Domain::Clan.category(), NotificationCategory::Clan);
    }

    #[test]
    fn user_keys_are_parameterized() {
        assert_eq!(user_notification_key("u1"), "notification.user.u1");
        assert_eq!(user_notification_queue("u1"), "notifications.user.u1");
    }

    #[test]
    fn wildcard_ids_are_not_routing_words() {
        assert!(is_routing_word("user-42"));
        assert!(is_routing_word("alice@example"));
        for id in ["#.#", "#", "*", "a.b", "u*", ""] {
            assert!(!is_routing_word(id), "{id}");
        }
    }

    #[test]
    fn room_keys_share_binding_pattern() {
        assert_eq!(RoomEvent::Typing.routing_key("r1"), "clan.room.r1.typing");
        assert_eq!(room_binding_pattern("r1"), "clan.room.r1.*");
        assert_eq!(room_queue("r1", "gw-a"), "room.r1.gw-a");
    }

    #[test]
    fn room_event_type_roundtrip() {
        for kind in [RoomEvent::Message, RoomEvent::Typing, RoomEvent::Read] {
            assert_eq!(RoomEvent::from_event_type(kind.event_type()), Some(kind));
        }
        assert_eq!(RoomEvent::from_event_type("clan.member.joined"), None);
    }
}
