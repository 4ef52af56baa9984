//! Target-user extraction for platform events.
//!
//! Each rule names the payload fields that hold the ids of users who should
//! see the raw event. A field may hold one id or an array of ids.

use std::collections::BTreeSet;

use beacon_core::EventEnvelope;

/// Event type → target fields.
pub const TARGET_RULES: &[(&str, &[&str])] = &[
    ("gig_applied", &["posterId", "applicantId"]),
    ("gig_assigned", &["posterId", "workerId"]),
    ("gig_updated", &["applicantIds", "workerId"]),
    ("gig_message", &["recipientId"]),
    ("gig_review_posted", &["revieweeId"]),
    ("gig_completed", &["ownerId", "workerId"]),
    ("application_confirmed", &["applicantId", "ownerId"]),
    ("user.registered", &["userId"]),
    ("credits.awarded", &["userId"]),
    ("achievement.unlocked", &["userId"]),
    ("friend.request", &["targetUserId"]),
    ("clan.war.started", &["memberIds"]),
    ("clan.announcement", &["memberIds"]),
];

/// Fields for an event type, if it has a rule.
pub fn target_fields(event_type: &str) -> Option<&'static [&'static str]> {
    TARGET_RULES
        .iter()
        .find(|(t, _)| *t == event_type)
        .map(|(_, fields)| *fields)
}

/// Distinct target user ids in field order of appearance, deduplicated.
pub fn extract_targets(envelope: &EventEnvelope) -> Vec<String> {
    let Some(fields) = target_fields(&envelope.event_type) else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    fields
        .iter()
        .flat_map(|field| envelope.str_list(field))
        .filter(|id| seen.insert(*id))
        .map(str::to_owned)
        .collect()
}
