//! Event envelope: the JSON body every producer publishes to the broker.
//!
//! Wire shape is flat: `{ eventId, eventType, timestamp, service, ...fields }`.
//! Everything that is not one of the four provenance keys lands in
//! [`EventEnvelope::payload`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::ids::EventId;

/// Immutable unit of communication on the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Publisher-assigned id, for traceability only.
    #[serde(default)]
    pub event_id: EventId,
    /// Hierarchical topic string, e.g. `gig_created` or `clan.member.joined`.
    pub event_type: String,
    /// When the publisher emitted the event.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Name of the producing service.
    #[serde(default)]
    pub service: String,
    /// Event-specific fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    /// Build a fresh envelope stamped with a new id and the current time.
    pub fn new(event_type: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            service: service.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field (builder style).
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        let _ = self.payload.insert(key.to_owned(), value.into());
        self
    }

    /// Parse an envelope from a broker message body.
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Serialize to the broker wire format.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// A non-empty string payload field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Non-empty strings from a field holding either one string or an array.
    pub fn str_list(&self, key: &str) -> Vec<&str> {
        match self.payload.get(key) {
            Some(Value::String(s)) if !s.is_empty() => vec![s.as_str()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Render a payload field for human text (strings unquoted, numbers as-is).
    pub fn display_field(&self, key: &str) -> Option<String> {
        match self.payload.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// SHA-256 over event type and payload, independent of key order.
    ///
    /// Provenance fields are excluded, so a republished copy of the same
    /// logical event produces the same fingerprint.
    pub fn content_fingerprint(&self) -> String {
        let mut canonical = String::with_capacity(128);
        canonical.push_str(&self.event_type);
        canonical.push('\n');
        write_canonical(&Value::Object(self.payload.clone()), &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_wire_shape() {
        let body = json!({
            "eventId": "e1",
            "eventType": "user.registered",
            "timestamp": "2025-01-01T00:00:00Z",
            "service": "identity",
            "userId": "u1",
            "email": "a@b.com",
        });
        let env = EventEnvelope::from_slice(body.to_string().as_bytes()).unwrap();
        assert_eq!(env.event_id.as_str(), "e1");
        assert_eq!(env.event_type, "user.registered");
        assert_eq!(env.service, "identity");
        assert_eq!(env.str_field("userId"), Some("u1"));
        assert_eq!(env.payload.len(), 2);
    }

    #[test]
    fn serializes_payload_flat() {
        let env = EventEnvelope::new("gig_created", "gigs").with_field("gigId", "g1");
        let value: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(value["eventType"], "gig_created");
        assert_eq!(value["gigId"], "g1");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn missing_provenance_gets_defaults() {
        let env: EventEnvelope =
            serde_json::from_value(json!({ "eventType": "credits.awarded" })).unwrap();
        assert!(!env.event_id.is_empty());
        assert!(env.service.is_empty());
    }

    #[test]
    fn missing_event_type_is_rejected() {
        let result = serde_json::from_value::<EventEnvelope>(json!({ "userId": "u1" }));
        assert!(result.is_err());
    }

    #[test]
    fn str_field_ignores_empty_and_non_strings() {
        let env = EventEnvelope::new("x", "s")
            .with_field("empty", "")
            .with_field("num", 5);
        assert_eq!(env.str_field("empty"), None);
        assert_eq!(env.str_field("num"), None);
        assert_eq!(env.str_field("absent"), None);
    }

    #[test]
    fn str_list_accepts_string_or_array() {
        let env = EventEnvelope::new("x", "s")
            .with_field("one", "u1")
            .with_field("many", json!(["u2", "", 7, "u3"]));
        assert_eq!(env.str_list("one"), vec!["u1"]);
        assert_eq!(env.str_list("many"), vec!["u2", "u3"]);
        assert!(env.str_list("absent").is_empty());
    }

    #[test]
    fn display_field_renders_numbers() {
        let env = EventEnvelope::new("x", "s").with_field("amount", 25);
        assert_eq!(env.display_field("amount").as_deref(), Some("25"));
    }

    #[test]
    fn fingerprint_ignores_provenance() {
        let a = EventEnvelope::new("gig_created", "gigs").with_field("gigId", "g1");
        let b = EventEnvelope::new("gig_created", "other").with_field("gigId", "g1");
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.content_fingerprint(), b.content_fingerprint());
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = EventEnvelope::new("t", "s")
            .with_field("a", 1)
            .with_field("b", json!({"y": 1, "x": 2}));
        let b = EventEnvelope::new("t", "s")
            .with_field("b", json!({"x": 2, "y": 1}))
            .with_field("a", 1);
        assert_eq!(a.content_fingerprint(), b.content_fingerprint());
    }

    #[test]
    fn fingerprint_depends_on_type_and_content() {
        let base = EventEnvelope::new("t", "s").with_field("a", 1);
        let other_type = EventEnvelope::new("u", "s").with_field("a", 1);
        let other_value = EventEnvelope::new("t", "s").with_field("a", 2);
        assert_ne!(base.content_fingerprint(), other_type.content_fingerprint());
        assert_ne!(base.content_fingerprint(), other_value.content_fingerprint());
        assert_eq!(base.content_fingerprint().len(), 64);
    }
}
