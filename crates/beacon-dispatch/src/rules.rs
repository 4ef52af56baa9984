//! Declarative notification rules.
//!
//! Each [`NotificationRule`] maps one routing key to one or more
//! [`Audience`]s. An audience names the payload fields holding recipient
//! ids, the text templates, and how writes are de-duplicated. Templates use
//! `{field}` placeholders over the payload; a missing field renders empty.

use std::fmt::Write as _;

use async_trait::async_trait;
use beacon_core::routing::Domain;
use beacon_core::{EventEnvelope, NewNotification};
use beacon_store::CreateOutcome;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::context::DispatchContext;
use crate::errors::{DispatchError, Result};
use crate::handler::{EventHandler, HandlerOutput, HandlerRegistry};

/// One group of recipients for an event and what they are told.
#[derive(Clone, Debug)]
pub struct Audience {
    recipients: &'static [&'static str],
    exclude: Option<&'static str>,
    kind: &'static str,
    title: &'static str,
    message: &'static str,
    subject: Option<&'static str>,
    priority: i64,
    carry: &'static [&'static str],
    optional: bool,
}

impl Audience {
    /// Recipients come from `recipients` (each a string or array field).
    pub fn new(
        recipients: &'static [&'static str],
        kind: &'static str,
        title: &'static str,
        message: &'static str,
    ) -> Self {
        Self {
            recipients,
            exclude: None,
            kind,
            title,
            message,
            subject: None,
            priority: beacon_core::notification::DEFAULT_PRIORITY,
            carry: &[],
            optional: false,
        }
    }

    /// Skip the user named by this payload field (the actor).
    #[must_use]
    pub fn excluding(mut self, field: &'static str) -> Self {
        self.exclude = Some(field);
        self
    }

    /// De-duplicate on `"<kind>:<payload[field]>"` instead of content.
    #[must_use]
    pub fn subject(mut self, field: &'static str) -> Self {
        self.subject = Some(field);
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Copy these payload fields into metadata.
    #[must_use]
    pub fn carry(mut self, fields: &'static [&'static str]) -> Self {
        self.carry = fields;
        self
    }

    /// Absent recipient fields are not an error.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Resolve recipient ids: order-preserving, de-duplicated, actor removed.
    pub fn recipients<'a>(&self, envelope: &'a EventEnvelope) -> Vec<&'a str> {
        let actor = self.exclude.and_then(|f| envelope.str_field(f));
        let mut out: Vec<&str> = Vec::new();
        for field in self.recipients {
            for id in envelope.str_list(field) {
                if Some(id) != actor && !out.contains(&id) {
                    out.push(id);
                }
            }
        }
        out
    }

    fn dedup_key(&self, envelope: &EventEnvelope) -> String {
        match self.subject.and_then(|f| envelope.display_field(f)) {
            Some(subject) => format!("{}:{subject}", self.kind),
            None => envelope.content_fingerprint(),
        }
    }

    fn metadata(&self, envelope: &EventEnvelope) -> Value {
        let mut meta = Map::new();
        let _ = meta.insert("kind".into(), json!(self.kind));
        let _ = meta.insert("eventType".into(), json!(envelope.event_type));
        let _ = meta.insert("eventId".into(), json!(envelope.event_id.as_str()));
        if let Some(subject) = self.subject.and_then(|f| envelope.display_field(f)) {
            let _ = meta.insert("subjectId".into(), json!(subject));
        }
        for field in self.carry {
            if let Some(value) = envelope.payload.get(*field) {
                let _ = meta.insert((*field).to_owned(), value.clone());
            }
        }
        Value::Object(meta)
    }
}

/// Render `{field}` placeholders from the payload.
pub fn render(template: &str, envelope: &EventEnvelope) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        if let Some(value) = envelope.display_field(&after[..end]) {
            let _ = write!(out, "{value}");
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// A routing key and the audiences it notifies.
#[derive(Clone, Debug)]
pub struct NotificationRule {
    /// Routing key handled.
    pub routing_key: &'static str,
    /// Producing domain; selects queue and category.
    pub domain: Domain,
    /// Who is notified.
    pub audiences: Vec<Audience>,
}

impl NotificationRule {
    /// Rule with a single audience.
    pub fn new(routing_key: &'static str, domain: Domain, audience: Audience) -> Self {
        Self {
            routing_key,
            domain,
            audiences: vec![audience],
        }
    }

    /// Add another audience.
    #[must_use]
    pub fn and(mut self, audience: Audience) -> Self {
        self.audiences.push(audience);
        self
    }
}

#[async_trait]
impl EventHandler for NotificationRule {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        ctx: &DispatchContext,
    ) -> Result<HandlerOutput> {
        let mut output = HandlerOutput::default();
        for audience in &self.audiences {
            let present = audience
                .recipients
                .iter()
                .any(|f| envelope.payload.contains_key(*f));
            if !present && !audience.optional {
                return Err(DispatchError::MissingField {
                    event_type: envelope.event_type.clone(),
                    field: audience.recipients.join("|"),
                });
            }

            let title = render(audience.title, envelope);
            let message = render(audience.message, envelope);
            let metadata = audience.metadata(envelope);
            let dedup_key = audience.dedup_key(envelope);

            for user_id in audience.recipients(envelope) {
                let new = NewNotification::new(user_id, self.domain.category(), &title, &message)
                    .with_metadata(metadata.clone())
                    .with_priority(audience.priority);
                match ctx.deliver(new, dedup_key.clone()).await? {
                    CreateOutcome::Created(_) => output.created += 1,
                    CreateOutcome::Suppressed(existing) => {
                        debug!(
                            user_id,
                            kind = audience.kind,
                            existing = %existing.id,
                            "notification suppressed"
                        );
                        output.suppressed += 1;
                    }
                }
            }
        }
        Ok(output)
    }
}

/// The platform's notification rules.
#[allow(clippy::too_many_lines)]
pub fn default_rules() -> Vec<NotificationRule> {
    vec![
        // ── identity ──────────────────────────────────────────────────
        NotificationRule::new(
            "user.registered",
            Domain::Identity,
            Audience::new(
                &["userId"],
                "welcome",
                "Welcome aboard",
                "Your account is ready. Start by browsing open gigs.",
            ),
        ),
        NotificationRule::new(
            "user.verified",
            Domain::Identity,
            Audience::new(
                &["userId"],
                "account_verified",
                "Account verified",
                "Your account has been verified.",
            ),
        ),
        NotificationRule::new(
            "user.password_changed",
            Domain::Identity,
            Audience::new(
                &["userId"],
                "password_changed",
                "Password changed",
                "Your password was changed. If this wasn't you, reset it now.",
            )
            .priority(2),
        ),
        // ── gig ───────────────────────────────────────────────────────
        NotificationRule::new(
            "gig_created",
            Domain::Gig,
            Audience::new(
                &["ownerId"],
                "gig_created",
                "Gig published",
                "Your gig \"{title}\" is live.",
            )
            .subject("gigId")
            .carry(&["gigId"]),
        ),
        NotificationRule::new(
            "new_application_received",
            Domain::Gig,
            Audience::new(
                &["ownerId"],
                "new_application",
                "New application",
                "Someone applied to your gig \"{gigTitle}\".",
            )
            .subject("gigId")
            .carry(&["gigId", "applicantId"]),
        ),
        NotificationRule::new(
            "application_confirmed",
            Domain::Gig,
            Audience::new(
                &["applicantId"],
                "application_confirmed",
                "Application sent",
                "Your application to \"{gigTitle}\" was received.",
            )
            .subject("gigId")
            .carry(&["gigId"]),
        )
        .and(
            Audience::new(
                &["ownerId"],
                "new_application",
                "New application",
                "Someone applied to your gig \"{gigTitle}\".",
            )
            .subject("gigId")
            .carry(&["gigId", "applicantId"])
            .optional(),
        ),
        NotificationRule::new(
            "application_rejected",
            Domain::Gig,
            Audience::new(
                &["applicantId"],
                "application_rejected",
                "Application not selected",
                "Your application to \"{gigTitle}\" was not selected.",
            )
            .subject("gigId")
            .carry(&["gigId"]),
        ),
        NotificationRule::new(
            "gig_completed",
            Domain::Gig,
            Audience::new(
                &["ownerId", "workerId"],
                "gig_completed",
                "Gig completed",
                "\"{gigTitle}\" has been marked complete.",
            )
            .subject("gigId")
            .carry(&["gigId"]),
        ),
        NotificationRule::new(
            "gig_cancelled",
            Domain::Gig,
            Audience::new(
                &["applicantIds"],
                "gig_cancelled",
                "Gig cancelled",
                "\"{gigTitle}\" was cancelled by its owner.",
            )
            .subject("gigId")
            .carry(&["gigId"]),
        ),
        // ── credit ────────────────────────────────────────────────────
        NotificationRule::new(
            "credits.awarded",
            Domain::Credit,
            Audience::new(
                &["userId"],
                "credits_awarded",
                "Credits awarded",
                "You received {amount} credits.",
            )
            .carry(&["amount", "balance"]),
        ),
        NotificationRule::new(
            "credits.deducted",
            Domain::Credit,
            Audience::new(
                &["userId"],
                "credits_deducted",
                "Credits deducted",
                "{amount} credits were deducted from your balance.",
            )
            .carry(&["amount", "balance"]),
        ),
        NotificationRule::new(
            "reputation.updated",
            Domain::Credit,
            Audience::new(
                &["userId"],
                "reputation_updated",
                "Reputation updated",
                "Your reputation is now {reputation}.",
            )
            .carry(&["reputation"]),
        ),
        // ── clan ──────────────────────────────────────────────────────
        NotificationRule::new(
            "clan.member.joined",
            Domain::Clan,
            Audience::new(
                &["memberIds"],
                "clan_member_joined",
                "New clan member",
                "{username} joined {clanName}.",
            )
            .excluding("userId")
            .carry(&["clanId", "userId"]),
        ),
        NotificationRule::new(
            "clan.member.left",
            Domain::Clan,
            Audience::new(
                &["memberIds"],
                "clan_member_left",
                "Clan member left",
                "{username} left {clanName}.",
            )
            .excluding("userId")
            .carry(&["clanId", "userId"]),
        ),
        NotificationRule::new(
            "clan.invite.sent",
            Domain::Clan,
            Audience::new(
                &["inviteeId"],
                "clan_invite",
                "Clan invitation",
                "You were invited to join {clanName}.",
            )
            .subject("clanId")
            .priority(2)
            .carry(&["clanId", "inviterId"]),
        ),
        NotificationRule::new(
            "clan.role.changed",
            Domain::Clan,
            Audience::new(
                &["userId"],
                "clan_role_changed",
                "Clan role changed",
                "Your role in {clanName} is now {role}.",
            )
            .carry(&["clanId", "role"]),
        ),
    ]
}

impl HandlerRegistry {
    /// Registry holding [`default_rules`].
    pub fn with_default_rules() -> Self {
        let mut registry = Self::new();
        for rule in default_rules() {
            let (domain, key) = (rule.domain, rule.routing_key);
            registry.register(domain, key, rule);
        }
        registry
    }
}
