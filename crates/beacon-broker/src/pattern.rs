//! AMQP topic binding matching.
//!
//! Routing keys and patterns are dot-separated words. In a pattern `*`
//! matches exactly one word and `#` matches zero or more words.

/// Whether `routing_key` matches binding `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = routing_key.split('.').collect();
    matches_parts(&pattern_parts, &key_parts)
}

fn matches_parts(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Zero words, or swallow one and retry.
            matches_parts(rest, key) || (!key.is_empty() && matches_parts(pattern, &key[1..]))
        }
        Some((&"*", rest)) => !key.is_empty() && matches_parts(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_parts(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("gig_created", "gig_created"));
        assert!(topic_matches("clan.member.joined", "clan.member.joined"));
        assert!(!topic_matches("clan.member.joined", "clan.member.left"));
    }

    #[test]
    fn star_matches_one_word() {
        assert!(topic_matches("clan.room.r1.*", "clan.room.r1.message"));
        assert!(!topic_matches("clan.room.r1.*", "clan.room.r1"));
        assert!(!topic_matches("clan.room.r1.*", "clan.room.r1.message.extra"));
        assert!(!topic_matches("clan.room.r1.*", "clan.room.r2.message"));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(topic_matches("#", "gig_applied"));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("clan.#", "clan"));
        assert!(topic_matches("clan.#", "clan.member.joined"));
        assert!(topic_matches("clan.#.read", "clan.room.r1.read"));
        assert!(!topic_matches("clan.#.read", "clan.room.r1.typing"));
    }

    #[test]
    fn user_keys_do_not_collide() {
        assert!(topic_matches("notification.user.u1", "notification.user.u1"));
        assert!(!topic_matches("notification.user.u1", "notification.user.u10"));
    }
}
