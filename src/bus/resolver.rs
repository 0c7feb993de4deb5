//! Target string resolution.
//!
//! Precedence: full subscriber id, then exact nickname, then agent type
//! (active only), then the literal `"*"` wildcard (active only). An id
//! string wins even when a nickname happens to collide with it.

use super::Subscriber;

/// Resolve a target string to concrete subscriber ids. An empty result
/// means no match; callers surface `TargetNotFound`.
pub fn resolve_target(subscribers: &[Subscriber], target: &str) -> Vec<String> {
    // Full ids carry a type:session separator.
    if target.contains(':') {
        return subscribers
            .iter()
            .filter(|s| s.id == target)
            .map(|s| s.id.clone())
            .collect();
    }

    let nickname_match: Vec<String> = subscribers
        .iter()
        .filter(|s| s.is_active() && s.nickname == target)
        .map(|s| s.id.clone())
        .collect();
    if !nickname_match.is_empty() {
        return nickname_match;
    }

    let type_match: Vec<String> = subscribers
        .iter()
        .filter(|s| s.is_active() && s.agent_type == target)
        .map(|s| s.id.clone())
        .collect();
    if !type_match.is_empty() {
        return type_match;
    }

    if target == "*" {
        return subscribers
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.id.clone())
            .collect();
    }

    Vec::new()
}

/// Whether an event targeted at `target` should reach `subscriber` on the
/// pull/consume path. Mirrors `resolve_target` match rules.
pub fn target_matches(subscriber: &Subscriber, target: &str) -> bool {
    target == subscriber.id
        || target == subscriber.nickname
        || target == subscriber.agent_type
        || target == "*"
}
