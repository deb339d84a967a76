//! Identifier, question-key and domain-candidate normalization.
//!
//! These are pure functions with no state, kept separate from the
//! stores and caches that rely on them so the invariants in the
//! specification (idempotency, exact candidate lists) can be tested
//! in isolation.

use dns_types::protocol::types::Question;

/// The reserved group that matches any query whose domain candidates
/// are empty or one of the trivial sentinels.
pub const DEFAULT_GROUP_NAME: &str = "default";

/// Domain strings which indicate a local/unqualified name, and are
/// always routed to the `default` group.
pub const TRIVIAL_SENTINEL_DOMAINS: [&str; 3] = ["", "home", "local"];

/// Normalize a group name into its identifier: lowercase, with `.`
/// and ` ` replaced by `-`.
///
/// Idempotent: `normalize_identifier(normalize_identifier(x)) == normalize_identifier(x)`.
pub fn normalize_identifier(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c == '.' || c == ' ' { '-' } else { c })
        .collect()
}

/// Split a hostname into its domain candidates, outermost-first.
///
/// `a.b.c` -> `["b.c", "c"]`; `a.b` -> `["b"]`; `a` -> `[""]`.
pub fn domain_candidates(hostname: &str) -> Vec<String> {
    let tokens: Vec<&str> = hostname.split('.').collect();
    if tokens.len() <= 1 {
        return vec![String::new()];
    }
    (1..tokens.len())
        .map(|start| tokens[start..].join("."))
        .collect()
}

/// Whether `domain` should be treated as matching the `default` group
/// regardless of its own domain list.
pub fn is_default_group_domain(domain: &str) -> bool {
    TRIVIAL_SENTINEL_DOMAINS
        .iter()
        .any(|sentinel| sentinel.eq_ignore_ascii_case(domain))
}

/// The canonical key for a DNS question: its dotted name and query
/// type, joined by a colon.
pub fn question_key(question: &Question) -> String {
    format!(
        "{}:{}",
        question.name.to_dotted_string(),
        u16::from(question.qtype)
    )
}

/// Normalize a question key by stripping control characters and a
/// trailing dot from the name portion.
pub fn normalize_question_key(key: &str) -> String {
    let filtered: String = key.chars().filter(|c| !c.is_control()).collect();
    match filtered.find(':') {
        Some(idx) => {
            let (name_part, rest) = filtered.split_at(idx);
            let name_part = name_part.strip_suffix('.').unwrap_or(name_part);
            format!("{name_part}{rest}")
        }
        None => filtered,
    }
}

/// The correlation fingerprint of a message: its transaction id.
pub fn fingerprint(id: u16) -> String {
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_identifier_lowercases_and_replaces() {
        assert_eq!("my-lan-group", normalize_identifier("My.Lan Group"));
    }

    #[test]
    fn normalize_identifier_is_idempotent() {
        let once = normalize_identifier("My.Lan Group");
        assert_eq!(once, normalize_identifier(&once));
    }

    #[test]
    fn domain_candidates_three_labels() {
        assert_eq!(vec!["b.c", "c"], domain_candidates("a.b.c"));
    }

    #[test]
    fn domain_candidates_two_labels() {
        assert_eq!(vec!["b"], domain_candidates("a.b"));
    }

    #[test]
    fn domain_candidates_one_label() {
        assert_eq!(vec![""], domain_candidates("a"));
    }

    #[test]
    fn default_group_domain_sentinels() {
        assert!(is_default_group_domain(""));
        assert!(is_default_group_domain("home"));
        assert!(is_default_group_domain("local"));
        assert!(!is_default_group_domain("lan.corp"));
    }

    #[test]
    fn normalize_question_key_strips_trailing_dot_and_control_chars() {
        assert_eq!(
            "example.com:1",
            normalize_question_key("example.com.\u{7}:1")
        );
    }
}
