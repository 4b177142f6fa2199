//! Privacy Filtering
//!
//! Privacy tagging and redaction are pure functions over content, kept
//! outside the write transaction and fully deterministic.

use std::sync::OnceLock;

use regex::Regex;

use crate::record::PrivacyLevel;

fn private_markup() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<private>.*?</private>").unwrap())
}

/// Lightweight PII patterns: email, phone (Japanese format), IP, card number.
fn pii_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"(?i)\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
                "[EMAIL]",
            ),
            (
                Regex::new(r"\b0\d{1,4}[-\s]?\d{1,4}[-\s]?\d{3,4}\b").unwrap(),
                "[PHONE]",
            ),
            (
                Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap(),
                "[IP]",
            ),
            (
                Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap(),
                "[CARD]",
            ),
        ]
    })
}

/// Whether the content carries `<private>...</private>` markup.
pub fn has_private_markup(content: &str) -> bool {
    private_markup().is_match(content)
}

/// Remove `<private>...</private>` sections from content.
pub fn strip_private_markup(content: &str) -> String {
    private_markup().replace_all(content, "").trim().to_string()
}

/// Replace common PII patterns with placeholders.
pub fn redact_pii(content: &str) -> String {
    let mut result = content.to_string();
    for (pattern, replacement) in pii_patterns() {
        result = pattern.replace_all(&result, *replacement).into_owned();
    }
    result
}

/// Determine the privacy level for a memory entry.
///
/// Priority: explicit level, then `secret` for private markup, then
/// tag-based detection, then the configured default.
pub fn determine_privacy_level(
    content: &str,
    explicit: Option<PrivacyLevel>,
    tags: &[String],
    default_level: PrivacyLevel,
) -> PrivacyLevel {
    if let Some(level) = explicit {
        return level;
    }
    if has_private_markup(content) {
        return PrivacyLevel::Secret;
    }
    let lowered: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
    if lowered.iter().any(|t| t == "secret") {
        return PrivacyLevel::Secret;
    }
    if lowered.iter().any(|t| t == "private") {
        return PrivacyLevel::Private;
    }
    if lowered.iter().any(|t| t == "public") {
        return PrivacyLevel::Public;
    }
    default_level
}

/// Prepare content for saving: determine the level, strip markup, and
/// optionally redact PII. Returns (processed content, level).
pub fn prepare_content(
    content: &str,
    explicit: Option<PrivacyLevel>,
    tags: &[String],
    default_level: PrivacyLevel,
    auto_redact: bool,
) -> (String, PrivacyLevel) {
    let level = determine_privacy_level(content, explicit, tags, default_level);
    let mut processed = if has_private_markup(content) {
        strip_private_markup(content)
    } else {
        content.to_string()
    };
    if auto_redact {
        processed = redact_pii(&processed);
    }
    (processed, level)
}

/// Whether a row at `level` is visible at `max_level` (admin sees everything).
pub fn is_visible(level: PrivacyLevel, max_level: PrivacyLevel, admin: bool) -> bool {
    admin || level <= max_level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_private_markup() {
        let content = "Visible text <private>hidden secret</private> more text";
        let stripped = strip_private_markup(content);
        assert!(!stripped.contains("hidden secret"));
        assert!(stripped.contains("Visible text"));
        assert!(stripped.contains("more text"));
    }

    #[test]
    fn test_markup_spans_lines() {
        let content = "a <private>line one\nline two</private> b";
        assert!(has_private_markup(content));
        assert_eq!(strip_private_markup(content), "a  b");
    }

    #[test]
    fn test_redact_pii() {
        let redacted = redact_pii("mail me at alice@example.com or call 090-1234-5678");
        assert!(redacted.contains("[EMAIL]"));
        assert!(redacted.contains("[PHONE]"));
        assert!(!redacted.contains("alice@example.com"));
    }

    #[test]
    fn test_redact_ip_and_card() {
        let redacted = redact_pii("host 192.168.1.10, card 4111 1111 1111 1111");
        assert!(redacted.contains("[IP]"));
        assert!(redacted.contains("[CARD]"));
    }

    #[test]
    fn test_level_priority_explicit_wins() {
        let level = determine_privacy_level(
            "<private>x</private>",
            Some(PrivacyLevel::Public),
            &[],
            PrivacyLevel::Internal,
        );
        assert_eq!(level, PrivacyLevel::Public);
    }

    #[test]
    fn test_level_from_markup() {
        let level =
            determine_privacy_level("<private>x</private>", None, &[], PrivacyLevel::Internal);
        assert_eq!(level, PrivacyLevel::Secret);
    }

    #[test]
    fn test_level_from_tags() {
        let tags = vec!["Private".to_string()];
        let level = determine_privacy_level("plain", None, &tags, PrivacyLevel::Internal);
        assert_eq!(level, PrivacyLevel::Private);
    }

    #[test]
    fn test_level_default() {
        let level = determine_privacy_level("plain", None, &[], PrivacyLevel::Internal);
        assert_eq!(level, PrivacyLevel::Internal);
    }

    #[test]
    fn test_visibility() {
        assert!(is_visible(PrivacyLevel::Internal, PrivacyLevel::Private, false));
        assert!(!is_visible(PrivacyLevel::Secret, PrivacyLevel::Private, false));
        assert!(is_visible(PrivacyLevel::Secret, PrivacyLevel::Public, true));
    }
}
