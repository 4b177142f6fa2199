//! Smart Query Expansion
//!
//! Ambiguous queries ("いつものあれ", "that thing") get expanded with
//! time-of-day and day-type tokens in both languages before running as
//! hybrid search. Promise-related terms add a `promise` tag filter.

use chrono::{DateTime, Datelike, FixedOffset, Timelike};

const AMBIGUOUS_JA: &[&str] = &[
    "いつものあれ",
    "いつもの",
    "あれ",
    "例の件",
    "あのこと",
    "あの件",
    "さっきの",
    "前の",
    "また",
];

const AMBIGUOUS_EN: &[&str] = &[
    "that thing",
    "the usual",
    "you know",
    "that",
    "it",
    "the thing",
    "usual stuff",
    "same thing",
];

/// Whether a query needs context expansion: very short, or containing a
/// deictic phrase in either language.
pub fn is_ambiguous_query(query: &str) -> bool {
    let trimmed = query.trim();
    if trimmed.chars().count() < 5 {
        return true;
    }
    let lower = trimmed.to_lowercase();
    AMBIGUOUS_JA
        .iter()
        .chain(AMBIGUOUS_EN)
        .any(|phrase| lower.contains(phrase))
}

#[derive(Debug, Clone)]
pub struct ExpandedQuery {
    pub query: String,
    pub extra_tags: Vec<String>,
    pub was_expanded: bool,
}

/// Expand an ambiguous query with the current time-of-day and day-type
/// tokens, and detect promise-related terms.
pub fn build_expanded_query(query: &str, now: DateTime<FixedOffset>) -> ExpandedQuery {
    let needs_expansion = is_ambiguous_query(query);

    let mut parts: Vec<String> = Vec::new();
    if !query.is_empty() {
        parts.push(query.to_string());
    }

    if needs_expansion {
        let hour = now.hour();
        let time_tokens: [&str; 2] = if (6..12).contains(&hour) {
            ["朝", "morning"]
        } else if (12..18).contains(&hour) {
            ["昼", "afternoon"]
        } else if (18..22).contains(&hour) {
            ["夜", "evening"]
        } else {
            ["深夜", "night"]
        };
        parts.extend(time_tokens.iter().map(|s| s.to_string()));

        let day_tokens: [&str; 2] = if now.weekday().num_days_from_monday() < 5 {
            ["平日", "weekday"]
        } else {
            ["週末", "weekend"]
        };
        parts.extend(day_tokens.iter().map(|s| s.to_string()));
    }

    let lower = query.to_lowercase();
    let mut extra_tags = Vec::new();
    if lower.contains("約束") || lower.contains("promise") {
        extra_tags.push("promise".to_string());
    }

    ExpandedQuery {
        query: if parts.is_empty() {
            query.to_string()
        } else {
            parts.join(" ")
        },
        extra_tags,
        was_expanded: needs_expansion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn morning() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2025-10-29T09:00:00+09:00").unwrap()
    }

    fn saturday_night() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2025-11-01T23:30:00+09:00").unwrap()
    }

    #[test]
    fn test_short_queries_are_ambiguous() {
        assert!(is_ambiguous_query(""));
        assert!(is_ambiguous_query("hey"));
        assert!(!is_ambiguous_query("Python programming notes"));
    }

    #[test]
    fn test_deictic_phrases_are_ambiguous() {
        assert!(is_ambiguous_query("いつものあれを見せて"));
        assert!(is_ambiguous_query("show me that thing again"));
    }

    #[test]
    fn test_expansion_adds_time_and_day_tokens() {
        let expanded = build_expanded_query("あれ", morning());
        assert!(expanded.was_expanded);
        assert!(expanded.query.contains("朝"));
        assert!(expanded.query.contains("morning"));
        assert!(expanded.query.contains("平日"));
        assert!(expanded.query.contains("weekday"));
    }

    #[test]
    fn test_expansion_weekend_night() {
        let expanded = build_expanded_query("あれ", saturday_night());
        assert!(expanded.query.contains("深夜"));
        assert!(expanded.query.contains("night"));
        assert!(expanded.query.contains("週末"));
        assert!(expanded.query.contains("weekend"));
    }

    #[test]
    fn test_unambiguous_query_unchanged() {
        let expanded = build_expanded_query("Rust borrow checker notes", morning());
        assert!(!expanded.was_expanded);
        assert_eq!(expanded.query, "Rust borrow checker notes");
    }

    #[test]
    fn test_promise_terms_add_tag() {
        let expanded = build_expanded_query("週末の約束なんだっけ", morning());
        assert_eq!(expanded.extra_tags, vec!["promise"]);
        let expanded = build_expanded_query("what did I promise about dinner", morning());
        assert_eq!(expanded.extra_tags, vec!["promise"]);
    }
}
