//! Write Path
//!
//! Input normalization, key assignment, and the enriched-text / payload
//! builders feeding the vector index. The orchestration itself (durable
//! write, enqueue, op-log) lives on the engine; everything here is pure.

pub mod queue;

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde_json::{json, Value};

use crate::record::{MemoryRecord, PrivacyLevel};
use crate::timeutil;

/// Caller-supplied fields for memory creation. Unset fields take the
/// documented column defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateMemoryInput {
    pub content: String,
    pub key: Option<String>,
    pub importance: Option<f64>,
    pub emotion: Option<String>,
    pub emotion_intensity: Option<f64>,
    pub tags: Vec<String>,
    pub physical_state: Option<String>,
    pub mental_state: Option<String>,
    pub environment: Option<String>,
    pub relationship_status: Option<String>,
    pub action_tag: Option<String>,
    pub privacy_level: Option<PrivacyLevel>,
    /// Equipment snapshot captured at creation time.
    pub equipped_items: Option<BTreeMap<String, String>>,
    /// Skip vector indexing on save (bulk import paths).
    pub defer_vector: bool,
}

/// Caller-supplied fields for memory update. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct UpdateMemoryInput {
    pub content: Option<String>,
    pub importance: Option<f64>,
    pub emotion: Option<String>,
    pub emotion_intensity: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub physical_state: Option<String>,
    pub mental_state: Option<String>,
    pub environment: Option<String>,
    pub relationship_status: Option<String>,
    pub action_tag: Option<String>,
    pub privacy_level: Option<PrivacyLevel>,
}

impl UpdateMemoryInput {
    pub fn apply(self, record: &mut MemoryRecord, now: DateTime<FixedOffset>) {
        if let Some(content) = self.content {
            record.content = content;
        }
        if let Some(importance) = self.importance {
            record.importance = importance;
        }
        if let Some(emotion) = self.emotion {
            record.emotion = emotion;
        }
        if let Some(intensity) = self.emotion_intensity {
            record.emotion_intensity = intensity;
        }
        if let Some(tags) = self.tags {
            record.tags = tags;
        }
        if let Some(state) = self.physical_state {
            record.physical_state = state;
        }
        if let Some(state) = self.mental_state {
            record.mental_state = state;
        }
        if let Some(environment) = self.environment {
            record.environment = environment;
        }
        if let Some(status) = self.relationship_status {
            record.relationship_status = status;
        }
        if let Some(action) = self.action_tag {
            record.action_tag = Some(action);
        }
        if let Some(level) = self.privacy_level {
            record.privacy_level = level;
        }
        record.updated_at = now;
        record.clamp_ranges();
    }
}

/// Auto-generate a key from the current service time:
/// `memory_YYYYMMDDHHMMSS`. `exists` disambiguates same-second collisions
/// with a numeric suffix.
pub fn generate_key<F: Fn(&str) -> bool>(now: DateTime<FixedOffset>, exists: F) -> String {
    let base = format!("memory_{}", timeutil::key_timestamp(now));
    if !exists(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Append structured annotations to raw content so the embedding captures
/// searchable metadata. Only non-default values are annotated; the result
/// is fed to the embedding model, never shown to the user.
pub fn build_enriched_text(record: &MemoryRecord) -> String {
    let mut enriched = record.content.clone();

    if !record.tags.is_empty() {
        enriched.push_str(&format!("\n[Tags: {}]", record.tags.join(", ")));
    }

    if record.emotion != "neutral" {
        enriched.push_str(&format!("\n[Emotion: {}", record.emotion));
        if record.emotion_intensity > 0.5 {
            enriched.push_str(&format!(" (intensity: {:.1})", record.emotion_intensity));
        }
        enriched.push(']');
    }

    if let Some(action) = &record.action_tag {
        enriched.push_str(&format!("\n[Action: {}]", action));
    }

    if record.environment != "unknown" {
        enriched.push_str(&format!("\n[Environment: {}]", record.environment));
    }

    let mut states = Vec::new();
    if record.physical_state != "normal" {
        states.push(format!("physical:{}", record.physical_state));
    }
    if record.mental_state != "calm" {
        states.push(format!("mental:{}", record.mental_state));
    }
    if !states.is_empty() {
        enriched.push_str(&format!("\n[State: {}]", states.join(", ")));
    }

    if record.relationship_status != "normal" {
        enriched.push_str(&format!("\n[Relationship: {}]", record.relationship_status));
    }

    enriched
}

/// Payload mirrored onto the vector point: key, content, and every
/// searchable metadata attribute.
pub fn build_payload(record: &MemoryRecord) -> Value {
    json!({
        "key": record.key,
        "content": record.content,
        "tags": record.tags,
        "emotion": record.emotion,
        "emotion_intensity": record.emotion_intensity,
        "importance": record.importance,
        "action_tag": record.action_tag,
        "environment": record.environment,
        "created_at": record.created_at.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record() -> MemoryRecord {
        MemoryRecord::new(
            "memory_20251210123456".to_string(),
            "今日はPythonを勉強した。".to_string(),
            Utc::now().fixed_offset(),
        )
    }

    #[test]
    fn test_enriched_text_defaults_are_bare() {
        let rec = record();
        assert_eq!(build_enriched_text(&rec), rec.content);
    }

    #[test]
    fn test_enriched_text_annotations() {
        let mut rec = record();
        rec.tags = vec!["learning".to_string(), "programming".to_string()];
        rec.emotion = "joy".to_string();
        rec.emotion_intensity = 0.8;
        rec.action_tag = Some("coding".to_string());
        rec.environment = "home".to_string();
        rec.physical_state = "tired".to_string();
        rec.mental_state = "focused".to_string();
        rec.relationship_status = "closer".to_string();

        let enriched = build_enriched_text(&rec);
        assert!(enriched.starts_with(&rec.content));
        assert!(enriched.contains("[Tags: learning, programming]"));
        assert!(enriched.contains("[Emotion: joy (intensity: 0.8)]"));
        assert!(enriched.contains("[Action: coding]"));
        assert!(enriched.contains("[Environment: home]"));
        assert!(enriched.contains("[State: physical:tired, mental:focused]"));
        assert!(enriched.contains("[Relationship: closer]"));
    }

    #[test]
    fn test_enriched_text_low_intensity_omits_clause() {
        let mut rec = record();
        rec.emotion = "joy".to_string();
        rec.emotion_intensity = 0.3;
        let enriched = build_enriched_text(&rec);
        assert!(enriched.contains("[Emotion: joy]"));
        assert!(!enriched.contains("intensity"));
    }

    #[test]
    fn test_generate_key_collision_suffix() {
        let now = DateTime::parse_from_rfc3339("2025-12-10T12:34:56+09:00").unwrap();
        let key = generate_key(now, |_| false);
        assert_eq!(key, "memory_20251210123456");

        let taken = ["memory_20251210123456", "memory_20251210123456_2"];
        let key = generate_key(now, |k| taken.contains(&k));
        assert_eq!(key, "memory_20251210123456_3");
    }

    #[test]
    fn test_update_apply_partial() {
        let mut rec = record();
        let original_emotion = rec.emotion.clone();
        let now = Utc::now().fixed_offset();
        UpdateMemoryInput {
            content: Some("updated".to_string()),
            importance: Some(2.0),
            ..Default::default()
        }
        .apply(&mut rec, now);

        assert_eq!(rec.content, "updated");
        assert_eq!(rec.importance, 1.0);
        assert_eq!(rec.emotion, original_emotion);
        assert_eq!(rec.updated_at, now);
    }

    #[test]
    fn test_payload_mirrors_searchable_fields() {
        let mut rec = record();
        rec.tags = vec!["a".to_string()];
        let payload = build_payload(&rec);
        assert_eq!(payload["key"], rec.key);
        assert_eq!(payload["content"], rec.content);
        assert_eq!(payload["tags"][0], "a");
        assert!(payload["importance"].is_number());
        assert!(payload["created_at"].is_string());
    }
}
