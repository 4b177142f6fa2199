//! Forgetting & Decay
//!
//! Time-based importance decay with emotion-based resistance. Memories
//! fade unless they are recalled or carry strong emotional intensity.
//! Invoked by the summarizer or on demand, not as a standalone loop.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};

use crate::store::{MemoryStore, Result};
use crate::timeutil;

/// Time decay factor in (0, 1]:
///
/// `decay = 1 / (1 + days_since_access / 30)`
///
/// 0 days -> 1.0, 30 days -> 0.5, 90 days -> 0.25, 365 days -> ~0.076.
/// `last_accessed` substitutes for `created_at` when present.
pub fn time_decay(
    created_at: DateTime<FixedOffset>,
    last_accessed: Option<DateTime<FixedOffset>>,
    now: DateTime<FixedOffset>,
) -> f64 {
    let reference = last_accessed.unwrap_or(created_at);
    let days = timeutil::age_days(reference, now);
    (1.0 / (1.0 + days / 30.0)).clamp(0.0, 1.0)
}

/// Apply decay to an importance score with emotion resistance:
/// intensity > 0.7 resists 70% of the decay, > 0.5 resists 50%,
/// otherwise the full decay applies.
pub fn decayed_importance(
    importance: f64,
    emotion_intensity: f64,
    created_at: DateTime<FixedOffset>,
    last_accessed: Option<DateTime<FixedOffset>>,
    now: DateTime<FixedOffset>,
) -> f64 {
    let decay = time_decay(created_at, last_accessed, now);
    let factor = if emotion_intensity > 0.7 {
        0.3 + decay * 0.7
    } else if emotion_intensity > 0.5 {
        0.5 + decay * 0.5
    } else {
        decay
    };
    (importance * factor).clamp(0.0, 1.0)
}

/// Apply decay to every memory. `dry_run` computes without writing back.
/// Returns the map of key -> new importance.
pub fn decay_all(
    store: &MemoryStore,
    now: DateTime<FixedOffset>,
    dry_run: bool,
) -> Result<HashMap<String, f64>> {
    let snapshot = store.load_all()?;
    let mut decayed = HashMap::with_capacity(snapshot.len());

    for record in snapshot.values() {
        let new_importance = decayed_importance(
            record.importance,
            record.emotion_intensity,
            record.created_at,
            record.last_accessed,
            now,
        );
        decayed.insert(record.key.clone(), new_importance);

        if !dry_run && (new_importance - record.importance).abs() > f64::EPSILON {
            store.set_importance(&record.key, new_importance)?;
            tracing::debug!(
                "Decayed {}: {:.3} -> {:.3}",
                record.key,
                record.importance,
                new_importance
            );
        }
    }

    if dry_run {
        tracing::debug!("Dry run: would decay {} memories", decayed.len());
    } else {
        tracing::info!("Applied decay to {} memories", decayed.len());
    }
    Ok(decayed)
}

/// Keys eligible for deletion: importance below the threshold AND already
/// covered by a summary node. Non-destructive - callers decide what to do.
pub fn mark_for_deletion(store: &MemoryStore, min_importance: f64) -> Result<Vec<String>> {
    let snapshot = store.load_all()?;
    let mut keys: Vec<String> = snapshot
        .values()
        .filter(|r| r.importance < min_importance && r.summary_ref.is_some())
        .map(|r| r.key.clone())
        .collect();
    keys.sort();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryRecord;
    use chrono::{Duration, Utc};

    fn now() -> DateTime<FixedOffset> {
        Utc::now().fixed_offset()
    }

    #[test]
    fn test_time_decay_curve() {
        let n = now();
        assert!((time_decay(n, None, n) - 1.0).abs() < 1e-6);
        assert!((time_decay(n - Duration::days(30), None, n) - 0.5).abs() < 1e-3);
        assert!((time_decay(n - Duration::days(90), None, n) - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_last_accessed_resets_decay() {
        let n = now();
        let created = n - Duration::days(90);
        let fresh_access = time_decay(created, Some(n), n);
        assert!((fresh_access - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decay_monotonic_in_age() {
        // For fixed intensity, decayed importance is non-increasing in age.
        let n = now();
        for intensity in [0.0, 0.6, 0.9] {
            let mut previous = f64::MAX;
            for days in [0, 10, 30, 90, 365] {
                let value =
                    decayed_importance(0.8, intensity, n - Duration::days(days), None, n);
                assert!(
                    value <= previous + 1e-9,
                    "decay increased at {} days (intensity {})",
                    days,
                    intensity
                );
                previous = value;
            }
        }
    }

    #[test]
    fn test_emotion_resistance_tiers() {
        let n = now();
        let created = n - Duration::days(30); // decay = 0.5
        let weak = decayed_importance(1.0, 0.0, created, None, n);
        let medium = decayed_importance(1.0, 0.6, created, None, n);
        let strong = decayed_importance(1.0, 0.8, created, None, n);
        assert!(weak < medium && medium < strong);
        assert!((weak - 0.5).abs() < 1e-3);
        assert!((medium - 0.75).abs() < 1e-3);
    }

    #[test]
    fn test_strong_emotion_factor_value() {
        let n = now();
        let created = n - Duration::days(30); // decay = 0.5
        // factor = 0.3 + 0.5 * 0.7 = 0.65
        let strong = decayed_importance(1.0, 0.8, created, None, n);
        assert!((strong - 0.65).abs() < 1e-3);
    }

    #[test]
    fn test_decay_all_and_mark_for_deletion() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MemoryStore::open(&dir.path().join("m.sqlite"), "test").unwrap();
        let n = now();

        let mut old = MemoryRecord::new("memory_20240101000000".into(), "old".into(), n);
        old.created_at = n - Duration::days(300);
        old.importance = 0.4;
        old.summary_ref = Some("summary_20240102".into());
        store.upsert(&old).unwrap();

        let mut fresh = MemoryRecord::new("memory_20250101000000".into(), "fresh".into(), n);
        fresh.created_at = n;
        fresh.importance = 0.9;
        store.upsert(&fresh).unwrap();

        // Dry run leaves the rows untouched
        let preview = decay_all(&store, n, true).unwrap();
        assert_eq!(preview.len(), 2);
        assert_eq!(store.get("memory_20240101000000").unwrap().unwrap().importance, 0.4);

        decay_all(&store, n, false).unwrap();
        let decayed = store.get("memory_20240101000000").unwrap().unwrap();
        assert!(decayed.importance < 0.4);

        let marked = mark_for_deletion(&store, 0.2).unwrap();
        assert_eq!(marked, vec!["memory_20240101000000".to_string()]);
    }
}
