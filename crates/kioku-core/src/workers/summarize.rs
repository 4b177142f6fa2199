//! Auto-Summarizer (metamemory)
//!
//! Compresses a window of memories into a summary node keyed
//! `summary_YYYYMMDD`, linking the members back through `summary_ref`.
//! The default back-end is statistical (top tags, dominant emotion, mean
//! importance, highlights); an LLM back-end can sit behind the same
//! interface but is out of the default path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset};
use tokio::sync::watch;

use crate::engine::MemoryEngine;
use crate::record::MemoryRecord;

const POLL_INTERVAL: Duration = Duration::from_secs(60);
const ERROR_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryWindow {
    LastDay,
    LastWeek,
}

impl SummaryWindow {
    pub fn bounds(
        &self,
        now: DateTime<FixedOffset>,
    ) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
        let days = match self {
            SummaryWindow::LastDay => 1,
            SummaryWindow::LastWeek => 7,
        };
        (now - chrono::Duration::days(days), now)
    }

    pub fn description(&self, now: DateTime<FixedOffset>) -> String {
        match self {
            SummaryWindow::LastDay => {
                format!("{}年{}月{}日", now.year(), now.month(), now.day())
            }
            SummaryWindow::LastWeek => {
                format!("{}年{}月第{}週", now.year(), now.month(), (now.day() - 1) / 7 + 1)
            }
        }
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Clone)]
pub struct SummaryStats {
    pub dominant_emotion: String,
    pub dominant_intensity: f64,
    pub avg_importance: f64,
    pub top_tags: Vec<String>,
    pub highlights: Vec<String>,
}

/// Dominant emotion: group by label, pick the one with the highest average
/// intensity. Returns ("neutral", 0.0) for an empty set.
pub fn dominant_emotion(memories: &[MemoryRecord]) -> (String, f64) {
    if memories.is_empty() {
        return ("neutral".to_string(), 0.0);
    }
    let mut grouped: HashMap<&str, Vec<f64>> = HashMap::new();
    for memory in memories {
        grouped
            .entry(memory.emotion.as_str())
            .or_default()
            .push(memory.emotion_intensity);
    }
    grouped
        .into_iter()
        .map(|(emotion, intensities)| {
            let avg = intensities.iter().sum::<f64>() / intensities.len() as f64;
            (emotion.to_string(), avg)
        })
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or(("neutral".to_string(), 0.0))
}

pub fn compute_stats(memories: &[MemoryRecord]) -> SummaryStats {
    let (dominant, intensity) = dominant_emotion(memories);
    let avg_importance = if memories.is_empty() {
        0.0
    } else {
        memories.iter().map(|m| m.importance).sum::<f64>() / memories.len() as f64
    };

    let mut tag_counts: HashMap<&str, usize> = HashMap::new();
    for memory in memories {
        for tag in &memory.tags {
            *tag_counts.entry(tag.as_str()).or_default() += 1;
        }
    }
    let mut ranked_tags: Vec<(&str, usize)> = tag_counts.into_iter().collect();
    ranked_tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let top_tags = ranked_tags
        .into_iter()
        .take(3)
        .map(|(tag, _)| tag.to_string())
        .collect();

    // Highlights: top scorers by importance x intensity.
    let mut scored: Vec<&MemoryRecord> = memories.iter().collect();
    scored.sort_by(|a, b| {
        let score_a = a.importance * a.emotion_intensity.max(0.5);
        let score_b = b.importance * b.emotion_intensity.max(0.5);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let highlights = scored
        .into_iter()
        .take(3)
        .map(|m| m.content.chars().take(100).collect::<String>())
        .collect();

    SummaryStats {
        dominant_emotion: dominant,
        dominant_intensity: intensity,
        avg_importance,
        top_tags,
        highlights,
    }
}

/// Statistical summary content for a period.
pub fn build_summary_content(
    memories: &[MemoryRecord],
    stats: &SummaryStats,
    description: &str,
) -> String {
    if memories.is_empty() {
        return format!("{}の記憶なし", description);
    }

    let mut parts = vec![
        format!("{}の記憶要約:", description),
        format!("- 記憶数: {}件", memories.len()),
        format!(
            "- 支配的感情: {} (強度: {:.2})",
            stats.dominant_emotion, stats.dominant_intensity
        ),
        format!("- 平均重要度: {:.2}", stats.avg_importance),
    ];
    if !stats.top_tags.is_empty() {
        parts.push(format!("- 主なテーマ: {}", stats.top_tags.join(", ")));
    }
    parts.push("\n主な出来事:".to_string());
    for (i, highlight) in stats.highlights.iter().enumerate() {
        parts.push(format!("{}. {}...", i + 1, highlight));
    }
    parts.join("\n")
}

/// Build the summary node for a member set. Returns the record and the
/// member keys to link. The node carries the union of member tags, the
/// dominant emotion, boosted importance, and `related_keys` = the members.
pub fn build_summary_record(
    members: &[MemoryRecord],
    start: DateTime<FixedOffset>,
    description: &str,
    now: DateTime<FixedOffset>,
) -> Option<(MemoryRecord, Vec<String>)> {
    if members.is_empty() {
        return None;
    }

    let stats = compute_stats(members);
    let content = build_summary_content(members, &stats, description);
    let member_keys: Vec<String> = members.iter().map(|m| m.key.clone()).collect();

    let mut tags: Vec<String> = members
        .iter()
        .flat_map(|m| m.tags.iter().cloned())
        .collect();
    tags.sort();
    tags.dedup();

    let key = format!("summary_{}", start.format("%Y%m%d"));
    let mut record = MemoryRecord::new(key, content, now);
    record.tags = tags;
    record.importance = (stats.avg_importance * 1.2).min(1.0);
    record.emotion = stats.dominant_emotion;
    record.emotion_intensity = stats.dominant_intensity;
    record.related_keys = member_keys.clone();
    Some((record, member_keys))
}

// ============================================================================
// WORKER LOOP
// ============================================================================

pub async fn run_summarizer_loop(engine: Arc<MemoryEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut last_run: Option<std::time::Instant> = None;

    loop {
        if super::sleep_or_shutdown(&mut shutdown, POLL_INTERVAL).await {
            return;
        }

        let config = engine.config();
        let summarization = &config.summarization;
        if !summarization.enabled {
            continue;
        }

        let check_elapsed = last_run
            .map(|at| at.elapsed().as_secs() >= summarization.check_interval_seconds)
            .unwrap_or(true);
        let idle = engine
            .activity
            .seconds_since_write()
            .map(|secs| secs >= summarization.idle_minutes * 60)
            .unwrap_or(false);
        let frequency_elapsed = last_run
            .map(|at| at.elapsed().as_secs() >= summarization.frequency_days * 86_400)
            .unwrap_or(true);
        if !check_elapsed || !idle || !frequency_elapsed {
            continue;
        }
        last_run = Some(std::time::Instant::now());

        for handle in engine.open_personas() {
            match engine
                .summarize_recent(&handle.name, SummaryWindow::LastDay)
                .await
            {
                Ok(Some(summary_key)) => {
                    tracing::info!(persona = %handle.name, %summary_key, "Auto-summary created");
                }
                Ok(None) => {
                    tracing::debug!(persona = %handle.name, "Auto-summarization skipped (no memories)");
                }
                Err(e) => {
                    tracing::warn!(persona = %handle.name, "Auto-summarization failed: {}", e);
                    if super::sleep_or_shutdown(&mut shutdown, ERROR_BACKOFF).await {
                        return;
                    }
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn memory(key: &str, emotion: &str, intensity: f64, importance: f64) -> MemoryRecord {
        let mut record = MemoryRecord::new(
            key.to_string(),
            format!("content of {}", key),
            Utc::now().fixed_offset(),
        );
        record.emotion = emotion.to_string();
        record.emotion_intensity = intensity;
        record.importance = importance;
        record
    }

    #[test]
    fn test_dominant_emotion_by_average_intensity() {
        // joy appears twice at lower intensity; sadness once, higher avg
        let memories = vec![
            memory("memory_1", "joy", 0.3, 0.5),
            memory("memory_2", "joy", 0.4, 0.5),
            memory("memory_3", "sadness", 0.9, 0.5),
        ];
        let (emotion, intensity) = dominant_emotion(&memories);
        assert_eq!(emotion, "sadness");
        assert!((intensity - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_dominant_emotion_empty() {
        assert_eq!(dominant_emotion(&[]), ("neutral".to_string(), 0.0));
    }

    #[test]
    fn test_stats_top_tags() {
        let mut a = memory("memory_1", "joy", 0.5, 0.5);
        a.tags = vec!["rust".into(), "work".into()];
        let mut b = memory("memory_2", "joy", 0.5, 0.5);
        b.tags = vec!["rust".into()];
        let stats = compute_stats(&[a, b]);
        assert_eq!(stats.top_tags[0], "rust");
    }

    #[test]
    fn test_summary_record_shape() {
        let now = Utc::now().fixed_offset();
        let start = DateTime::parse_from_rfc3339("2025-11-01T00:00:00+09:00").unwrap();
        let members = vec![
            memory("memory_20251101000001", "joy", 0.8, 0.6),
            memory("memory_20251101000002", "joy", 0.6, 0.8),
        ];

        let (record, keys) = build_summary_record(&members, start, "テスト期間", now).unwrap();
        assert_eq!(record.key, "summary_20251101");
        assert!(record.is_summary());
        assert_eq!(keys.len(), 2);
        assert_eq!(record.related_keys, keys);
        assert_eq!(record.emotion, "joy");
        // Boosted mean importance: (0.6 + 0.8) / 2 * 1.2 = 0.84
        assert!((record.importance - 0.84).abs() < 1e-9);
        assert!(record.content.contains("記憶数: 2件"));
    }

    #[test]
    fn test_summary_record_empty_window() {
        let now = Utc::now().fixed_offset();
        assert!(build_summary_record(&[], now, "x", now).is_none());
    }

    #[test]
    fn test_window_bounds_and_description() {
        let now = DateTime::parse_from_rfc3339("2025-11-15T12:00:00+09:00").unwrap();
        let (start, end) = SummaryWindow::LastDay.bounds(now);
        assert_eq!(end - start, chrono::Duration::days(1));
        assert_eq!(SummaryWindow::LastDay.description(now), "2025年11月15日");
        assert_eq!(SummaryWindow::LastWeek.description(now), "2025年11月第3週");
    }
}
