//! Cleanup Suggester
//!
//! Periodically scans recent writes for near-duplicates via vector
//! similarity and publishes a ranked suggestion list through the engine's
//! cleanup report. Strictly non-destructive: it never deletes anything.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::engine::{CleanupReport, CleanupSuggestion, MemoryEngine};

const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// How many recent memories each scan inspects per persona.
const SCAN_WINDOW: usize = 50;

fn preview(content: &str) -> String {
    let truncated: String = content.chars().take(80).collect();
    if content.chars().count() > 80 {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

pub async fn run_cleanup_loop(engine: Arc<MemoryEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut last_scan: Option<std::time::Instant> = None;

    loop {
        if super::sleep_or_shutdown(&mut shutdown, POLL_INTERVAL).await {
            return;
        }

        let config = engine.config();
        let cleanup = &config.auto_cleanup;
        if !cleanup.enabled {
            continue;
        }

        let interval_elapsed = last_scan
            .map(|at| at.elapsed().as_secs() >= cleanup.check_interval_seconds)
            .unwrap_or(true);
        let idle = engine
            .activity
            .seconds_since_write()
            .map(|secs| secs >= cleanup.idle_minutes * 60)
            .unwrap_or(false);
        if !interval_elapsed || !idle {
            continue;
        }
        last_scan = Some(std::time::Instant::now());

        match scan(&engine, cleanup).await {
            Ok(report) => {
                if !report.suggestions.is_empty() {
                    tracing::info!(
                        suggestions = report.suggestions.len(),
                        "Cleanup scan found near-duplicates"
                    );
                }
                engine.set_cleanup_report(report);
            }
            Err(e) => tracing::warn!("Cleanup scan failed: {}", e),
        }
    }
}

async fn scan(
    engine: &Arc<MemoryEngine>,
    config: &crate::config::AutoCleanupConfig,
) -> crate::engine::Result<CleanupReport> {
    let mut suggestions: Vec<CleanupSuggestion> = Vec::new();
    let mut seen_pairs: HashSet<(String, String)> = HashSet::new();

    for handle in engine.open_personas() {
        let keys = handle.store.recent_keys(SCAN_WINDOW)?;
        for key in keys {
            let Some(record) = handle.store.get(&key)? else {
                continue;
            };
            let hits = match handle.vector.search_by_text(&record.content, 4, None).await {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::debug!("Cleanup similarity search failed for {}: {}", key, e);
                    continue;
                }
            };
            for hit in hits {
                if hit.key == key {
                    continue;
                }
                let similarity = 1.0 - hit.distance;
                if (similarity as f64) < config.min_similarity_to_report {
                    continue;
                }
                let pair = if key < hit.key {
                    (key.clone(), hit.key.clone())
                } else {
                    (hit.key.clone(), key.clone())
                };
                if !seen_pairs.insert(pair.clone()) {
                    continue;
                }
                let action = if (similarity as f64) >= config.duplicate_threshold {
                    "merge"
                } else {
                    "review"
                };
                suggestions.push(CleanupSuggestion {
                    persona: handle.name.clone(),
                    key_a: pair.0,
                    key_b: pair.1,
                    similarity,
                    action: action.to_string(),
                    preview_a: preview(&record.content),
                    preview_b: preview(&hit.content),
                });
            }
        }
    }

    // Strongest matches first; true duplicates above the threshold lead.
    suggestions.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    suggestions.truncate(config.max_suggestions_per_run);

    Ok(CleanupReport {
        generated_at: Some(chrono::Utc::now().to_rfc3339()),
        suggestions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "🧠".repeat(100);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert!(p.chars().count() <= 83);
        assert_eq!(preview("short"), "short");
    }
}
