//! Idle Vector Rebuilder
//!
//! Watches `(dirty, last_write, last_rebuild)` and triggers a full rebuild
//! once the store has been quiet for `idle_seconds` and at least
//! `min_interval` has passed since the previous rebuild. The rebuild
//! itself streams rows from the durable store (the source of truth), so a
//! lagging or lost vector index is always recoverable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::engine::MemoryEngine;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub async fn run_rebuild_loop(engine: Arc<MemoryEngine>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if super::sleep_or_shutdown(&mut shutdown, POLL_INTERVAL).await {
            return;
        }

        let config = engine.config();
        if config.vector_rebuild.mode != "idle" {
            continue;
        }
        if !engine.activity.is_dirty() {
            continue;
        }

        let idle_ok = engine
            .activity
            .seconds_since_write()
            .map(|secs| secs >= config.vector_rebuild.idle_seconds)
            .unwrap_or(true);
        let interval_ok = engine
            .activity
            .seconds_since_rebuild()
            .map(|secs| secs >= config.vector_rebuild.min_interval)
            .unwrap_or(true);
        if !idle_ok || !interval_ok {
            continue;
        }

        match engine.rebuild_vector_indexes().await {
            Ok(rows) => {
                tracing::info!(rows, "Idle rebuild complete; dirty flag cleared");
            }
            Err(e) => {
                tracing::warn!("Idle rebuild failed: {}", e);
                if super::sleep_or_shutdown(&mut shutdown, ERROR_BACKOFF).await {
                    return;
                }
            }
        }
    }
}
