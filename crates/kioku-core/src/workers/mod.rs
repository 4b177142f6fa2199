//! Background Workers
//!
//! Three cooperative daemons: the idle vector rebuilder, the cleanup
//! suggester, and the auto-summarizer. Each is a poll-with-sleep loop that
//! observes the shared activity state and respects the shutdown signal
//! within one poll interval.

mod cleanup;
mod rebuild;
pub mod summarize;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::engine::MemoryEngine;

pub use cleanup::run_cleanup_loop;
pub use rebuild::run_rebuild_loop;
pub use summarize::run_summarizer_loop;

/// Grace period for worker shutdown before abandoning the task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handles to the spawned workers with an explicit stop signal.
pub struct WorkerHandles {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerHandles {
    /// Spawn the worker set. Individual loops check their own config each
    /// iteration, so a disabled worker idles cheaply rather than exiting
    /// (config may be re-enabled at runtime).
    pub fn spawn(engine: Arc<MemoryEngine>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = vec![
            tokio::spawn(run_rebuild_loop(Arc::clone(&engine), shutdown_rx.clone())),
            tokio::spawn(run_cleanup_loop(Arc::clone(&engine), shutdown_rx.clone())),
            tokio::spawn(run_summarizer_loop(engine, shutdown_rx)),
        ];

        tracing::info!("Background workers started (rebuild, cleanup, summarizer)");
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Signal shutdown and wait up to the grace period per worker.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!("Worker did not stop within the grace period; abandoning");
            }
        }
    }
}

/// Sleep for `period` unless shutdown fires first. Returns true when the
/// loop should exit.
pub(crate) async fn sleep_or_shutdown(
    shutdown: &mut watch::Receiver<bool>,
    period: Duration,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
