//! Vector Store Queue
//!
//! A single unbounded FIFO consumed by one daemon worker, started on first
//! enqueue. Durable writes are synchronous; vector-index work is deferred
//! here so it never blocks the caller. On task failure the process-wide
//! dirty flag is raised and the task is dropped - no inline retry, no DLQ;
//! the idle rebuilder is the recovery path.
//!
//! Ordering: operations for a given key are applied in enqueue order (FIFO,
//! single consumer). No ordering guarantee across keys.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::store::MemoryStore;
use crate::vector::VectorStore;

// ============================================================================
// SHARED ACTIVITY STATE
// ============================================================================

/// Process-wide write/rebuild bookkeeping shared by the queue and the
/// background workers.
#[derive(Default)]
pub struct ActivityState {
    dirty: AtomicBool,
    last_write: Mutex<Option<Instant>>,
    last_rebuild: Mutex<Option<Instant>>,
    /// Serializes full rebuilds; writers never take this lock.
    pub rebuild_lock: tokio::sync::Mutex<()>,
}

impl ActivityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a durable write (resets the idle timers).
    pub fn record_write(&self) {
        if let Ok(mut guard) = self.last_write.lock() {
            *guard = Some(Instant::now());
        }
    }

    /// Raise the dirty flag: the vector index is known to lag the store.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.record_write();
    }

    /// Cleared only by a successful rebuild.
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
        if let Ok(mut guard) = self.last_rebuild.lock() {
            *guard = Some(Instant::now());
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn seconds_since_write(&self) -> Option<u64> {
        self.last_write
            .lock()
            .ok()
            .and_then(|guard| guard.map(|at| at.elapsed().as_secs()))
    }

    pub fn seconds_since_rebuild(&self) -> Option<u64> {
        self.last_rebuild
            .lock()
            .ok()
            .and_then(|guard| guard.map(|at| at.elapsed().as_secs()))
    }
}

// ============================================================================
// TASKS
// ============================================================================

/// Importance-adjustment inputs for post-write association generation.
#[derive(Debug, Clone, Copy)]
pub struct AssociationInput {
    pub emotion_intensity: f64,
    pub base_importance: f64,
}

pub enum VectorOp {
    Upsert {
        key: String,
        enriched_text: String,
        raw_content: String,
        payload: Value,
        associate: Option<AssociationInput>,
    },
    Delete {
        keys: Vec<String>,
    },
    /// Test/shutdown aid: resolves once every prior task has been applied.
    Flush(oneshot::Sender<()>),
}

pub struct QueueTask {
    pub persona: String,
    pub op: VectorOp,
}

/// Resolves per-persona backends for the queue worker. Implemented by the
/// engine; kept as a seam so the worker never owns the registry directly.
pub trait QueueContext: Send + Sync + 'static {
    fn vector_store(&self, persona: &str) -> Option<Arc<dyn VectorStore>>;
    fn memory_store(&self, persona: &str) -> Option<Arc<MemoryStore>>;
}

// ============================================================================
// QUEUE
// ============================================================================

pub struct VectorQueue {
    tx: mpsc::UnboundedSender<QueueTask>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueueTask>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    activity: Arc<ActivityState>,
    depth: Arc<std::sync::atomic::AtomicU64>,
}

impl VectorQueue {
    pub fn new(activity: Arc<ActivityState>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            activity,
            depth: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Approximate number of queued-but-unapplied tasks.
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Enqueue a task, starting the daemon worker on first use.
    pub fn enqueue(&self, context: Arc<dyn QueueContext>, task: QueueTask) {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(task).is_err() {
            tracing::warn!("Vector queue closed; task dropped");
            self.depth.fetch_sub(1, Ordering::Relaxed);
            self.activity.mark_dirty();
            return;
        }
        self.ensure_worker(context);
    }

    /// Await application of everything enqueued before this call.
    pub async fn flush(&self, context: Arc<dyn QueueContext>) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            context,
            QueueTask {
                persona: String::new(),
                op: VectorOp::Flush(tx),
            },
        );
        let _ = rx.await;
    }

    fn ensure_worker(&self, context: Arc<dyn QueueContext>) {
        let mut worker = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let running = worker.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if running {
            return;
        }
        let rx = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(rx) = rx else {
            return;
        };
        let activity = Arc::clone(&self.activity);
        let depth = Arc::clone(&self.depth);
        *worker = Some(tokio::spawn(worker_loop(rx, context, activity, depth)));
        tracing::debug!("Vector store background worker started");
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<QueueTask>,
    context: Arc<dyn QueueContext>,
    activity: Arc<ActivityState>,
    depth: Arc<std::sync::atomic::AtomicU64>,
) {
    while let Some(task) = rx.recv().await {
        if let VectorOp::Flush(done) = task.op {
            depth.fetch_sub(1, Ordering::Relaxed);
            let _ = done.send(());
            continue;
        }
        if let Err(e) = apply_task(&*context, &task).await {
            tracing::warn!(
                persona = %task.persona,
                "Background vector task failed, marking index dirty: {}",
                e
            );
            activity.mark_dirty();
        }
        depth.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn apply_task(context: &dyn QueueContext, task: &QueueTask) -> crate::vector::Result<()> {
    let Some(vector) = context.vector_store(&task.persona) else {
        return Err(crate::vector::VectorError::Other(format!(
            "No vector store for persona {}",
            task.persona
        )));
    };

    match &task.op {
        VectorOp::Upsert {
            key,
            enriched_text,
            raw_content,
            payload,
            associate,
        } => {
            vector.upsert(key, enriched_text, payload.clone()).await?;
            if let Some(input) = associate {
                if let Some(store) = context.memory_store(&task.persona) {
                    generate_associations(&*vector, &store, key, raw_content, *input).await;
                }
            }
            Ok(())
        }
        VectorOp::Delete { keys } => vector.delete(keys).await,
        VectorOp::Flush(_) => Ok(()),
    }
}

/// Association generation: persist the k=3 nearest neighbors into the row's
/// related_keys and adjust importance from the emotional context. Failures
/// here never raise the dirty flag - the point itself was stored.
async fn generate_associations(
    vector: &dyn VectorStore,
    store: &MemoryStore,
    key: &str,
    content: &str,
    input: AssociationInput,
) {
    const NEIGHBORS: usize = 3;

    let hits = match vector.search_by_text(content, NEIGHBORS + 1, None).await {
        Ok(hits) => hits,
        Err(e) => {
            tracing::warn!("Association search failed for {}: {}", key, e);
            return;
        }
    };

    let neighbors: Vec<_> = hits
        .into_iter()
        .filter(|hit| hit.key != key)
        .take(NEIGHBORS)
        .collect();
    if neighbors.is_empty() {
        return;
    }

    let related: Vec<String> = neighbors.iter().map(|hit| hit.key.clone()).collect();
    if let Err(e) = store.set_related_keys(key, &related) {
        tracing::warn!("Failed to persist related keys for {}: {}", key, e);
        return;
    }

    // Own and neighbor emotion intensities each contribute up to +0.2.
    let neighbor_intensity: f64 = neighbors
        .iter()
        .map(|hit| {
            hit.payload
                .get("emotion_intensity")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0)
        })
        .sum::<f64>()
        / neighbors.len() as f64;
    let adjusted = (input.base_importance
        + input.emotion_intensity * 0.2
        + neighbor_intensity * 0.2)
        .min(1.0);
    if (adjusted - input.base_importance).abs() > f64::EPSILON {
        if let Err(e) = store.set_importance(key, adjusted) {
            tracing::warn!("Failed to adjust importance for {}: {}", key, e);
        }
    }

    tracing::debug!(
        "Generated {} associations for {} (importance {:.2} -> {:.2})",
        related.len(),
        key,
        input.base_importance,
        adjusted
    );
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{VectorFilter, VectorHit};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// In-memory vector backend that can be told to fail.
    struct MockVector {
        points: Mutex<HashMap<String, (String, Value)>>,
        fail: AtomicBool,
    }

    impl MockVector {
        fn new() -> Self {
            Self {
                points: Mutex::new(HashMap::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl VectorStore for MockVector {
        async fn upsert(&self, key: &str, text: &str, payload: Value) -> crate::vector::Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(crate::vector::VectorError::Other("injected".into()));
            }
            self.points
                .lock()
                .unwrap()
                .insert(key.to_string(), (text.to_string(), payload));
            Ok(())
        }

        async fn upsert_batch(
            &self,
            entries: Vec<(String, String, Value)>,
        ) -> crate::vector::Result<()> {
            for (key, text, payload) in entries {
                self.upsert(&key, &text, payload).await?;
            }
            Ok(())
        }

        async fn delete(&self, keys: &[String]) -> crate::vector::Result<()> {
            let mut points = self.points.lock().unwrap();
            for key in keys {
                points.remove(key);
            }
            Ok(())
        }

        async fn search_by_vector(
            &self,
            _vector: Vec<f32>,
            _k: usize,
            _filter: Option<&VectorFilter>,
        ) -> crate::vector::Result<Vec<VectorHit>> {
            Ok(Vec::new())
        }

        async fn search_by_text(
            &self,
            _query: &str,
            _k: usize,
            _filter: Option<&VectorFilter>,
        ) -> crate::vector::Result<Vec<VectorHit>> {
            Ok(Vec::new())
        }

        async fn count(&self) -> crate::vector::Result<u64> {
            Ok(self.points.lock().unwrap().len() as u64)
        }

        async fn recreate(&self) -> crate::vector::Result<()> {
            self.points.lock().unwrap().clear();
            Ok(())
        }
    }

    struct MockContext {
        vector: Arc<MockVector>,
    }

    impl QueueContext for MockContext {
        fn vector_store(&self, _persona: &str) -> Option<Arc<dyn VectorStore>> {
            Some(Arc::clone(&self.vector) as Arc<dyn VectorStore>)
        }

        fn memory_store(&self, _persona: &str) -> Option<Arc<MemoryStore>> {
            None
        }
    }

    fn upsert_task(key: &str) -> QueueTask {
        QueueTask {
            persona: "test".to_string(),
            op: VectorOp::Upsert {
                key: key.to_string(),
                enriched_text: "text".to_string(),
                raw_content: "text".to_string(),
                payload: serde_json::json!({}),
                associate: None,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_upsert_then_delete_for_same_key() {
        let activity = Arc::new(ActivityState::new());
        let queue = VectorQueue::new(Arc::clone(&activity));
        let vector = Arc::new(MockVector::new());
        let context: Arc<dyn QueueContext> = Arc::new(MockContext {
            vector: Arc::clone(&vector),
        });

        queue.enqueue(Arc::clone(&context), upsert_task("memory_a"));
        queue.enqueue(
            Arc::clone(&context),
            QueueTask {
                persona: "test".to_string(),
                op: VectorOp::Delete {
                    keys: vec!["memory_a".to_string()],
                },
            },
        );
        queue.flush(Arc::clone(&context)).await;

        assert_eq!(vector.count().await.unwrap(), 0);
        assert!(!activity.is_dirty());
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_sets_dirty_and_drops_task() {
        let activity = Arc::new(ActivityState::new());
        let queue = VectorQueue::new(Arc::clone(&activity));
        let vector = Arc::new(MockVector::new());
        vector.fail.store(true, Ordering::Relaxed);
        let context: Arc<dyn QueueContext> = Arc::new(MockContext {
            vector: Arc::clone(&vector),
        });

        queue.enqueue(Arc::clone(&context), upsert_task("memory_a"));
        queue.flush(Arc::clone(&context)).await;

        assert!(activity.is_dirty());
        assert_eq!(vector.count().await.unwrap(), 0);

        // The queue keeps consuming after a failure
        vector.fail.store(false, Ordering::Relaxed);
        queue.enqueue(Arc::clone(&context), upsert_task("memory_b"));
        queue.flush(context).await;
        assert_eq!(vector.count().await.unwrap(), 1);
    }

    #[test]
    fn test_activity_state_dirty_lifecycle() {
        let activity = ActivityState::new();
        assert!(!activity.is_dirty());
        activity.mark_dirty();
        assert!(activity.is_dirty());
        assert!(activity.seconds_since_write().is_some());
        activity.clear_dirty();
        assert!(!activity.is_dirty());
        assert!(activity.seconds_since_rebuild().is_some());
    }
}
