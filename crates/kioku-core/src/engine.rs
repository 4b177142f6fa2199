//! Memory Engine
//!
//! The explicit context passed to handlers: configuration, the shared
//! embedding/reranker models, the vector-store queue with its dirty flag,
//! and the per-persona handles (durable store, equipment store, context
//! document, vector collection). Replaces module-level singletons; callers
//! hold an `Arc<MemoryEngine>` and thread the persona through every call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset};
use serde_json::json;

use crate::config::{Config, ConfigManager};
use crate::context::PersonaContext;
use crate::embed::{EmbedError, Embedder, Reranker};
use crate::equipment::EquipmentStore;
use crate::persona::PersonaPaths;
use crate::privacy;
use crate::record::{MemoryRecord, OpLogEntry};
use crate::search::{SearchHit, SearchOrchestrator, SearchRequest};
use crate::store::{MemoryStats, MemoryStore, StoreError};
use crate::timeutil;
use crate::vector::{VectorError, VectorStore};
use crate::write::queue::{
    ActivityState, AssociationInput, QueueContext, QueueTask, VectorOp, VectorQueue,
};
use crate::write::{
    build_enriched_text, build_payload, generate_key, CreateMemoryInput, UpdateMemoryInput,
};

// ============================================================================
// ERRORS
// ============================================================================

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Vector index error: {0}")]
    Vector(#[from] VectorError),
    #[error("Embedding error: {0}")]
    Embed(#[from] EmbedError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether this error is the caller's fault (4xx) rather than ours (5xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::NotFound(_))
    }
}

// ============================================================================
// PERSONA HANDLE
// ============================================================================

/// Everything persona-scoped, constructed on first access.
pub struct PersonaHandle {
    pub name: String,
    pub store: Arc<MemoryStore>,
    pub equipment: Arc<EquipmentStore>,
    pub context: PersonaContext,
    pub vector: Arc<dyn VectorStore>,
}

/// Produces the vector backend for a persona. Tests swap in a mock.
pub type VectorFactory = dyn Fn(&str, &Config, Arc<dyn Embedder>) -> std::result::Result<Arc<dyn VectorStore>, VectorError>
    + Send
    + Sync;

// ============================================================================
// CLEANUP REPORT (shared with the suggester worker)
// ============================================================================

#[derive(Debug, Clone, serde::Serialize)]
pub struct CleanupSuggestion {
    pub persona: String,
    pub key_a: String,
    pub key_b: String,
    pub similarity: f32,
    /// "merge" above the duplicate threshold, "review" below it.
    pub action: String,
    pub preview_a: String,
    pub preview_b: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CleanupReport {
    pub generated_at: Option<String>,
    pub suggestions: Vec<CleanupSuggestion>,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct MemoryEngine {
    config: ConfigManager,
    embedder: Arc<dyn Embedder>,
    reranker: Reranker,
    pub activity: Arc<ActivityState>,
    queue: VectorQueue,
    vector_factory: Box<VectorFactory>,
    personas: Mutex<HashMap<String, Arc<PersonaHandle>>>,
    cleanup_report: Mutex<CleanupReport>,
}

pub struct EngineBuilder {
    data_dir: PathBuf,
    embedder: Option<Arc<dyn Embedder>>,
    vector_factory: Option<Box<VectorFactory>>,
}

impl EngineBuilder {
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_vector_factory(mut self, factory: Box<VectorFactory>) -> Self {
        self.vector_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Arc<MemoryEngine>> {
        let config = ConfigManager::new(self.data_dir);
        let resolved = config.load();

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => MemoryEngine::default_embedder(&config, &resolved),
        };

        let reranker = Reranker::new(
            &resolved.reranker_model,
            resolved.reranker_top_n.max(1),
            config.cache_dir(),
        );

        let vector_factory: Box<VectorFactory> = match self.vector_factory {
            Some(factory) => factory,
            None => Box::new(|persona, config, embedder| {
                let collection = format!("{}{}", config.qdrant_collection_prefix, persona);
                Ok(Arc::new(crate::vector::QdrantVectorStore::connect(
                    &config.qdrant_url,
                    config.qdrant_api_key.as_deref(),
                    collection,
                    embedder,
                )?) as Arc<dyn VectorStore>)
            }),
        };

        let activity = Arc::new(ActivityState::new());
        let queue = VectorQueue::new(Arc::clone(&activity));

        Ok(Arc::new(MemoryEngine {
            config,
            embedder,
            reranker,
            activity,
            queue,
            vector_factory,
            personas: Mutex::new(HashMap::new()),
            cleanup_report: Mutex::new(CleanupReport::default()),
        }))
    }
}

impl QueueContext for MemoryEngine {
    fn vector_store(&self, persona: &str) -> Option<Arc<dyn VectorStore>> {
        self.open_personas()
            .into_iter()
            .find(|h| h.name == persona)
            .map(|h| Arc::clone(&h.vector))
    }

    fn memory_store(&self, persona: &str) -> Option<Arc<MemoryStore>> {
        self.open_personas()
            .into_iter()
            .find(|h| h.name == persona)
            .map(|h| Arc::clone(&h.store))
    }
}

impl MemoryEngine {
    pub fn builder(data_dir: PathBuf) -> EngineBuilder {
        EngineBuilder {
            data_dir,
            embedder: None,
            vector_factory: None,
        }
    }

    #[cfg(feature = "embeddings")]
    fn default_embedder(config: &ConfigManager, resolved: &Config) -> Arc<dyn Embedder> {
        Arc::new(crate::embed::FastembedEmbedder::new(
            &resolved.embeddings_model,
            config.cache_dir(),
        ))
    }

    #[cfg(not(feature = "embeddings"))]
    fn default_embedder(_config: &ConfigManager, _resolved: &Config) -> Arc<dyn Embedder> {
        Arc::new(crate::embed::DisabledEmbedder)
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load()
    }

    pub fn config_manager(&self) -> &ConfigManager {
        &self.config
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Current time in the configured service timezone.
    pub fn now(&self) -> DateTime<FixedOffset> {
        timeutil::now_in_tz(&self.config().timezone)
    }

    /// Resolve (and lazily open) a persona handle. Opens for the same
    /// persona are serialized by the registry lock.
    pub fn persona(&self, name: &str) -> Result<Arc<PersonaHandle>> {
        let safe = crate::persona::sanitize(name);
        let mut personas = self
            .personas
            .lock()
            .map_err(|_| EngineError::Store(StoreError::Init("Persona registry poisoned".into())))?;
        if let Some(handle) = personas.get(&safe) {
            return Ok(Arc::clone(handle));
        }

        let config = self.config();
        let memory_root = self.config.memory_root();
        let paths = PersonaPaths::new(&memory_root, &safe);
        paths.ensure(&memory_root).map_err(StoreError::Io)?;

        let store = Arc::new(MemoryStore::open(&paths.db_path(), &safe)?);
        let equipment = Arc::new(EquipmentStore::open(&paths.equipment_db_path(), &safe)?);
        let context = PersonaContext::new(&safe, paths.context_path());
        let vector = (self.vector_factory)(&safe, &config, Arc::clone(&self.embedder))?;

        let handle = Arc::new(PersonaHandle {
            name: safe.clone(),
            store,
            equipment,
            context,
            vector,
        });
        personas.insert(safe, Arc::clone(&handle));
        Ok(handle)
    }

    /// All currently open persona handles.
    pub fn open_personas(&self) -> Vec<Arc<PersonaHandle>> {
        self.personas
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    fn enqueue(self: &Arc<Self>, persona: &str, op: VectorOp) {
        let context: Arc<dyn QueueContext> = Arc::clone(self) as Arc<dyn QueueContext>;
        self.queue.enqueue(
            context,
            QueueTask {
                persona: persona.to_string(),
                op,
            },
        );
    }

    /// Await the vector queue; test and shutdown aid.
    pub async fn flush_queue(self: &Arc<Self>) {
        let context: Arc<dyn QueueContext> = Arc::clone(self) as Arc<dyn QueueContext>;
        self.queue.flush(context).await;
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue.depth()
    }

    // ========================================================================
    // MEMORY OPERATIONS
    // ========================================================================

    /// Create a memory: normalize, assign key, durable write, enqueue the
    /// vector upsert, kick association generation. Returns the stored row.
    pub fn create_memory(
        self: &Arc<Self>,
        persona: &str,
        input: CreateMemoryInput,
    ) -> Result<MemoryRecord> {
        if input.content.trim().is_empty() {
            return Err(EngineError::Validation("content is required".into()));
        }

        let handle = self.persona(persona)?;
        let config = self.config();
        let now = self.now();

        let (content, privacy_level) = privacy::prepare_content(
            &input.content,
            input.privacy_level,
            &input.tags,
            config.default_privacy_level(),
            config.privacy.auto_redact_pii,
        );

        let key = match &input.key {
            Some(key) => {
                if !crate::record::is_valid_memory_key(key) {
                    return Err(EngineError::Validation(format!("Invalid memory key: {}", key)));
                }
                key.clone()
            }
            None => generate_key(now, |candidate| {
                handle
                    .store
                    .get(candidate)
                    .map(|found| found.is_some())
                    .unwrap_or(false)
            }),
        };

        let mut record = MemoryRecord::new(key, content, now);
        record.tags = input.tags;
        if let Some(importance) = input.importance {
            record.importance = importance;
        }
        if let Some(emotion) = input.emotion {
            record.emotion = emotion;
        }
        if let Some(intensity) = input.emotion_intensity {
            record.emotion_intensity = intensity;
        }
        if let Some(state) = input.physical_state {
            record.physical_state = state;
        }
        if let Some(state) = input.mental_state {
            record.mental_state = state;
        }
        if let Some(environment) = input.environment {
            record.environment = environment;
        }
        if let Some(status) = input.relationship_status {
            record.relationship_status = status;
        }
        record.action_tag = input.action_tag;
        record.privacy_level = privacy_level;
        record.clamp_ranges();

        // Equipment snapshot: explicit value wins, else the current state.
        record.equipped_items = match input.equipped_items {
            Some(items) => Some(items),
            None => match handle.equipment.current_equipment() {
                Ok(items) if !items.is_empty() => Some(items),
                _ => None,
            },
        };

        let result = handle.store.upsert(&record);
        let entry = match &result {
            Ok(()) => OpLogEntry::success("create", Some(&record.key))
                .with_images(None, serde_json::to_value(&record).ok()),
            Err(e) => OpLogEntry::failure("create", Some(&record.key), &e.to_string()),
        };
        handle.store.append_op_log(&entry, now);
        result?;

        // Emotional state flows into the history stream as well.
        if record.emotion != "neutral" || record.emotion_intensity > 0.0 {
            if let Err(e) = handle.store.append_emotion(
                Some(&record.key),
                &record.emotion,
                record.emotion_intensity,
                now,
            ) {
                tracing::warn!("Failed to append emotion history: {}", e);
            }
        }

        self.activity.record_write();

        if !input.defer_vector {
            self.enqueue(
                &handle.name,
                VectorOp::Upsert {
                    key: record.key.clone(),
                    enriched_text: build_enriched_text(&record),
                    raw_content: record.content.clone(),
                    payload: build_payload(&record),
                    associate: Some(AssociationInput {
                        emotion_intensity: record.emotion_intensity,
                        base_importance: record.importance,
                    }),
                },
            );
        }

        Ok(record)
    }

    /// Update an existing memory; same key keeps the same vector point id.
    pub fn update_memory(
        self: &Arc<Self>,
        persona: &str,
        key: &str,
        input: UpdateMemoryInput,
    ) -> Result<MemoryRecord> {
        let handle = self.persona(persona)?;
        let now = self.now();

        let mut record = handle
            .store
            .get(key)?
            .ok_or_else(|| EngineError::NotFound(key.to_string()))?;
        let before = serde_json::to_value(&record).ok();
        input.apply(&mut record, now);

        let result = handle.store.upsert(&record);
        let entry = match &result {
            Ok(()) => OpLogEntry::success("update", Some(key))
                .with_images(before, serde_json::to_value(&record).ok()),
            Err(e) => OpLogEntry::failure("update", Some(key), &e.to_string()),
        };
        handle.store.append_op_log(&entry, now);
        result?;

        self.activity.record_write();
        self.enqueue(
            &handle.name,
            VectorOp::Upsert {
                key: record.key.clone(),
                enriched_text: build_enriched_text(&record),
                raw_content: record.content.clone(),
                payload: build_payload(&record),
                associate: None,
            },
        );
        Ok(record)
    }

    /// Delete a memory. Idempotent: deleting a missing key succeeds as a
    /// no-op and reports `false`.
    pub fn delete_memory(self: &Arc<Self>, persona: &str, key: &str) -> Result<bool> {
        let handle = self.persona(persona)?;
        let now = self.now();

        let before = handle.store.get(key)?;
        let result = handle.store.delete(key);
        let entry = match &result {
            Ok(existed) => OpLogEntry::success("delete", Some(key)).with_images(
                before.as_ref().and_then(|r| serde_json::to_value(r).ok()),
                Some(json!({ "deleted": existed })),
            ),
            Err(e) => OpLogEntry::failure("delete", Some(key), &e.to_string()),
        };
        handle.store.append_op_log(&entry, now);
        let existed = result?;

        self.activity.record_write();
        if existed {
            self.enqueue(
                &handle.name,
                VectorOp::Delete {
                    keys: vec![key.to_string()],
                },
            );
        }
        Ok(existed)
    }

    /// Read one memory by key, bumping access tracking best-effort.
    pub fn read_memory(&self, persona: &str, key: &str) -> Result<Option<MemoryRecord>> {
        let handle = self.persona(persona)?;
        let record = handle.store.get(key)?;
        if record.is_some() {
            handle.store.increment_access(key, self.now());
        }
        Ok(record)
    }

    pub fn recent_memories(&self, persona: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let handle = self.persona(persona)?;
        let keys = handle.store.recent_keys(limit)?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = handle.store.get(&key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn search(
        self: &Arc<Self>,
        persona: &str,
        request: SearchRequest,
    ) -> Result<Vec<SearchHit>> {
        let handle = self.persona(persona)?;
        let config = self.config();
        let orchestrator = SearchOrchestrator {
            store: handle.store.as_ref(),
            vector: handle.vector.as_ref(),
            reranker: &self.reranker,
            config: &config,
        };
        orchestrator.search(request, self.now()).await
    }

    pub fn memory_stats(&self, persona: &str) -> Result<MemoryStats> {
        let handle = self.persona(persona)?;
        Ok(handle.store.stats()?)
    }

    // ========================================================================
    // REBUILD (recovery path for the dirty flag)
    // ========================================================================

    /// Stream all rows of every open persona into freshly recreated
    /// collections, then clear the dirty flag. Serialized by the rebuild
    /// lock; writers keep enqueueing while this runs.
    pub async fn rebuild_vector_indexes(self: &Arc<Self>) -> Result<u64> {
        const BATCH: usize = 32;

        let _guard = self.activity.rebuild_lock.lock().await;
        let mut total: u64 = 0;

        for handle in self.open_personas() {
            handle.vector.recreate().await?;
            let snapshot = handle.store.load_all()?;
            let mut batch: Vec<(String, String, serde_json::Value)> =
                Vec::with_capacity(BATCH);
            for record in snapshot.values() {
                batch.push((
                    record.key.clone(),
                    build_enriched_text(record),
                    build_payload(record),
                ));
                if batch.len() >= BATCH {
                    handle.vector.upsert_batch(std::mem::take(&mut batch)).await?;
                }
            }
            if !batch.is_empty() {
                handle.vector.upsert_batch(batch).await?;
            }
            total += snapshot.len() as u64;
            tracing::info!(
                persona = %handle.name,
                rows = snapshot.len(),
                "Vector collection rebuilt"
            );
        }

        self.activity.clear_dirty();
        Ok(total)
    }

    // ========================================================================
    // SUMMARIZATION & DECAY
    // ========================================================================

    /// Summarize a window of memories into a `summary_YYYYMMDD` node and
    /// link the members via `summary_ref`. Returns the summary key, or
    /// `None` when the window holds nothing above `min_importance`.
    pub async fn summarize_recent(
        self: &Arc<Self>,
        persona: &str,
        window: crate::workers::summarize::SummaryWindow,
    ) -> Result<Option<String>> {
        let handle = self.persona(persona)?;
        let config = self.config();
        let now = self.now();
        let (start, end) = window.bounds(now);

        let members = handle
            .store
            .memories_in_window(start, end, config.summarization.min_importance)?;
        // A previous summary of the same window must not summarize itself.
        let members: Vec<_> = members.into_iter().filter(|m| !m.is_summary()).collect();

        let Some((record, member_keys)) = crate::workers::summarize::build_summary_record(
            &members,
            start,
            &window.description(now),
            now,
        ) else {
            return Ok(None);
        };

        let result = handle.store.upsert(&record);
        let entry = match &result {
            Ok(()) => OpLogEntry::success("summarize", Some(&record.key))
                .with_images(None, serde_json::to_value(&record).ok()),
            Err(e) => OpLogEntry::failure("summarize", Some(&record.key), &e.to_string()),
        };
        handle.store.append_op_log(&entry, now);
        result?;

        handle.store.link_summary(&member_keys, &record.key)?;
        self.activity.record_write();

        self.enqueue(
            &handle.name,
            VectorOp::Upsert {
                key: record.key.clone(),
                enriched_text: build_enriched_text(&record),
                raw_content: record.content.clone(),
                payload: build_payload(&record),
                // related_keys already carry the member set
                associate: None,
            },
        );
        Ok(Some(record.key))
    }

    /// Apply importance decay across a persona's memories.
    pub fn apply_decay(
        &self,
        persona: &str,
        dry_run: bool,
    ) -> Result<std::collections::HashMap<String, f64>> {
        let handle = self.persona(persona)?;
        Ok(crate::forgetting::decay_all(&handle.store, self.now(), dry_run)?)
    }

    // ========================================================================
    // CLEANUP REPORT
    // ========================================================================

    pub fn cleanup_report(&self) -> CleanupReport {
        self.cleanup_report
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn set_cleanup_report(&self, report: CleanupReport) {
        if let Ok(mut guard) = self.cleanup_report.lock() {
            *guard = report;
        }
    }

    // ========================================================================
    // METRICS
    // ========================================================================

    /// Snapshot surfaced through the `memory://metrics` resource.
    pub fn metrics(&self) -> serde_json::Value {
        let personas: Vec<serde_json::Value> = self
            .open_personas()
            .iter()
            .map(|handle| {
                let stats = handle.store.stats().unwrap_or_default();
                json!({
                    "persona": handle.name,
                    "memories": stats.count,
                    "content_chars": stats.total_content_chars,
                })
            })
            .collect();
        json!({
            "dirty": self.activity.is_dirty(),
            "queue_depth": self.queue.depth(),
            "seconds_since_write": self.activity.seconds_since_write(),
            "seconds_since_rebuild": self.activity.seconds_since_rebuild(),
            "personas": personas,
        })
    }
}
