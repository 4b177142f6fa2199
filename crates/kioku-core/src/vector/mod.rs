//! Vector Index Adapter
//!
//! Wraps a per-persona collection in an external Qdrant service. The
//! collection (`<prefix><persona>`) is created lazily on first write with
//! the embedder's dimension and cosine distance. Point ids are a
//! deterministic 64-bit digest of the memory key, so upserts are naturally
//! idempotent and the same key always lands on the same point.
//!
//! All searches tolerate a missing or empty collection by returning an
//! empty list, never an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    Range, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::embed::{EmbedError, Embedder};

// ============================================================================
// ERRORS & TYPES
// ============================================================================

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("Vector service error: {0}")]
    Service(#[from] qdrant_client::QdrantError),
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbedError),
    #[error("Vector index error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, VectorError>;

/// One search result: payload mirror plus a distance where smaller is
/// better (`1 - cosine_similarity`), uniform with keyword-side comparisons.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub key: String,
    pub content: String,
    pub distance: f32,
    pub payload: Value,
}

/// Filter pushed into the vector service: equality on categorical fields,
/// range on importance, set-membership on tags. Compositions are
/// conjunctions; anything richer stays a post-filter in the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub emotion: Option<String>,
    pub action_tag: Option<String>,
    pub environment: Option<String>,
    pub min_importance: Option<f64>,
    /// Every listed tag must be present.
    pub tags_all: Vec<String>,
}

impl VectorFilter {
    pub fn is_empty(&self) -> bool {
        self.emotion.is_none()
            && self.action_tag.is_none()
            && self.environment.is_none()
            && self.min_importance.is_none()
            && self.tags_all.is_empty()
    }
}

/// Stable 64-bit point id derived from a memory key.
pub fn key_to_point_id(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}

// ============================================================================
// TRAIT SEAM
// ============================================================================

/// The engine's view of the vector service. Production is Qdrant; tests
/// inject an in-memory mock to drive failure paths without a network.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embed and upsert one point. Safe to call repeatedly for a key.
    async fn upsert(&self, key: &str, text: &str, payload: Value) -> Result<()>;

    /// Embed and upsert a batch (used by the rebuilder).
    async fn upsert_batch(&self, entries: Vec<(String, String, Value)>) -> Result<()>;

    /// Remove points by payload key.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Top-k by vector, optionally filtered.
    async fn search_by_vector(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>>;

    /// Convenience: embed the query then search.
    async fn search_by_text(
        &self,
        query: &str,
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>>;

    /// Exact point count (0 for a missing collection).
    async fn count(&self) -> Result<u64>;

    /// Drop and recreate the collection (rebuild path).
    async fn recreate(&self) -> Result<()>;
}

// ============================================================================
// QDRANT BACKEND
// ============================================================================

/// Per-persona Qdrant collection adapter.
pub struct QdrantVectorStore {
    client: Qdrant,
    collection: String,
    embedder: Arc<dyn Embedder>,
    collection_ready: AtomicBool,
}

impl QdrantVectorStore {
    pub fn connect(
        url: &str,
        api_key: Option<&str>,
        collection: String,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let mut builder = Qdrant::from_url(url);
        if let Some(key) = api_key {
            builder = builder.api_key(key);
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            collection,
            embedder,
            collection_ready: AtomicBool::new(false),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn ensure_collection(&self) -> Result<()> {
        if self.collection_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.client.collection_exists(&self.collection).await? {
            let dims = self.embedder.dimensions();
            if dims == 0 {
                return Err(VectorError::Other(
                    "Cannot create collection without an embedding dimension".into(),
                ));
            }
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection)
                        .vectors_config(VectorParamsBuilder::new(dims as u64, Distance::Cosine)),
                )
                .await?;
            tracing::info!("Created vector collection {}", self.collection);
        }
        self.collection_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn build_filter(filter: &VectorFilter) -> Filter {
        let mut conditions: Vec<Condition> = Vec::new();
        if let Some(emotion) = &filter.emotion {
            conditions.push(Condition::matches("emotion", emotion.clone()));
        }
        if let Some(action) = &filter.action_tag {
            conditions.push(Condition::matches("action_tag", action.clone()));
        }
        if let Some(environment) = &filter.environment {
            conditions.push(Condition::matches("environment", environment.clone()));
        }
        if let Some(min) = filter.min_importance {
            conditions.push(Condition::range(
                "importance",
                Range {
                    gte: Some(min),
                    ..Default::default()
                },
            ));
        }
        for tag in &filter.tags_all {
            conditions.push(Condition::matches("tags", tag.clone()));
        }
        Filter::must(conditions)
    }

    fn to_point(&self, key: &str, content: &str, payload: Value, vector: Vec<f32>) -> PointStruct {
        let mut map: HashMap<String, Value> = match payload {
            Value::Object(object) => object.into_iter().collect(),
            _ => HashMap::new(),
        };
        map.insert("key".to_string(), Value::String(key.to_string()));
        map.insert("content".to_string(), Value::String(content.to_string()));
        PointStruct::new(key_to_point_id(key), vector, map)
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, key: &str, text: &str, payload: Value) -> Result<()> {
        self.upsert_batch(vec![(key.to_string(), text.to_string(), payload)])
            .await
    }

    async fn upsert_batch(&self, entries: Vec<(String, String, Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_collection().await?;
        let texts: Vec<String> = entries.iter().map(|(_, text, _)| text.clone()).collect();
        let vectors = self.embedder.embed_docs(&texts)?;
        let points: Vec<PointStruct> = entries
            .into_iter()
            .zip(vectors)
            .map(|((key, text, payload), vector)| self.to_point(&key, &text, payload, vector))
            .collect();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points))
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() || !self.client.collection_exists(&self.collection).await? {
            return Ok(());
        }
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(Filter::must([Condition::matches(
                        "key",
                        keys.to_vec(),
                    )]))
                    .wait(true),
            )
            .await?;
        Ok(())
    }

    async fn search_by_vector(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>> {
        if !self.client.collection_exists(&self.collection).await? {
            return Ok(Vec::new());
        }
        let mut search = SearchPointsBuilder::new(&self.collection, vector, k as u64)
            .with_payload(true);
        if let Some(filter) = filter {
            if !filter.is_empty() {
                search = search.filter(Self::build_filter(filter));
            }
        }
        let response = self.client.search_points(search).await?;

        let mut hits = Vec::with_capacity(response.result.len());
        for point in response.result {
            let payload = serde_json::to_value(&point.payload)
                .map_err(|e| VectorError::Other(format!("Payload decode failed: {}", e)))?;
            let key = payload
                .get("key")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let content = payload
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            hits.push(VectorHit {
                key,
                content,
                // Similarity (higher better) -> distance (lower better)
                distance: 1.0 - point.score,
                payload,
            });
        }
        Ok(hits)
    }

    async fn search_by_text(
        &self,
        query: &str,
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>> {
        let vector = self.embedder.embed_query(query)?;
        self.search_by_vector(vector, k, filter).await
    }

    async fn count(&self) -> Result<u64> {
        if !self.client.collection_exists(&self.collection).await? {
            return Ok(0);
        }
        let info = self.client.collection_info(&self.collection).await?;
        Ok(info.result.and_then(|r| r.points_count).unwrap_or(0))
    }

    async fn recreate(&self) -> Result<()> {
        if self.client.collection_exists(&self.collection).await? {
            self.client.delete_collection(&self.collection).await?;
        }
        self.collection_ready.store(false, Ordering::Release);
        self.ensure_collection().await
    }
}

// ============================================================================
// TESTS
// ============================================================================
