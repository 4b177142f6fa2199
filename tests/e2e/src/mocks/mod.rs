//! Mock backends: a deterministic bag-of-words embedder and an in-memory
//! vector store with injectable failures for dirty-flag recovery tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kioku_core::{
    cosine_similarity, Embedder, VectorError, VectorFilter, VectorHit, VectorStore,
};
use serde_json::Value;

// ============================================================================
// EMBEDDER
// ============================================================================

/// Deterministic 64-dim bag-of-words embedder: identical text embeds
/// identically, overlapping text lands nearby.
pub struct HashedEmbedder;

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; 64];
    for token in text.to_lowercase().split_whitespace() {
        let mut h: u64 = 1469598103934665603;
        for b in token.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(1099511628211);
        }
        vector[(h % 64) as usize] += 1.0;
    }
    vector
}

impl Embedder for HashedEmbedder {
    fn embed_query(&self, text: &str) -> kioku_core::embed::Result<Vec<f32>> {
        Ok(hash_embed(text))
    }

    fn embed_docs(&self, texts: &[String]) -> kioku_core::embed::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }

    fn dimensions(&self) -> usize {
        64
    }
}

// ============================================================================
// VECTOR BACKEND
// ============================================================================

type Collections = HashMap<String, HashMap<String, (Vec<f32>, String, Value)>>;

/// Shared state across every persona's mock collection, with a global
/// failure switch for injecting C3 outages.
#[derive(Clone, Default)]
pub struct SharedVectors {
    collections: Arc<Mutex<Collections>>,
    fail: Arc<AtomicBool>,
}

impl SharedVectors {
    /// Make every subsequent vector operation fail (network outage).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Point count in one persona's collection.
    pub fn count(&self, persona: &str) -> usize {
        self.collections
            .lock()
            .unwrap()
            .get(persona)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Stored text for a key in a persona's collection.
    pub fn content(&self, persona: &str, key: &str) -> Option<String> {
        self.collections
            .lock()
            .unwrap()
            .get(persona)
            .and_then(|c| c.get(key))
            .map(|(_, text, _)| text.clone())
    }

    pub fn keys(&self, persona: &str) -> Vec<String> {
        self.collections
            .lock()
            .unwrap()
            .get(persona)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Per-persona view over the shared collections.
pub struct MemoryVectorStore {
    persona: String,
    shared: SharedVectors,
}

impl MemoryVectorStore {
    pub fn new(persona: String, shared: SharedVectors) -> Self {
        Self { persona, shared }
    }

    fn check_failure(&self) -> Result<(), VectorError> {
        if self.shared.fail.load(Ordering::SeqCst) {
            Err(VectorError::Other("injected vector outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, key: &str, text: &str, payload: Value) -> Result<(), VectorError> {
        self.check_failure()?;
        self.shared
            .collections
            .lock()
            .unwrap()
            .entry(self.persona.clone())
            .or_default()
            .insert(key.to_string(), (hash_embed(text), text.to_string(), payload));
        Ok(())
    }

    async fn upsert_batch(&self, entries: Vec<(String, String, Value)>) -> Result<(), VectorError> {
        for (key, text, payload) in entries {
            self.upsert(&key, &text, payload).await?;
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), VectorError> {
        self.check_failure()?;
        let mut collections = self.shared.collections.lock().unwrap();
        if let Some(collection) = collections.get_mut(&self.persona) {
            for key in keys {
                collection.remove(key);
            }
        }
        Ok(())
    }

    async fn search_by_vector(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>, VectorError> {
        self.check_failure()?;
        let collections = self.shared.collections.lock().unwrap();
        let Some(collection) = collections.get(&self.persona) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<VectorHit> = collection
            .iter()
            .filter(|(_, (_, _, payload))| matches_filter(payload, filter))
            .map(|(key, (v, text, payload))| VectorHit {
                key: key.clone(),
                content: text.clone(),
                distance: 1.0 - cosine_similarity(&vector, v),
                payload: payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn search_by_text(
        &self,
        query: &str,
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>, VectorError> {
        self.search_by_vector(hash_embed(query), k, filter).await
    }

    async fn count(&self) -> Result<u64, VectorError> {
        self.check_failure()?;
        Ok(self.shared.count(&self.persona) as u64)
    }

    async fn recreate(&self) -> Result<(), VectorError> {
        self.check_failure()?;
        self.shared
            .collections
            .lock()
            .unwrap()
            .insert(self.persona.clone(), HashMap::new());
        Ok(())
    }
}

fn matches_filter(payload: &Value, filter: Option<&VectorFilter>) -> bool {
    let Some(filter) = filter else { return true };
    if let Some(emotion) = &filter.emotion {
        if payload.get("emotion").and_then(Value::as_str) != Some(emotion.as_str()) {
            return false;
        }
    }
    if let Some(action) = &filter.action_tag {
        if payload.get("action_tag").and_then(Value::as_str) != Some(action.as_str()) {
            return false;
        }
    }
    if let Some(environment) = &filter.environment {
        if payload.get("environment").and_then(Value::as_str) != Some(environment.as_str()) {
            return false;
        }
    }
    if let Some(min) = filter.min_importance {
        if payload
            .get("importance")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            < min
        {
            return false;
        }
    }
    for tag in &filter.tags_all {
        let has_tag = payload
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().any(|t| t.as_str() == Some(tag.as_str())))
            .unwrap_or(false);
        if !has_tag {
            return false;
        }
    }
    true
}
