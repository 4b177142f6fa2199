//! Embeddings & Reranking
//!
//! One embedding model is loaded per process and shared across personas.
//! The cross-encoder reranker scores (query, document) pairs; when the model
//! is unavailable (minimal resource profile, or download failure) ranking
//! falls back to term-overlap scoring so search keeps working.

#[cfg(feature = "embeddings")]
use std::sync::{Mutex, OnceLock};

#[cfg(feature = "embeddings")]
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    /// Failed to initialize the embedding model
    #[error("Model initialization failed: {0}")]
    ModelInit(String),
    /// Failed to generate an embedding
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),
    /// Embeddings are disabled in this build/profile
    #[error("Embeddings unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, EmbedError>;

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Cosine similarity between two vectors (0.0 on dimension mismatch).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ============================================================================
// EMBEDDER SEAM
// ============================================================================

/// Produces query/document vectors. The concrete model is pluggable; the
/// engine only relies on `dimensions()` staying constant per process.
pub trait Embedder: Send + Sync {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
    fn embed_docs(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
}

// ============================================================================
// FASTEMBED BACKEND
// ============================================================================

#[cfg(feature = "embeddings")]
fn select_model(name: &str) -> (EmbeddingModel, usize) {
    // The model is pluggable per config; unrecognized names fall back to the
    // default. Dimensions must match what the vector collection was created
    // with, which ensure_ready re-checks.
    if name.contains("bge-small") {
        (EmbeddingModel::BGESmallENV15, 384)
    } else if name.contains("all-MiniLM") {
        (EmbeddingModel::AllMiniLML6V2, 384)
    } else {
        (EmbeddingModel::NomicEmbedTextV15, 768)
    }
}

#[cfg(feature = "embeddings")]
static EMBEDDING_MODEL: OnceLock<std::result::Result<Mutex<TextEmbedding>, String>> =
    OnceLock::new();

/// Local fastembed backend. The underlying ONNX model lives in a process
/// global so repeated engine construction (tests, reloads) never reloads it.
#[cfg(feature = "embeddings")]
pub struct FastembedEmbedder {
    dimensions: usize,
    model_name: String,
    cache_dir: std::path::PathBuf,
}

#[cfg(feature = "embeddings")]
impl FastembedEmbedder {
    pub fn new(model_name: &str, cache_dir: std::path::PathBuf) -> Self {
        let (_, dimensions) = select_model(model_name);
        Self {
            dimensions,
            model_name: model_name.to_string(),
            cache_dir,
        }
    }

    fn model(&self) -> Result<std::sync::MutexGuard<'static, TextEmbedding>> {
        let result = EMBEDDING_MODEL.get_or_init(|| {
            let (model, _) = select_model(&self.model_name);
            if let Err(e) = std::fs::create_dir_all(&self.cache_dir) {
                tracing::warn!("Failed to create model cache dir: {}", e);
            }
            let options = InitOptions::new(model)
                .with_show_download_progress(true)
                .with_cache_dir(self.cache_dir.clone());
            TextEmbedding::try_new(options)
                .map(Mutex::new)
                .map_err(|e| format!("Failed to initialize embedding model: {}", e))
        });
        match result {
            Ok(model) => model
                .lock()
                .map_err(|_| EmbedError::ModelInit("Model lock poisoned".into())),
            Err(e) => Err(EmbedError::ModelInit(e.clone())),
        }
    }
}

#[cfg(feature = "embeddings")]
impl Embedder for FastembedEmbedder {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_docs(&[text.to_string()])?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::EmbeddingFailed("Empty embedding batch".into()))
    }

    fn embed_docs(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model()?;
        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbedError::EmbeddingFailed(e.to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Backend that fails fast for builds/profiles without embeddings. Keyword
/// search keeps working; semantic modes surface the unavailability.
pub struct DisabledEmbedder;

impl Embedder for DisabledEmbedder {
    fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
        Err(EmbedError::Unavailable("embeddings feature disabled".into()))
    }

    fn embed_docs(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(EmbedError::Unavailable("embeddings feature disabled".into()))
    }

    fn dimensions(&self) -> usize {
        0
    }
}

// ============================================================================
// RERANKER
// ============================================================================

/// A reranked candidate: index into the input list plus relevance score.
#[derive(Debug, Clone, Copy)]
pub struct RerankHit {
    pub index: usize,
    pub score: f32,
}

/// Cross-encoder reranker with a term-overlap fallback.
pub struct Reranker {
    top_n: usize,
    #[cfg(feature = "embeddings")]
    cross_encoder: OnceLock<Option<Mutex<fastembed::TextRerank>>>,
    #[cfg(feature = "embeddings")]
    model_name: String,
    #[cfg(feature = "embeddings")]
    cache_dir: std::path::PathBuf,
}

impl Reranker {
    /// Create a reranker. An empty `model_name` disables the cross-encoder
    /// entirely (minimal profile) and only the fallback scoring is used.
    pub fn new(model_name: &str, top_n: usize, cache_dir: std::path::PathBuf) -> Self {
        let _ = &cache_dir;
        Self {
            top_n: top_n.max(1),
            #[cfg(feature = "embeddings")]
            cross_encoder: OnceLock::new(),
            #[cfg(feature = "embeddings")]
            model_name: model_name.to_string(),
            #[cfg(feature = "embeddings")]
            cache_dir,
        }
    }

    #[cfg(feature = "embeddings")]
    fn cross_encoder(&self) -> Option<&Mutex<fastembed::TextRerank>> {
        self.cross_encoder
            .get_or_init(|| {
                if self.model_name.is_empty() {
                    return None;
                }
                let options =
                    fastembed::RerankInitOptions::new(fastembed::RerankerModel::JINARerankerV1TurboEn)
                        .with_show_download_progress(true)
                        .with_cache_dir(self.cache_dir.clone());
                match fastembed::TextRerank::try_new(options) {
                    Ok(model) => {
                        tracing::info!("Cross-encoder reranker loaded");
                        Some(Mutex::new(model))
                    }
                    Err(e) => {
                        tracing::warn!("Cross-encoder unavailable, using term-overlap fallback: {}", e);
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Rerank documents against a query, best first, truncated to
    /// min(top_n, len).
    pub fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Vec<RerankHit> {
        let top_n = top_n.min(self.top_n).min(documents.len());
        if documents.is_empty() || top_n == 0 {
            return Vec::new();
        }

        #[cfg(feature = "embeddings")]
        if let Some(model) = self.cross_encoder() {
            if let Ok(model) = model.lock() {
                match model.rerank(query.to_string(), documents.to_vec(), false, None) {
                    Ok(results) => {
                        let mut hits: Vec<RerankHit> = results
                            .into_iter()
                            .map(|r| RerankHit {
                                index: r.index,
                                score: r.score,
                            })
                            .collect();
                        hits.sort_by(|a, b| {
                            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                        });
                        hits.truncate(top_n);
                        return hits;
                    }
                    Err(e) => {
                        tracing::warn!("Cross-encoder rerank failed, falling back: {}", e);
                    }
                }
            }
        }

        self.fallback_rerank(query, documents, top_n)
    }

    /// Term-overlap scoring: fraction of query terms appearing in the
    /// document, case-insensitive.
    fn fallback_rerank(&self, query: &str, documents: &[String], top_n: usize) -> Vec<RerankHit> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let mut hits: Vec<RerankHit> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let lower = doc.to_lowercase();
                let matched = terms.iter().filter(|t| lower.contains(*t)).count();
                let score = if terms.is_empty() {
                    0.0
                } else {
                    matched as f32 / terms.len() as f32
                };
                RerankHit { index, score }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_n);
        hits
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_disabled_embedder_fails_fast() {
        let embedder = DisabledEmbedder;
        assert!(embedder.embed_query("x").is_err());
        assert_eq!(embedder.dimensions(), 0);
    }

    #[test]
    fn test_fallback_rerank_orders_by_overlap() {
        let reranker = Reranker::new("", 10, std::env::temp_dir());
        let docs = vec![
            "completely unrelated".to_string(),
            "rust programming language".to_string(),
            "rust language".to_string(),
        ];
        let hits = reranker.rerank("rust programming", &docs, 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].index, 1);
        assert!(hits[0].score > hits[2].score);
    }

    #[test]
    fn test_rerank_truncates_to_top_n() {
        let reranker = Reranker::new("", 2, std::env::temp_dir());
        let docs: Vec<String> = (0..5).map(|i| format!("doc {}", i)).collect();
        let hits = reranker.rerank("doc", &docs, 10);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_rerank_empty_documents() {
        let reranker = Reranker::new("", 5, std::env::temp_dir());
        assert!(reranker.rerank("query", &[], 5).is_empty());
    }
}
