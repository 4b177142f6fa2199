//! End-to-end test harness for the memory engine.
//!
//! Runs the full write path, search orchestrator and workers against an
//! in-memory vector backend and a deterministic embedder, so no network,
//! model download, or live Qdrant is required.

pub mod mocks;

use std::sync::Arc;

use kioku_core::{MemoryEngine, VectorStore};

use crate::mocks::{HashedEmbedder, MemoryVectorStore, SharedVectors};

/// Engine over a temp data dir with the shared in-memory vector backend.
/// The returned [`SharedVectors`] lets tests inspect and fail the backend.
pub fn test_engine() -> (Arc<MemoryEngine>, SharedVectors, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let vectors = SharedVectors::default();
    let factory_vectors = vectors.clone();
    let engine = MemoryEngine::builder(dir.path().to_path_buf())
        .with_embedder(Arc::new(HashedEmbedder))
        .with_vector_factory(Box::new(move |persona, _config, _embedder| {
            Ok(Arc::new(MemoryVectorStore::new(
                persona.to_string(),
                factory_vectors.clone(),
            )) as Arc<dyn VectorStore>)
        }))
        .build()
        .unwrap();
    (engine, vectors, dir)
}
