//! # Kioku Core
//!
//! Persona-scoped long-term memory engine for conversational agents:
//!
//! - **Durable store**: per-persona SQLite with additive schema evolution,
//!   operation log, state history streams, promises/goals, memory blocks,
//!   and a bitemporal user-state log
//! - **Vector index**: per-persona Qdrant collection with deterministic
//!   point ids and payload mirroring
//! - **Hybrid search**: keyword/fuzzy + semantic with cross-encoder
//!   reranking, metadata filters, and composite scoring
//! - **Write path**: synchronous durable writes, asynchronous vector
//!   upserts with a dirty-flag recovery contract, association generation
//! - **Background workers**: idle vector rebuild, cleanup suggestions,
//!   periodic self-summarization, importance decay
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kioku_core::{CreateMemoryInput, MemoryEngine};
//!
//! let engine = MemoryEngine::builder(data_dir).build()?;
//! let record = engine.create_memory("default", CreateMemoryInput {
//!     content: "Completed Phase 41".to_string(),
//!     importance: Some(0.8),
//!     ..Default::default()
//! })?;
//! ```
//!
//! ## Feature Flags
//!
//! - `embeddings` (default): local embedding generation and cross-encoder
//!   reranking via fastembed. Without it, keyword search still works and
//!   semantic modes fail fast.

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod context;
pub mod engine;
pub mod equipment;
pub mod forgetting;
pub mod persona;
pub mod privacy;
pub mod record;
pub mod search;
pub mod store;
pub mod timeutil;
pub mod vector;
pub mod workers;
pub mod write;

pub mod embed;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{Config, ConfigManager};
pub use context::{ContextDocument, PersonaContext};
pub use engine::{
    CleanupReport, CleanupSuggestion, EngineError, MemoryEngine, PersonaHandle, VectorFactory,
};
pub use equipment::{EquipmentStore, InventoryEntry, Item};
pub use record::{
    Goal, MemoryBlock, MemoryRecord, OpLogEntry, PhysicalSensations, PrivacyLevel, Promise,
    TaskStatus, UserStateEntry, USER_STATE_KEYS,
};
pub use search::{SearchHit, SearchMode, SearchRequest, TagMatchMode};
pub use store::{MemoryStats, MemoryStore, StoreError};
pub use vector::{QdrantVectorStore, VectorError, VectorFilter, VectorHit, VectorStore};
pub use workers::{summarize::SummaryWindow, WorkerHandles};
pub use write::{CreateMemoryInput, UpdateMemoryInput};

pub use embed::{cosine_similarity, EmbedError, Embedder, Reranker};

#[cfg(feature = "embeddings")]
pub use embed::FastembedEmbedder;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
