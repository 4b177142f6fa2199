//! Durable Store
//!
//! Per-persona embedded SQLite storage: the `memories` table plus the
//! operation log, state history streams, promises/goals, memory blocks and
//! the bitemporal user-state log. Schema evolution is additive only.

mod schema;
mod sqlite;

pub use sqlite::{MemoryStats, MemoryStore};

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StoreError>;
