//! Schema Definition & Reconciliation
//!
//! The `memories` column set is closed and enumerated here; at open the
//! actual table is compared against it and absent columns are added in
//! place with their documented defaults. No destructive migrations.

use rusqlite::Connection;

use super::Result;

/// Expected `memories` columns after the base table, as (name, ADD COLUMN
/// clause). Order matters for the canonical SELECT list below.
pub const MEMORY_COLUMNS: &[(&str, &str)] = &[
    ("tags", "TEXT"),
    ("importance", "REAL DEFAULT 0.5"),
    ("emotion", "TEXT DEFAULT 'neutral'"),
    ("emotion_intensity", "REAL DEFAULT 0.0"),
    ("physical_state", "TEXT DEFAULT 'normal'"),
    ("mental_state", "TEXT DEFAULT 'calm'"),
    ("environment", "TEXT DEFAULT 'unknown'"),
    ("relationship_status", "TEXT DEFAULT 'normal'"),
    ("action_tag", "TEXT DEFAULT NULL"),
    ("related_keys", "TEXT DEFAULT '[]'"),
    ("summary_ref", "TEXT DEFAULT NULL"),
    ("equipped_items", "TEXT DEFAULT NULL"),
    ("access_count", "INTEGER DEFAULT 0"),
    ("last_accessed", "TEXT DEFAULT NULL"),
    ("privacy_level", "TEXT DEFAULT 'internal'"),
];

/// Canonical SELECT column list for memory rows.
pub const MEMORY_SELECT: &str = "key, content, created_at, updated_at, tags, importance, \
     emotion, emotion_intensity, physical_state, mental_state, environment, \
     relationship_status, action_tag, related_keys, summary_ref, equipped_items, \
     access_count, last_accessed, privacy_level";

const BASE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    key TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    tags TEXT,
    importance REAL DEFAULT 0.5,
    emotion TEXT DEFAULT 'neutral',
    emotion_intensity REAL DEFAULT 0.0,
    physical_state TEXT DEFAULT 'normal',
    mental_state TEXT DEFAULT 'calm',
    environment TEXT DEFAULT 'unknown',
    relationship_status TEXT DEFAULT 'normal',
    action_tag TEXT DEFAULT NULL,
    related_keys TEXT DEFAULT '[]',
    summary_ref TEXT DEFAULT NULL,
    equipped_items TEXT DEFAULT NULL,
    access_count INTEGER DEFAULT 0,
    last_accessed TEXT DEFAULT NULL,
    privacy_level TEXT DEFAULT 'internal'
);

CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);
CREATE INDEX IF NOT EXISTS idx_memories_summary_ref ON memories(summary_ref);

CREATE TABLE IF NOT EXISTS operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    operation_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    key TEXT,
    before TEXT,
    after TEXT,
    success INTEGER NOT NULL,
    error TEXT,
    metadata TEXT
);

CREATE TABLE IF NOT EXISTS physical_sensations_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    memory_key TEXT,
    fatigue REAL DEFAULT 0.0,
    warmth REAL DEFAULT 0.5,
    arousal REAL DEFAULT 0.0,
    touch_response TEXT DEFAULT 'normal',
    heart_rate_metaphor TEXT DEFAULT 'calm',
    FOREIGN KEY (memory_key) REFERENCES memories(key) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS emotion_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    memory_key TEXT,
    emotion TEXT NOT NULL,
    emotion_intensity REAL DEFAULT 0.0,
    FOREIGN KEY (memory_key) REFERENCES memories(key) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS promises (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    due_date TEXT,
    status TEXT DEFAULT 'active',
    completed_at TEXT,
    priority INTEGER DEFAULT 0,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS goals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    target_date TEXT,
    status TEXT DEFAULT 'active',
    completed_at TEXT,
    progress INTEGER DEFAULT 0,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS memory_blocks (
    persona TEXT NOT NULL,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    description TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (persona, name)
);

CREATE TABLE IF NOT EXISTS user_state_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    persona TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    valid_from TEXT NOT NULL,
    valid_until TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_state_current
    ON user_state_history(persona, key, valid_until);
"#;

/// Create missing tables and add any absent `memories` columns in place.
/// Idempotent; safe to re-run on every open.
pub fn reconcile(conn: &Connection) -> Result<()> {
    conn.execute_batch(BASE_TABLES)?;

    let mut stmt = conn.prepare("PRAGMA table_info(memories)")?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();
    drop(stmt);

    for (name, ddl) in MEMORY_COLUMNS {
        if !existing.iter().any(|c| c == name) {
            tracing::info!("Migrating database: adding {} column", name);
            conn.execute(
                &format!("ALTER TABLE memories ADD COLUMN {} {}", name, ddl),
                [],
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        reconcile(&conn).unwrap();
        // All expected columns exist
        let mut stmt = conn.prepare("PRAGMA table_info(memories)").unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        for (name, _) in MEMORY_COLUMNS {
            assert!(columns.iter().any(|c| c == name), "missing column {}", name);
        }
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        reconcile(&conn).unwrap();
        reconcile(&conn).unwrap();
    }

    #[test]
    fn test_reconcile_adds_columns_to_legacy_table() {
        let conn = Connection::open_in_memory().unwrap();
        // Legacy shape: only the original four columns
        conn.execute_batch(
            "CREATE TABLE memories (
                key TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            INSERT INTO memories VALUES
                ('memory_20250101000000', 'old row', '2025-01-01T00:00:00+09:00', '2025-01-01T00:00:00+09:00');",
        )
        .unwrap();

        reconcile(&conn).unwrap();

        // No data loss and the added columns carry their defaults
        let (content, importance, emotion, privacy): (String, f64, String, String) = conn
            .query_row(
                "SELECT content, importance, emotion, privacy_level FROM memories",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();
        assert_eq!(content, "old row");
        assert_eq!(importance, 0.5);
        assert_eq!(emotion, "neutral");
        assert_eq!(privacy, "internal");
    }
}
