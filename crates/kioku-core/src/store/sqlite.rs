//! SQLite Storage Implementation
//!
//! One `MemoryStore` per persona. Uses separate reader/writer connections
//! for interior mutability: all methods take `&self`, making the store
//! `Send + Sync` so the engine can hold it in an `Arc` without an outer
//! mutex. A small TTL cache fronts the full-table snapshot used by the
//! rebuild and keyword-search paths; it is invalidated on every mutation.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Utc};
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};

use super::schema;
use super::{Result, StoreError};
use crate::record::{
    EmotionSample, Goal, MemoryBlock, MemoryRecord, OpLogEntry, PhysicalSensations,
    PrivacyLevel, Promise, SensationSample, TaskStatus, UserStateEntry,
};

/// TTL for the snapshot cache.
const SNAPSHOT_TTL: Duration = Duration::from_secs(300);

/// Bounded entries in the query cache.
const QUERY_CACHE_CAPACITY: usize = 16;

type Snapshot = Arc<HashMap<String, MemoryRecord>>;

/// Cheap store statistics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MemoryStats {
    pub count: u64,
    pub total_content_chars: u64,
}

/// Per-persona durable store.
pub struct MemoryStore {
    persona: String,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    snapshot_cache: Mutex<LruCache<&'static str, (Instant, Snapshot)>>,
}

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// Parse a stored timestamp, tolerating naive legacy values.
fn parse_ts(text: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt);
    }
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().fixed_offset())
}

fn json_list(text: Option<String>) -> Vec<String> {
    text.and_then(|t| serde_json::from_str(&t).ok())
        .unwrap_or_default()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    let tags: Option<String> = row.get(4)?;
    let related_keys: Option<String> = row.get(13)?;
    let equipped_items: Option<String> = row.get(15)?;
    let last_accessed: Option<String> = row.get(17)?;
    let privacy: Option<String> = row.get(18)?;

    let fallback = Utc::now().fixed_offset();
    Ok(MemoryRecord {
        key: row.get(0)?,
        content: row.get(1)?,
        created_at: parse_ts(&created_at).unwrap_or(fallback),
        updated_at: parse_ts(&updated_at).unwrap_or(fallback),
        tags: json_list(tags),
        importance: row.get::<_, Option<f64>>(5)?.unwrap_or(0.5),
        emotion: row
            .get::<_, Option<String>>(6)?
            .unwrap_or_else(|| "neutral".to_string()),
        emotion_intensity: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
        physical_state: row
            .get::<_, Option<String>>(8)?
            .unwrap_or_else(|| "normal".to_string()),
        mental_state: row
            .get::<_, Option<String>>(9)?
            .unwrap_or_else(|| "calm".to_string()),
        environment: row
            .get::<_, Option<String>>(10)?
            .unwrap_or_else(|| "unknown".to_string()),
        relationship_status: row
            .get::<_, Option<String>>(11)?
            .unwrap_or_else(|| "normal".to_string()),
        action_tag: row.get(12)?,
        related_keys: json_list(related_keys),
        summary_ref: row.get(14)?,
        equipped_items: equipped_items.and_then(|t| serde_json::from_str(&t).ok()),
        access_count: row.get::<_, Option<i64>>(16)?.unwrap_or(0),
        last_accessed: last_accessed.as_deref().and_then(parse_ts),
        privacy_level: privacy
            .as_deref()
            .and_then(PrivacyLevel::parse)
            .unwrap_or_default(),
    })
}

impl MemoryStore {
    /// Open (or create) the persona's database, reconciling the schema.
    pub fn open(path: &Path, persona: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(path)?;
        configure_connection(&writer)?;
        schema::reconcile(&writer)?;

        let reader = Connection::open(path)?;
        configure_connection(&reader)?;

        // SAFETY: capacity is a non-zero literal
        let cache = LruCache::new(NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("non-zero"));

        Ok(Self {
            persona: persona.to_string(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            snapshot_cache: Mutex::new(cache),
        })
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Init("Writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::Init("Reader lock poisoned".into()))
    }

    fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.snapshot_cache.lock() {
            cache.clear();
        }
    }

    // ========================================================================
    // MEMORY CRUD
    // ========================================================================

    /// Read every memory row into an in-memory snapshot (TTL-cached).
    pub fn load_all(&self) -> Result<Snapshot> {
        if let Ok(mut cache) = self.snapshot_cache.lock() {
            if let Some((at, snapshot)) = cache.get(&"snapshot") {
                if at.elapsed() < SNAPSHOT_TTL {
                    return Ok(Arc::clone(snapshot));
                }
            }
        }

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memories",
            schema::MEMORY_SELECT
        ))?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut snapshot = HashMap::new();
        for row in rows {
            let record = row?;
            snapshot.insert(record.key.clone(), record);
        }
        drop(stmt);
        drop(reader);

        let snapshot = Arc::new(snapshot);
        if let Ok(mut cache) = self.snapshot_cache.lock() {
            cache.put("snapshot", (Instant::now(), Arc::clone(&snapshot)));
        }
        Ok(snapshot)
    }

    /// Fetch one row by key.
    pub fn get(&self, key: &str) -> Result<Option<MemoryRecord>> {
        let reader = self.reader()?;
        let record = reader
            .query_row(
                &format!("SELECT {} FROM memories WHERE key = ?1", schema::MEMORY_SELECT),
                params![key],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert-or-replace a record. Importance and emotion intensity are
    /// clamped to [0, 1] and the list/map fields serialized as compact JSON.
    pub fn upsert(&self, record: &MemoryRecord) -> Result<()> {
        let mut record = record.clone();
        record.clamp_ranges();

        let tags_json = if record.tags.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string()))
        };
        let related_json =
            serde_json::to_string(&record.related_keys).unwrap_or_else(|_| "[]".to_string());
        let equipped_json = record
            .equipped_items
            .as_ref()
            .and_then(|items| serde_json::to_string(items).ok());

        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO memories (
                key, content, created_at, updated_at, tags, importance,
                emotion, emotion_intensity, physical_state, mental_state,
                environment, relationship_status, action_tag, related_keys,
                summary_ref, equipped_items, access_count, last_accessed,
                privacy_level
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                record.key,
                record.content,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
                tags_json,
                record.importance,
                record.emotion,
                record.emotion_intensity,
                record.physical_state,
                record.mental_state,
                record.environment,
                record.relationship_status,
                record.action_tag,
                related_json,
                record.summary_ref,
                equipped_json,
                record.access_count,
                record.last_accessed.map(|dt| dt.to_rfc3339()),
                record.privacy_level.as_str(),
            ],
        )?;
        drop(writer);
        self.invalidate_cache();
        Ok(())
    }

    /// Remove a row. Idempotent: returns whether a row was actually deleted.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let writer = self.writer()?;
        let affected = writer.execute("DELETE FROM memories WHERE key = ?1", params![key])?;
        drop(writer);
        self.invalidate_cache();
        Ok(affected > 0)
    }

    /// Keys ordered by created_at descending.
    pub fn recent_keys(&self, limit: usize) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT key FROM memories ORDER BY created_at DESC LIMIT ?1")?;
        let keys = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    pub fn count(&self) -> Result<u64> {
        let reader = self.reader()?;
        let count: i64 = reader.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn sum_content_chars(&self) -> Result<u64> {
        let reader = self.reader()?;
        let total: i64 = reader.query_row(
            "SELECT COALESCE(SUM(LENGTH(content)), 0) FROM memories",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        Ok(MemoryStats {
            count: self.count()?,
            total_content_chars: self.sum_content_chars()?,
        })
    }

    /// Bump access_count and last_accessed. Best-effort: must not fail the
    /// read that triggered it, so errors are logged and swallowed.
    pub fn increment_access(&self, key: &str, now: DateTime<FixedOffset>) -> bool {
        let result = (|| -> Result<bool> {
            let writer = self.writer()?;
            let affected = writer.execute(
                "UPDATE memories
                 SET access_count = access_count + 1, last_accessed = ?1
                 WHERE key = ?2",
                params![now.to_rfc3339(), key],
            )?;
            Ok(affected > 0)
        })();
        match result {
            Ok(updated) => {
                if updated {
                    self.invalidate_cache();
                }
                updated
            }
            Err(e) => {
                tracing::warn!("Failed to bump access count for {}: {}", key, e);
                false
            }
        }
    }

    /// Overwrite the association edge list of an existing row.
    pub fn set_related_keys(&self, key: &str, related: &[String]) -> Result<()> {
        let json = serde_json::to_string(related).unwrap_or_else(|_| "[]".to_string());
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET related_keys = ?1 WHERE key = ?2",
            params![json, key],
        )?;
        drop(writer);
        self.invalidate_cache();
        Ok(())
    }

    pub fn set_importance(&self, key: &str, importance: f64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET importance = ?1 WHERE key = ?2",
            params![importance.clamp(0.0, 1.0), key],
        )?;
        drop(writer);
        self.invalidate_cache();
        Ok(())
    }

    /// Point a set of member rows at their summary node.
    pub fn link_summary(&self, member_keys: &[String], summary_key: &str) -> Result<usize> {
        let writer = self.writer()?;
        let mut linked = 0;
        for key in member_keys {
            linked += writer.execute(
                "UPDATE memories SET summary_ref = ?1 WHERE key = ?2",
                params![summary_key, key],
            )?;
        }
        drop(writer);
        self.invalidate_cache();
        Ok(linked)
    }

    /// Memories in [start, end] with importance >= min, ordered by
    /// importance x emotion_intensity descending. Feeds the summarizer.
    pub fn memories_in_window(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        min_importance: f64,
    ) -> Result<Vec<MemoryRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memories
             WHERE created_at >= ?1 AND created_at <= ?2 AND importance >= ?3
             ORDER BY (importance * COALESCE(emotion_intensity, 0.5)) DESC",
            schema::MEMORY_SELECT
        ))?;
        let rows = stmt
            .query_map(
                params![start.to_rfc3339(), end.to_rfc3339(), min_importance],
                row_to_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // OPERATION LOG
    // ========================================================================

    /// Append to the audit log. Never fails the caller: errors are logged
    /// locally and swallowed.
    pub fn append_op_log(&self, entry: &OpLogEntry, now: DateTime<FixedOffset>) {
        let result = (|| -> Result<()> {
            let writer = self.writer()?;
            writer.execute(
                "INSERT INTO operations
                 (timestamp, operation_id, operation, key, before, after, success, error, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    now.to_rfc3339(),
                    entry.operation_id,
                    entry.operation,
                    entry.key,
                    entry.before.as_ref().map(|v| v.to_string()),
                    entry.after.as_ref().map(|v| v.to_string()),
                    entry.success as i64,
                    entry.error,
                    entry.metadata.to_string(),
                ],
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!("Failed to log operation {}: {}", entry.operation, e);
        }
    }

    pub fn op_log_count(&self) -> Result<u64> {
        let reader = self.reader()?;
        let count: i64 =
            reader.query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ========================================================================
    // STATE HISTORY
    // ========================================================================

    pub fn append_physical_sensations(
        &self,
        memory_key: Option<&str>,
        sensations: &PhysicalSensations,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO physical_sensations_history
             (timestamp, memory_key, fatigue, warmth, arousal, touch_response, heart_rate_metaphor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                now.to_rfc3339(),
                memory_key,
                sensations.fatigue.clamp(0.0, 1.0),
                sensations.warmth.clamp(0.0, 1.0),
                sensations.arousal.clamp(0.0, 1.0),
                sensations.touch_response,
                sensations.heart_rate_metaphor,
            ],
        )?;
        Ok(())
    }

    pub fn append_emotion(
        &self,
        memory_key: Option<&str>,
        emotion: &str,
        intensity: f64,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO emotion_history (timestamp, memory_key, emotion, emotion_intensity)
             VALUES (?1, ?2, ?3, ?4)",
            params![now.to_rfc3339(), memory_key, emotion, intensity.clamp(0.0, 1.0)],
        )?;
        Ok(())
    }

    pub fn latest_physical_sensations(&self) -> Result<Option<SensationSample>> {
        let reader = self.reader()?;
        let sample = reader
            .query_row(
                "SELECT timestamp, fatigue, warmth, arousal, touch_response, heart_rate_metaphor
                 FROM physical_sensations_history
                 ORDER BY timestamp DESC LIMIT 1",
                [],
                |row| {
                    Ok(SensationSample {
                        timestamp: row.get(0)?,
                        sensations: PhysicalSensations {
                            fatigue: row.get(1)?,
                            warmth: row.get(2)?,
                            arousal: row.get(3)?,
                            touch_response: row.get(4)?,
                            heart_rate_metaphor: row.get(5)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(sample)
    }

    pub fn emotion_timeline(
        &self,
        cutoff: DateTime<FixedOffset>,
    ) -> Result<Vec<EmotionSample>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT timestamp, emotion, emotion_intensity FROM emotion_history
             WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )?;
        let samples = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| {
                Ok(EmotionSample {
                    timestamp: row.get(0)?,
                    emotion: row.get(1)?,
                    emotion_intensity: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(samples)
    }

    pub fn sensation_timeline(
        &self,
        cutoff: DateTime<FixedOffset>,
    ) -> Result<Vec<SensationSample>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT timestamp, fatigue, warmth, arousal, touch_response, heart_rate_metaphor
             FROM physical_sensations_history
             WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )?;
        let samples = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| {
                Ok(SensationSample {
                    timestamp: row.get(0)?,
                    sensations: PhysicalSensations {
                        fatigue: row.get(1)?,
                        warmth: row.get(2)?,
                        arousal: row.get(3)?,
                        touch_response: row.get(4)?,
                        heart_rate_metaphor: row.get(5)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(samples)
    }

    /// Memories tagged anniversary / milestone / first_time, grouped by
    /// month-day for calendar display.
    pub fn anniversaries(&self) -> Result<Vec<(String, Vec<MemoryRecord>)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memories
             WHERE tags LIKE '%anniversary%' OR tags LIKE '%milestone%' OR tags LIKE '%first_time%'
             ORDER BY created_at DESC",
            schema::MEMORY_SELECT
        ))?;
        let rows = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(reader);

        let mut grouped: std::collections::BTreeMap<String, Vec<MemoryRecord>> =
            std::collections::BTreeMap::new();
        for record in rows {
            let month_day = record.created_at.format("%m-%d").to_string();
            grouped.entry(month_day).or_default().push(record);
        }
        Ok(grouped.into_iter().collect())
    }

    // ========================================================================
    // PROMISES & GOALS
    // ========================================================================

    pub fn add_promise(
        &self,
        content: &str,
        due_date: Option<&str>,
        priority: i64,
        notes: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<i64> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO promises (content, created_at, due_date, status, priority, notes)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5)",
            params![content, now.to_rfc3339(), due_date, priority, notes],
        )?;
        Ok(writer.last_insert_rowid())
    }

    pub fn set_promise_status(
        &self,
        id: i64,
        status: TaskStatus,
        now: DateTime<FixedOffset>,
    ) -> Result<bool> {
        let completed_at = matches!(status, TaskStatus::Completed).then(|| now.to_rfc3339());
        let writer = self.writer()?;
        let affected = writer.execute(
            "UPDATE promises SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![status.as_str(), completed_at, id],
        )?;
        Ok(affected > 0)
    }

    pub fn list_promises(&self, status: Option<TaskStatus>) -> Result<Vec<Promise>> {
        let reader = self.reader()?;
        let sql = "SELECT id, content, created_at, due_date, status, completed_at, priority, notes
                   FROM promises WHERE (?1 IS NULL OR status = ?1) ORDER BY priority DESC, created_at ASC";
        let mut stmt = reader.prepare(sql)?;
        let promises = stmt
            .query_map(params![status.map(|s| s.as_str())], |row| {
                Ok(Promise {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    created_at: row.get(2)?,
                    due_date: row.get(3)?,
                    status: TaskStatus::parse(&row.get::<_, String>(4)?)
                        .unwrap_or(TaskStatus::Active),
                    completed_at: row.get(5)?,
                    priority: row.get(6)?,
                    notes: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(promises)
    }

    pub fn add_goal(
        &self,
        content: &str,
        target_date: Option<&str>,
        notes: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<i64> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO goals (content, created_at, target_date, status, progress, notes)
             VALUES (?1, ?2, ?3, 'active', 0, ?4)",
            params![content, now.to_rfc3339(), target_date, notes],
        )?;
        Ok(writer.last_insert_rowid())
    }

    /// Set goal progress. Progress >= 100 auto-transitions the goal to
    /// `completed` and stamps `completed_at`.
    pub fn set_goal_progress(
        &self,
        id: i64,
        progress: i64,
        now: DateTime<FixedOffset>,
    ) -> Result<bool> {
        let progress = progress.clamp(0, 100);
        let writer = self.writer()?;
        let affected = if progress >= 100 {
            writer.execute(
                "UPDATE goals SET progress = ?1, status = 'completed', completed_at = ?2 WHERE id = ?3",
                params![progress, now.to_rfc3339(), id],
            )?
        } else {
            writer.execute(
                "UPDATE goals SET progress = ?1 WHERE id = ?2",
                params![progress, id],
            )?
        };
        Ok(affected > 0)
    }

    pub fn set_goal_status(
        &self,
        id: i64,
        status: TaskStatus,
        now: DateTime<FixedOffset>,
    ) -> Result<bool> {
        let completed_at = matches!(status, TaskStatus::Completed).then(|| now.to_rfc3339());
        let writer = self.writer()?;
        let affected = writer.execute(
            "UPDATE goals SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![status.as_str(), completed_at, id],
        )?;
        Ok(affected > 0)
    }

    pub fn list_goals(&self, status: Option<TaskStatus>) -> Result<Vec<Goal>> {
        let reader = self.reader()?;
        let sql = "SELECT id, content, created_at, target_date, status, completed_at, progress, notes
                   FROM goals WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at ASC";
        let mut stmt = reader.prepare(sql)?;
        let goals = stmt
            .query_map(params![status.map(|s| s.as_str())], |row| {
                Ok(Goal {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    created_at: row.get(2)?,
                    target_date: row.get(3)?,
                    status: TaskStatus::parse(&row.get::<_, String>(4)?)
                        .unwrap_or(TaskStatus::Active),
                    completed_at: row.get(5)?,
                    progress: row.get(6)?,
                    notes: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(goals)
    }

    // ========================================================================
    // MEMORY BLOCKS
    // ========================================================================

    /// Upsert a named always-in-context block, unique per (persona, name).
    pub fn write_block(
        &self,
        name: &str,
        content: &str,
        description: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(StoreError::Init("Block name cannot be empty".into()));
        }
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memory_blocks (persona, name, content, description, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(persona, name) DO UPDATE SET
                 content = excluded.content,
                 description = COALESCE(excluded.description, memory_blocks.description),
                 updated_at = excluded.updated_at",
            params![self.persona, name, content, description, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn read_block(&self, name: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        let content = reader
            .query_row(
                "SELECT content FROM memory_blocks WHERE persona = ?1 AND name = ?2",
                params![self.persona, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    pub fn list_blocks(&self) -> Result<Vec<MemoryBlock>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT name, content, description, updated_at FROM memory_blocks
             WHERE persona = ?1 ORDER BY name",
        )?;
        let blocks = stmt
            .query_map(params![self.persona], |row| {
                Ok(MemoryBlock {
                    name: row.get(0)?,
                    content: row.get(1)?,
                    description: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blocks)
    }

    pub fn delete_block(&self, name: &str) -> Result<bool> {
        let writer = self.writer()?;
        let affected = writer.execute(
            "DELETE FROM memory_blocks WHERE persona = ?1 AND name = ?2",
            params![self.persona, name],
        )?;
        Ok(affected > 0)
    }

    // ========================================================================
    // USER STATE (bitemporal)
    // ========================================================================

    /// Set a new value for a user-state key: the currently valid record gets
    /// `valid_until = now`, then a new row is inserted with
    /// `valid_from = now, valid_until = NULL`.
    pub fn update_user_state(
        &self,
        key: &str,
        value: &str,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        let ts = now.to_rfc3339();
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute(
            "UPDATE user_state_history SET valid_until = ?1
             WHERE persona = ?2 AND key = ?3 AND valid_until IS NULL",
            params![ts, self.persona, key],
        )?;
        tx.execute(
            "INSERT INTO user_state_history (persona, key, value, valid_from, valid_until, created_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?4)",
            params![self.persona, key, value, ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All currently valid user-state values as a flat map.
    pub fn current_user_state(&self) -> Result<HashMap<String, String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT key, value FROM user_state_history
             WHERE persona = ?1 AND valid_until IS NULL ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![self.persona], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }

    pub fn user_state_history(&self, key: Option<&str>) -> Result<Vec<UserStateEntry>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT key, value, valid_from, valid_until FROM user_state_history
             WHERE persona = ?1 AND (?2 IS NULL OR key = ?2)
             ORDER BY key, valid_from DESC",
        )?;
        let entries = stmt
            .query_map(params![self.persona, key], |row| {
                let valid_until: Option<String> = row.get(3)?;
                Ok(UserStateEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    valid_from: row.get(2)?,
                    is_current: valid_until.is_none(),
                    valid_until,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

// ============================================================================
// TESTS
// ============================================================================
