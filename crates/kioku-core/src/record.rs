//! Memory Record Types
//!
//! Typed row structures for the durable store. The original column set is
//! closed: every field the `memories` table carries appears here, with the
//! JSON sub-fields (`tags`, `related_keys`, `equipped_items`) modeled as
//! native collections and serialized as compact JSON text at the SQL layer.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

// ============================================================================
// PRIVACY
// ============================================================================

/// Privacy level controlling visibility in search and context views.
///
/// Ordered: `public < internal < private < secret`. `secret` is never
/// returned by search unless the caller passes the admin flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    Public,
    Internal,
    Private,
    Secret,
}

impl PrivacyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyLevel::Public => "public",
            PrivacyLevel::Internal => "internal",
            PrivacyLevel::Private => "private",
            PrivacyLevel::Secret => "secret",
        }
    }

    /// Parse a level name; unknown strings return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(PrivacyLevel::Public),
            "internal" => Some(PrivacyLevel::Internal),
            "private" => Some(PrivacyLevel::Private),
            "secret" => Some(PrivacyLevel::Secret),
            _ => None,
        }
    }
}

impl Default for PrivacyLevel {
    fn default() -> Self {
        PrivacyLevel::Internal
    }
}

// ============================================================================
// MEMORY RECORD
// ============================================================================

/// A single memory row.
///
/// Keys have the shape `memory_YYYYMMDDHHMMSS[...]`; summary nodes
/// (meta-memories) use the `summary_` prefix and link their members through
/// `related_keys` while the members point back via `summary_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub key: String,
    pub content: String,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub importance: f64,
    pub emotion: String,
    pub emotion_intensity: f64,
    pub physical_state: String,
    pub mental_state: String,
    pub environment: String,
    pub relationship_status: String,
    #[serde(default)]
    pub action_tag: Option<String>,
    /// Lazy association edge list. Dangling keys are tolerated on read.
    #[serde(default)]
    pub related_keys: Vec<String>,
    /// Key of the summarizing meta-memory, if this row has been summarized.
    #[serde(default)]
    pub summary_ref: Option<String>,
    /// Equipment snapshot (slot -> item name) captured at creation time.
    #[serde(default)]
    pub equipped_items: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub access_count: i64,
    #[serde(default)]
    pub last_accessed: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub privacy_level: PrivacyLevel,
}

impl MemoryRecord {
    /// Construct a record with the documented column defaults.
    pub fn new(key: String, content: String, now: DateTime<FixedOffset>) -> Self {
        Self {
            key,
            content,
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            importance: 0.5,
            emotion: "neutral".to_string(),
            emotion_intensity: 0.0,
            physical_state: "normal".to_string(),
            mental_state: "calm".to_string(),
            environment: "unknown".to_string(),
            relationship_status: "normal".to_string(),
            action_tag: None,
            related_keys: Vec::new(),
            summary_ref: None,
            equipped_items: None,
            access_count: 0,
            last_accessed: None,
            privacy_level: PrivacyLevel::Internal,
        }
    }

    /// Whether this row is a summary node (meta-memory).
    pub fn is_summary(&self) -> bool {
        self.key.starts_with("summary_")
    }

    /// Clamp `importance` and `emotion_intensity` into [0, 1].
    pub fn clamp_ranges(&mut self) {
        self.importance = self.importance.clamp(0.0, 1.0);
        self.emotion_intensity = self.emotion_intensity.clamp(0.0, 1.0);
    }
}

/// Check a key against the canonical format:
/// `memory_` + 14 digits (+ optional suffix), or any `summary_` key.
pub fn is_valid_memory_key(key: &str) -> bool {
    if key.starts_with("summary_") {
        return key.len() > "summary_".len();
    }
    let Some(rest) = key.strip_prefix("memory_") else {
        return false;
    };
    let digits: Vec<char> = rest.chars().take(14).collect();
    if digits.len() != 14 || !digits.iter().all(|c| c.is_ascii_digit()) {
        return false;
    }
    match rest.as_bytes().get(14) {
        None => true,
        Some(b'_') => true,
        Some(_) => false,
    }
}

// ============================================================================
// OPERATION LOG
// ============================================================================

/// Append-only audit entry for every mutating call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpLogEntry {
    pub operation_id: String,
    pub operation: String,
    pub key: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl OpLogEntry {
    pub fn success(operation: &str, key: Option<&str>) -> Self {
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            key: key.map(str::to_string),
            before: None,
            after: None,
            success: true,
            error: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn failure(operation: &str, key: Option<&str>, error: &str) -> Self {
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            key: key.map(str::to_string),
            before: None,
            after: None,
            success: false,
            error: Some(error.to_string()),
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_images(
        mut self,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}

// ============================================================================
// STATE HISTORY
// ============================================================================

/// Snapshot row in `physical_sensations_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalSensations {
    pub fatigue: f64,
    pub warmth: f64,
    pub arousal: f64,
    pub touch_response: String,
    pub heart_rate_metaphor: String,
}

impl Default for PhysicalSensations {
    fn default() -> Self {
        Self {
            fatigue: 0.0,
            warmth: 0.5,
            arousal: 0.0,
            touch_response: "normal".to_string(),
            heart_rate_metaphor: "calm".to_string(),
        }
    }
}

/// Timestamped row read back from a history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensationSample {
    pub timestamp: String,
    #[serde(flatten)]
    pub sensations: PhysicalSensations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionSample {
    pub timestamp: String,
    pub emotion: String,
    pub emotion_intensity: f64,
}

// ============================================================================
// PROMISES & GOALS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// A promise made to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promise {
    pub id: i64,
    pub content: String,
    pub created_at: String,
    pub due_date: Option<String>,
    pub status: TaskStatus,
    pub completed_at: Option<String>,
    pub priority: i64,
    pub notes: Option<String>,
}

/// A longer-running goal with progress tracking.
/// Progress reaching 100 auto-transitions the goal to `completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: i64,
    pub content: String,
    pub created_at: String,
    pub target_date: Option<String>,
    pub status: TaskStatus,
    pub completed_at: Option<String>,
    pub progress: i64,
    pub notes: Option<String>,
}

// ============================================================================
// MEMORY BLOCKS
// ============================================================================

/// Named always-in-context slot, unique per (persona, name).
/// Surfaced directly by `get_context`, never through search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub name: String,
    pub content: String,
    pub description: Option<String>,
    pub updated_at: String,
}

// ============================================================================
// USER STATE (bitemporal)
// ============================================================================

/// One row of the bitemporal user-state log. The currently valid row for a
/// key is the one with `valid_until = NULL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStateEntry {
    pub key: String,
    pub value: String,
    pub valid_from: String,
    pub valid_until: Option<String>,
    pub is_current: bool,
}

/// User-state keys tracked bitemporally.
pub const USER_STATE_KEYS: &[&str] = &["name", "nickname", "preferred_address"];

// ============================================================================
// TESTS
// ============================================================================
