//! Unified Memory Tool
//!
//! One tool, dispatched on `operation`: create, read, update, delete,
//! search, stats, check_routines. Parameters mirror the engine's write and
//! search surfaces; replies are text by default and structured when the
//! caller negotiates `format=json`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Timelike;
use serde::Deserialize;
use serde_json::{json, Value};

use kioku_core::{
    timeutil, CreateMemoryInput, MemoryEngine, MemoryRecord, PrivacyLevel, SearchHit,
    SearchMode, SearchRequest, TagMatchMode, UpdateMemoryInput,
};

use super::{preview, ReplyFormat, ToolReply};

/// Input schema for the unified memory tool.
pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "operation": {
                "type": "string",
                "enum": ["create", "read", "update", "delete", "search", "stats", "check_routines",
                         "promise", "goal", "sensation", "emotion_flow", "block", "user_info",
                         "update_context"],
                "description": "Memory operation, or a context-state operation (promise/goal/sensation/emotion_flow/block/user_info/update_context)"
            },
            "query": {
                "type": "string",
                "description": "Memory key (read/update/delete) or search query"
            },
            "content": {
                "type": "string",
                "description": "Memory content (create/update)"
            },
            "top_k": {
                "type": "integer",
                "description": "Maximum results (default: 5)",
                "default": 5,
                "minimum": 1,
                "maximum": 50
            },
            "emotion_type": { "type": "string", "description": "Emotion label (e.g. joy, sadness)" },
            "emotion_intensity": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "context_tags": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Tags attached on create/update"
            },
            "importance": { "type": "number", "minimum": 0.0, "maximum": 1.0, "default": 0.5 },
            "physical_state": { "type": "string" },
            "mental_state": { "type": "string" },
            "environment": { "type": "string" },
            "relationship_status": { "type": "string" },
            "action_tag": { "type": "string", "description": "Action context (e.g. cooking, coding)" },
            "mode": {
                "type": "string",
                "enum": ["keyword", "semantic", "hybrid", "related", "smart"],
                "default": "hybrid",
                "description": "Search mode"
            },
            "fuzzy_match": { "type": "boolean", "default": false },
            "fuzzy_threshold": { "type": "integer", "default": 70, "minimum": 0, "maximum": 100 },
            "search_tags": { "type": "array", "items": { "type": "string" } },
            "tag_match_mode": { "type": "string", "enum": ["any", "all"], "default": "any" },
            "date_range": {
                "type": "string",
                "description": "Date filter: 今日/today, 昨日/yesterday, 3日前, YYYY-MM-DD, or YYYY-MM-DD..YYYY-MM-DD"
            },
            "min_importance": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "equipped_item": { "type": "string", "description": "Filter by equipped item name (partial match)" },
            "importance_weight": { "type": "number", "default": 0.0 },
            "recency_weight": { "type": "number", "default": 0.0 },
            "memory_key": { "type": "string", "description": "Exact key filter; seed for related mode" },
            "privacy_level": { "type": "string", "enum": ["public", "internal", "private", "secret"] },
            "defer_vector": { "type": "boolean", "default": false },
            "fatigue": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "warmth": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "arousal": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "heart_rate": { "type": "string", "description": "Heart-rate metaphor (e.g. calm, racing)" },
            "touch_response": { "type": "string" },
            "user_info": {
                "type": "object",
                "additionalProperties": { "type": "string" },
                "description": "User fields for the user_info operation (name / nickname / preferred_address)"
            },
            "format": { "type": "string", "enum": ["text", "json"], "default": "text" }
        },
        "required": ["operation"]
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct MemoryArgs {
    pub operation: String,
    pub query: Option<String>,
    pub content: Option<String>,
    pub top_k: Option<usize>,
    pub emotion_type: Option<String>,
    pub emotion_intensity: Option<f64>,
    pub context_tags: Option<Vec<String>>,
    pub importance: Option<f64>,
    pub physical_state: Option<String>,
    pub mental_state: Option<String>,
    pub environment: Option<String>,
    pub relationship_status: Option<String>,
    pub action_tag: Option<String>,
    pub mode: Option<String>,
    #[serde(default)]
    pub fuzzy_match: bool,
    pub fuzzy_threshold: Option<u32>,
    pub search_tags: Option<Vec<String>>,
    pub tag_match_mode: Option<String>,
    pub date_range: Option<String>,
    pub min_importance: Option<f64>,
    pub equipped_item: Option<String>,
    #[serde(default)]
    pub importance_weight: f64,
    #[serde(default)]
    pub recency_weight: f64,
    pub memory_key: Option<String>,
    pub privacy_level: Option<String>,
    #[serde(default)]
    pub defer_vector: bool,
    // Context-operation parameters (sensation / user_info)
    pub fatigue: Option<f64>,
    pub warmth: Option<f64>,
    pub arousal: Option<f64>,
    pub heart_rate: Option<String>,
    pub touch_response: Option<String>,
    pub user_info: Option<HashMap<String, String>>,
    pub format: Option<String>,
}

/// Execute the unified memory tool for one persona.
pub async fn execute(engine: &Arc<MemoryEngine>, persona: &str, args: Option<Value>) -> ToolReply {
    let args: MemoryArgs = match args {
        Some(value) => match serde_json::from_value(value) {
            Ok(args) => args,
            Err(e) => return ToolReply::client_error(format!("Invalid arguments: {}", e)),
        },
        None => return ToolReply::client_error("Missing arguments"),
    };

    // Every tool call refreshes the persona's conversation timestamp.
    if let Ok(handle) = engine.persona(persona) {
        handle.context.touch(engine.now());
    }

    let format = ReplyFormat::parse(args.format.as_deref());
    match args.operation.to_lowercase().as_str() {
        "create" => execute_create(engine, persona, args, format),
        "read" => execute_read(engine, persona, args, format),
        "update" => execute_update(engine, persona, args, format),
        "delete" => execute_delete(engine, persona, args, format),
        "search" => execute_search(engine, persona, args, format).await,
        "stats" => execute_stats(engine, persona, format),
        "check_routines" => execute_check_routines(engine, persona, args, format),
        op if super::context_ops::is_context_operation(op) => {
            let op = op.to_string();
            super::context_ops::execute(engine, persona, &op, args, format).await
        }
        other => ToolReply::client_error(format!(
            "Unknown operation '{}'. Valid memory ops: create, read, update, delete, search, \
             stats, check_routines. Context ops: promise, goal, sensation, emotion_flow, block, \
             user_info, update_context",
            other
        )),
    }
}

// ============================================================================
// CREATE / READ / UPDATE / DELETE
// ============================================================================

fn parse_privacy(level: Option<&str>) -> Result<Option<PrivacyLevel>, ToolReply> {
    match level {
        None => Ok(None),
        Some(name) => PrivacyLevel::parse(name).map(Some).ok_or_else(|| {
            ToolReply::client_error(format!(
                "Invalid privacy_level '{}'. Valid: public, internal, private, secret",
                name
            ))
        }),
    }
}

fn execute_create(
    engine: &Arc<MemoryEngine>,
    persona: &str,
    args: MemoryArgs,
    format: ReplyFormat,
) -> ToolReply {
    let Some(content) = args.content else {
        return ToolReply::client_error("'content' is required for create operation");
    };
    let privacy_level = match parse_privacy(args.privacy_level.as_deref()) {
        Ok(level) => level,
        Err(reply) => return reply,
    };

    let input = CreateMemoryInput {
        content,
        key: None,
        importance: args.importance,
        emotion: args.emotion_type,
        emotion_intensity: args.emotion_intensity,
        tags: args.context_tags.unwrap_or_default(),
        physical_state: args.physical_state,
        mental_state: args.mental_state,
        environment: args.environment,
        relationship_status: args.relationship_status,
        action_tag: args.action_tag,
        privacy_level,
        equipped_items: None,
        defer_vector: args.defer_vector,
    };

    match engine.create_memory(persona, input) {
        Ok(record) => match format {
            ReplyFormat::Json => ToolReply::Json(record_json(&record)),
            ReplyFormat::Text => {
                let mut text = format!("✅ Memory created: {}\n   {}", record.key, preview(&record.content, 200));
                if !record.tags.is_empty() {
                    text.push_str(&format!("\n   Tags: [{}]", record.tags.join(", ")));
                }
                if record.emotion != "neutral" {
                    text.push_str(&format!(
                        "\n   Emotion: {} ({:.1})",
                        record.emotion, record.emotion_intensity
                    ));
                }
                ToolReply::Text(text)
            }
        },
        Err(e) => e.into(),
    }
}

fn execute_read(
    engine: &Arc<MemoryEngine>,
    persona: &str,
    args: MemoryArgs,
    format: ReplyFormat,
) -> ToolReply {
    match args.query.as_deref() {
        Some(key) if key.starts_with("memory_") || key.starts_with("summary_") => {
            match engine.read_memory(persona, key) {
                Ok(Some(record)) => match format {
                    ReplyFormat::Json => ToolReply::Json(record_json(&record)),
                    ReplyFormat::Text => {
                        let mut text = format!("📖 Memory {}:\n   {}", record.key, record.content);
                        text.push_str(&format!(
                            "\n   (Created: {}, Tags: [{}])",
                            record.created_at.to_rfc3339(),
                            record.tags.join(", ")
                        ));
                        if !record.related_keys.is_empty() {
                            text.push_str(&format!(
                                "\n   🔗 Related: {}",
                                record.related_keys.join(", ")
                            ));
                        }
                        ToolReply::Text(text)
                    }
                },
                Ok(None) => ToolReply::client_error(format!("Memory {} not found", key)),
                Err(e) => e.into(),
            }
        }
        Some(_) => ToolReply::client_error(
            "For search queries use operation='search'. 'read' takes a memory key \
             (query='memory_...') or no query for recent memories",
        ),
        None => {
            let limit = args.top_k.unwrap_or(5).clamp(1, 50);
            match engine.recent_memories(persona, limit) {
                Ok(records) if records.is_empty() => {
                    ToolReply::Text("📭 No memories found.".to_string())
                }
                Ok(records) => match format {
                    ReplyFormat::Json => {
                        ToolReply::Json(json!(records.iter().map(record_json).collect::<Vec<_>>()))
                    }
                    ReplyFormat::Text => {
                        let mut text = format!("🕐 Recent {} Memories:\n", records.len());
                        for (i, record) in records.iter().enumerate() {
                            text.push_str(&format!(
                                "{}. [{}] {}\n",
                                i + 1,
                                record.key,
                                preview(&record.content, 100)
                            ));
                        }
                        ToolReply::Text(text.trim_end().to_string())
                    }
                },
                Err(e) => e.into(),
            }
        }
    }
}

fn execute_update(
    engine: &Arc<MemoryEngine>,
    persona: &str,
    args: MemoryArgs,
    format: ReplyFormat,
) -> ToolReply {
    let Some(key) = args.query else {
        return ToolReply::client_error("'query' (memory key) is required for update operation");
    };
    if args.content.is_none() && args.context_tags.is_none() && args.importance.is_none()
        && args.emotion_type.is_none() && args.emotion_intensity.is_none()
    {
        return ToolReply::client_error("Nothing to update: provide content or metadata fields");
    }
    let privacy_level = match parse_privacy(args.privacy_level.as_deref()) {
        Ok(level) => level,
        Err(reply) => return reply,
    };

    let input = UpdateMemoryInput {
        content: args.content,
        importance: args.importance,
        emotion: args.emotion_type,
        emotion_intensity: args.emotion_intensity,
        tags: args.context_tags,
        physical_state: args.physical_state,
        mental_state: args.mental_state,
        environment: args.environment,
        relationship_status: args.relationship_status,
        action_tag: args.action_tag,
        privacy_level,
    };

    match engine.update_memory(persona, &key, input) {
        Ok(record) => match format {
            ReplyFormat::Json => ToolReply::Json(record_json(&record)),
            ReplyFormat::Text => ToolReply::Text(format!(
                "✅ Memory updated: {}\n   {}",
                record.key,
                preview(&record.content, 200)
            )),
        },
        Err(e) => e.into(),
    }
}

fn execute_delete(
    engine: &Arc<MemoryEngine>,
    persona: &str,
    args: MemoryArgs,
    format: ReplyFormat,
) -> ToolReply {
    let Some(key) = args.query else {
        return ToolReply::client_error("'query' (memory key) is required for delete operation");
    };
    match engine.delete_memory(persona, &key) {
        Ok(existed) => match format {
            ReplyFormat::Json => ToolReply::Json(json!({ "key": key, "deleted": existed })),
            ReplyFormat::Text => {
                if existed {
                    ToolReply::Text(format!("🗑️ Memory deleted: {}", key))
                } else {
                    ToolReply::Text(format!("🗑️ Memory {} was already gone (no-op)", key))
                }
            }
        },
        Err(e) => e.into(),
    }
}

// ============================================================================
// SEARCH
// ============================================================================

async fn execute_search(
    engine: &Arc<MemoryEngine>,
    persona: &str,
    args: MemoryArgs,
    format: ReplyFormat,
) -> ToolReply {
    let mode = match args.mode.as_deref() {
        None => SearchMode::Hybrid,
        Some(name) => match SearchMode::parse(name) {
            Some(mode) => mode,
            None => {
                return ToolReply::client_error(format!(
                    "Invalid mode '{}'. Valid: keyword, semantic, hybrid, related, smart",
                    name
                ))
            }
        },
    };

    let request = SearchRequest {
        query: args.query.unwrap_or_default(),
        mode,
        top_k: args.top_k.unwrap_or(0),
        fuzzy_match: args.fuzzy_match,
        fuzzy_threshold: args.fuzzy_threshold.unwrap_or(70),
        tags: args.search_tags.unwrap_or_default(),
        tag_match_mode: TagMatchMode::parse(args.tag_match_mode.as_deref().unwrap_or("any")),
        date_range: args.date_range,
        min_importance: args.min_importance,
        emotion: args.emotion_type,
        action_tag: args.action_tag,
        environment: args.environment,
        physical_state: args.physical_state,
        mental_state: args.mental_state,
        relationship_status: args.relationship_status,
        equipped_item: args.equipped_item,
        importance_weight: args.importance_weight,
        recency_weight: args.recency_weight,
        memory_key: args.memory_key,
        include_secret: false,
    };

    match engine.search(persona, request).await {
        Ok(hits) => match format {
            ReplyFormat::Json => ToolReply::Json(json!(hits
                .iter()
                .map(|hit| {
                    let mut value = record_json(&hit.record);
                    value["distance"] = json!(hit.distance);
                    value["final_score"] = json!(hit.final_score);
                    if let Some(score) = hit.match_score {
                        value["match_score"] = json!(score);
                    }
                    value
                })
                .collect::<Vec<_>>())),
            ReplyFormat::Text => ToolReply::Text(render_hits(engine, persona, &hits)),
        },
        Err(e) => e.into(),
    }
}

fn render_hits(engine: &Arc<MemoryEngine>, persona: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No memories found (persona: {}).", persona);
    }
    let now = engine.now();
    let mut text = format!("Found {} memories (persona: {}):\n\n", hits.len(), persona);
    for (i, hit) in hits.iter().enumerate() {
        let record = &hit.record;
        let tags = if record.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", record.tags.join(", "))
        };
        let related = if record.related_keys.is_empty() {
            String::new()
        } else {
            format!(" 🔗{}関連", record.related_keys.len())
        };
        let score = match hit.match_score {
            Some(score) if score < 100 => format!(" (Match: {}%)", score),
            _ => String::new(),
        };
        text.push_str(&format!("{}. [{}]{}{}{}\n", i + 1, record.key, tags, related, score));
        text.push_str(&format!("   {}\n", preview(&record.content, 200)));
        text.push_str(&format!(
            "   {} ({}前)\n\n",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            timeutil::format_elapsed(record.created_at, now)
        ));
    }
    text.trim_end().to_string()
}

// ============================================================================
// STATS & ROUTINES
// ============================================================================

fn execute_stats(engine: &Arc<MemoryEngine>, persona: &str, format: ReplyFormat) -> ToolReply {
    match engine.memory_stats(persona) {
        Ok(stats) => match format {
            ReplyFormat::Json => ToolReply::Json(json!({
                "persona": persona,
                "count": stats.count,
                "total_content_chars": stats.total_content_chars,
            })),
            ReplyFormat::Text => ToolReply::Text(format!(
                "📊 Memory stats (persona: {}):\n   Memories: {}\n   Content: {} chars",
                persona, stats.count, stats.total_content_chars
            )),
        },
        Err(e) => e.into(),
    }
}

/// Occurrence count for a recurring pattern to count as a routine.
const ROUTINE_MIN_FREQUENCY: usize = 3;

/// How far back the routine scan looks.
const ROUTINE_WINDOW_DAYS: i64 = 30;

/// Grouping key for routine detection: action_tag, else the first tag,
/// else a 20-char content prefix, so untagged memories still surface.
fn routine_group_key(record: &MemoryRecord) -> String {
    record
        .action_tag
        .clone()
        .or_else(|| record.tags.first().cloned())
        .unwrap_or_else(|| record.content.chars().take(20).collect())
}

/// Display label for a routine group, same fallback chain as the key but
/// with a longer content preview.
fn routine_label(record: &MemoryRecord) -> String {
    record
        .action_tag
        .clone()
        .or_else(|| record.tags.first().cloned())
        .unwrap_or_else(|| preview(&record.content, 30))
}

/// Recurring-pattern report: memories from the last 30 days whose creation
/// hour falls within +-1 of the current hour, grouped by action/tag/content,
/// kept when they recur at least three times.
fn execute_check_routines(
    engine: &Arc<MemoryEngine>,
    persona: &str,
    args: MemoryArgs,
    format: ReplyFormat,
) -> ToolReply {
    let handle = match engine.persona(persona) {
        Ok(handle) => handle,
        Err(e) => return e.into(),
    };
    let snapshot = match handle.store.load_all() {
        Ok(snapshot) => snapshot,
        Err(e) => return ToolReply::server_error(e.to_string()),
    };

    let now = engine.now();
    let current_hour = now.hour() as i32;
    let current_weekday = now.format("%A").to_string();
    let top_k = args.top_k.unwrap_or(5).clamp(1, 50);
    let cutoff = now - chrono::Duration::days(ROUTINE_WINDOW_DAYS);

    // frequency, importance sum, latest occurrence per group
    let mut groups: HashMap<String, (usize, f64, &MemoryRecord)> = HashMap::new();
    for record in snapshot.values() {
        if record.created_at <= cutoff {
            continue;
        }
        let hour = record.created_at.hour() as i32;
        if hour < current_hour - 1 || hour > current_hour + 1 {
            continue;
        }
        groups
            .entry(routine_group_key(record))
            .and_modify(|(frequency, importance_sum, latest)| {
                *frequency += 1;
                *importance_sum += record.importance;
                if record.created_at > latest.created_at {
                    *latest = record;
                }
            })
            .or_insert((1, record.importance, record));
    }

    let mut routines: Vec<(usize, f64, &MemoryRecord)> = groups
        .into_values()
        .filter(|(frequency, _, _)| *frequency >= ROUTINE_MIN_FREQUENCY)
        .map(|(frequency, importance_sum, latest)| {
            (frequency, importance_sum / frequency as f64, latest)
        })
        .collect();
    routines.sort_by(|a, b| {
        b.0.cmp(&a.0).then_with(|| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    routines.truncate(top_k);

    match format {
        ReplyFormat::Json => ToolReply::Json(json!({
            "hour": current_hour,
            "weekday": current_weekday,
            "window_days": ROUTINE_WINDOW_DAYS,
            "routines": routines
                .iter()
                .map(|(frequency, avg_importance, latest)| json!({
                    "pattern": routine_label(latest),
                    "frequency": frequency,
                    "avg_importance": avg_importance,
                    "last_occurrence": latest.created_at.to_rfc3339(),
                    "latest_key": latest.key,
                    "latest_content": preview(&latest.content, 100),
                }))
                .collect::<Vec<_>>(),
        })),
        ReplyFormat::Text => {
            if routines.is_empty() {
                return ToolReply::Text(format!(
                    "💫 No recurring patterns around {}時台 on {} (past {} days).",
                    current_hour, current_weekday, ROUTINE_WINDOW_DAYS
                ));
            }
            let mut text = format!(
                "💫 いつものパターン (現在: {}時台, {}):\n",
                current_hour, current_weekday
            );
            for (i, (frequency, avg_importance, latest)) in routines.iter().enumerate() {
                text.push_str(&format!("{}. **{}**\n", i + 1, routine_label(latest)));
                text.push_str(&format!("   頻度: {}回 (過去{}日)\n", frequency, ROUTINE_WINDOW_DAYS));
                text.push_str(&format!(
                    "   最終: {}前\n",
                    timeutil::format_elapsed(latest.created_at, now)
                ));
                text.push_str(&format!("   重要度: {:.2}\n", avg_importance));
            }
            ToolReply::Text(text.trim_end().to_string())
        }
    }
}

// ============================================================================
// RENDERING
// ============================================================================

fn record_json(record: &MemoryRecord) -> Value {
    json!({
        "key": record.key,
        "content": record.content,
        "created_at": record.created_at.to_rfc3339(),
        "updated_at": record.updated_at.to_rfc3339(),
        "tags": record.tags,
        "importance": record.importance,
        "emotion": record.emotion,
        "emotion_intensity": record.emotion_intensity,
        "physical_state": record.physical_state,
        "mental_state": record.mental_state,
        "environment": record.environment,
        "relationship_status": record.relationship_status,
        "action_tag": record.action_tag,
        "related_keys": record.related_keys,
        "summary_ref": record.summary_ref,
        "equipped_items": record.equipped_items,
        "access_count": record.access_count,
        "last_accessed": record.last_accessed.map(|dt| dt.to_rfc3339()),
        "privacy_level": record.privacy_level.as_str(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
