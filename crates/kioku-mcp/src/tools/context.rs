//! Context Tool
//!
//! `get_context` returns the composite context document for a persona:
//! the context snapshot, current (bitemporal) user state, memory blocks,
//! active promises/goals, recent memories, anniversaries, and the latest
//! physical sensations. Blocks are always-in-context - they surface here,
//! never through search.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use kioku_core::{MemoryEngine, TaskStatus};

use super::{preview, ReplyFormat, ToolReply};

/// Input schema for get_context (no selector; optionally format).
pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "format": { "type": "string", "enum": ["text", "json"], "default": "text" }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct ContextArgs {
    format: Option<String>,
}

pub async fn execute(engine: &Arc<MemoryEngine>, persona: &str, args: Option<Value>) -> ToolReply {
    let args: ContextArgs = match args {
        Some(value) => serde_json::from_value(value).unwrap_or_default(),
        None => ContextArgs::default(),
    };
    let format = ReplyFormat::parse(args.format.as_deref());

    let handle = match engine.persona(persona) {
        Ok(handle) => handle,
        Err(e) => return e.into(),
    };
    let now = engine.now();
    handle.context.touch(now);
    let config = engine.config();

    let document = handle.context.load();
    let user_state = handle.store.current_user_state().unwrap_or_default();
    let blocks = handle.store.list_blocks().unwrap_or_default();
    let promises = handle
        .store
        .list_promises(Some(TaskStatus::Active))
        .unwrap_or_default();
    let goals = handle
        .store
        .list_goals(Some(TaskStatus::Active))
        .unwrap_or_default();
    let recent = engine
        .recent_memories(persona, config.recent_memories_count)
        .unwrap_or_default();
    let anniversaries = handle.store.anniversaries().unwrap_or_default();
    let sensations = handle.store.latest_physical_sensations().unwrap_or(None);

    if format == ReplyFormat::Json {
        return ToolReply::Json(json!({
            "persona": persona,
            "context": document,
            "user_state": user_state,
            "memory_blocks": blocks,
            "active_promises": promises,
            "active_goals": goals,
            "recent_memories": recent
                .iter()
                .map(|r| json!({
                    "key": r.key,
                    "content": preview(&r.content, 120),
                    "created_at": r.created_at.to_rfc3339(),
                }))
                .collect::<Vec<_>>(),
            "anniversaries": anniversaries
                .iter()
                .map(|(month_day, memories)| json!({
                    "month_day": month_day,
                    "count": memories.len(),
                }))
                .collect::<Vec<_>>(),
            "physical_sensations": sensations,
        }));
    }

    let mut text = format!("🧠 Context (persona: {})\n", persona);
    text.push_str(&format!(
        "Emotion: {} | Physical: {} | Mental: {} | Environment: {}\n",
        document.current_emotion,
        document.physical_state,
        document.mental_state,
        document.environment
    ));
    if let Some(last) = &document.last_conversation_time {
        text.push_str(&format!("Last conversation: {}\n", last));
    }

    if !user_state.is_empty() {
        text.push_str("\n👤 User:\n");
        for (key, value) in &user_state {
            text.push_str(&format!("   {}: {}\n", key, value));
        }
    }

    if !blocks.is_empty() {
        text.push_str("\n🗂️ Memory blocks:\n");
        for block in &blocks {
            text.push_str(&format!("   [{}] {}\n", block.name, preview(&block.content, 120)));
        }
    }

    if !promises.is_empty() {
        text.push_str("\n🤝 Active promises:\n");
        for promise in &promises {
            let due = promise
                .due_date
                .as_deref()
                .map(|d| format!(" (due: {})", d))
                .unwrap_or_default();
            text.push_str(&format!("   - {}{}\n", promise.content, due));
        }
    }

    if !goals.is_empty() {
        text.push_str("\n🎯 Active goals:\n");
        for goal in &goals {
            text.push_str(&format!("   - {} ({}%)\n", goal.content, goal.progress));
        }
    }

    if !recent.is_empty() {
        text.push_str("\n🕐 Recent memories:\n");
        for record in &recent {
            text.push_str(&format!(
                "   [{}] {}\n",
                record.key,
                preview(&record.content, 80)
            ));
        }
    }

    if !anniversaries.is_empty() {
        text.push_str("\n🎉 Anniversaries:\n");
        for (month_day, memories) in &anniversaries {
            text.push_str(&format!("   {}: {}件\n", month_day, memories.len()));
        }
    }

    ToolReply::Text(text.trim_end().to_string())
}
