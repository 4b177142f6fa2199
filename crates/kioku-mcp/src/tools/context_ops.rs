//! Context Write Operations
//!
//! The state-mutating side of the memory tool: promises, goals, physical
//! sensations, emotion flow, memory blocks, user info, and batched context
//! updates. These write to the durable store and the persona context
//! document; `get_context` is their read side.

use std::sync::Arc;

use serde_json::json;

use kioku_core::{MemoryEngine, PhysicalSensations, TaskStatus, USER_STATE_KEYS};

use super::memory::MemoryArgs;
use super::{ReplyFormat, ToolReply};

pub fn is_context_operation(operation: &str) -> bool {
    matches!(
        operation,
        "promise" | "goal" | "sensation" | "emotion_flow" | "block" | "user_info"
            | "update_context"
    )
}

pub async fn execute(
    engine: &Arc<MemoryEngine>,
    persona: &str,
    operation: &str,
    args: MemoryArgs,
    format: ReplyFormat,
) -> ToolReply {
    let handle = match engine.persona(persona) {
        Ok(handle) => handle,
        Err(e) => return e.into(),
    };
    let now = engine.now();

    match operation {
        // --------------------------------------------------------------
        // promise: content creates; query "complete:<id>" / "cancel:<id>"
        // transitions an existing one.
        // --------------------------------------------------------------
        "promise" => {
            if let Some(transition) = args.query.as_deref().and_then(parse_transition) {
                let (status, id) = transition;
                return match handle.store.set_promise_status(id, status, now) {
                    Ok(true) => ToolReply::Text(format!(
                        "🤝 Promise #{} marked {}",
                        id,
                        status.as_str()
                    )),
                    Ok(false) => ToolReply::client_error(format!("Promise #{} not found", id)),
                    Err(e) => ToolReply::server_error(e.to_string()),
                };
            }
            let Some(content) = args.content else {
                return ToolReply::client_error(
                    "'content' creates a promise; query='complete:<id>' or 'cancel:<id>' transitions one",
                );
            };
            match handle
                .store
                .add_promise(&content, args.date_range.as_deref(), 0, None, now)
            {
                Ok(id) => {
                    // The newest promise becomes the active one in context.
                    let _ = handle.context.update(|doc| {
                        doc.active_promise = Some(content.clone());
                    });
                    match format {
                        ReplyFormat::Json => ToolReply::Json(json!({ "id": id, "content": content })),
                        ReplyFormat::Text => {
                            ToolReply::Text(format!("🤝 Promise #{} recorded: {}", id, content))
                        }
                    }
                }
                Err(e) => ToolReply::server_error(e.to_string()),
            }
        }

        // --------------------------------------------------------------
        // goal: content creates; query "progress:<id>:<pct>" updates,
        // reaching 100 auto-completes; "cancel:<id>" cancels.
        // --------------------------------------------------------------
        "goal" => {
            if let Some(rest) = args.query.as_deref().and_then(|q| q.strip_prefix("progress:")) {
                let mut parts = rest.splitn(2, ':');
                let id = parts.next().and_then(|s| s.parse::<i64>().ok());
                let progress = parts.next().and_then(|s| s.parse::<i64>().ok());
                let (Some(id), Some(progress)) = (id, progress) else {
                    return ToolReply::client_error("Use query='progress:<id>:<percent>'");
                };
                return match handle.store.set_goal_progress(id, progress, now) {
                    Ok(true) => {
                        let note = if progress >= 100 { " - completed! 🎉" } else { "" };
                        ToolReply::Text(format!("🎯 Goal #{} progress: {}%{}", id, progress.clamp(0, 100), note))
                    }
                    Ok(false) => ToolReply::client_error(format!("Goal #{} not found", id)),
                    Err(e) => ToolReply::server_error(e.to_string()),
                };
            }
            if let Some((status, id)) = args.query.as_deref().and_then(parse_transition) {
                return match handle.store.set_goal_status(id, status, now) {
                    Ok(true) => ToolReply::Text(format!("🎯 Goal #{} marked {}", id, status.as_str())),
                    Ok(false) => ToolReply::client_error(format!("Goal #{} not found", id)),
                    Err(e) => ToolReply::server_error(e.to_string()),
                };
            }
            let Some(content) = args.content else {
                return ToolReply::client_error(
                    "'content' creates a goal; query='progress:<id>:<pct>' or 'cancel:<id>' updates one",
                );
            };
            match handle
                .store
                .add_goal(&content, args.date_range.as_deref(), None, now)
            {
                Ok(id) => {
                    let _ = handle.context.update(|doc| {
                        doc.current_goal = Some(content.clone());
                    });
                    match format {
                        ReplyFormat::Json => ToolReply::Json(json!({ "id": id, "content": content })),
                        ReplyFormat::Text => {
                            ToolReply::Text(format!("🎯 Goal #{} recorded: {}", id, content))
                        }
                    }
                }
                Err(e) => ToolReply::server_error(e.to_string()),
            }
        }

        // --------------------------------------------------------------
        // sensation: snapshot the physical-sensations state into history
        // and the context document.
        // --------------------------------------------------------------
        "sensation" => {
            let current = handle.context.load().physical_sensations;
            let sensations = PhysicalSensations {
                fatigue: args.fatigue.unwrap_or(current.fatigue),
                warmth: args.warmth.unwrap_or(current.warmth),
                arousal: args.arousal.unwrap_or(current.arousal),
                touch_response: args
                    .touch_response
                    .clone()
                    .unwrap_or(current.touch_response),
                heart_rate_metaphor: args
                    .heart_rate
                    .clone()
                    .unwrap_or(current.heart_rate_metaphor),
            };
            if let Err(e) = handle
                .store
                .append_physical_sensations(args.memory_key.as_deref(), &sensations, now)
            {
                return ToolReply::server_error(e.to_string());
            }
            let _ = handle.context.update(|doc| {
                doc.physical_sensations = sensations.clone();
            });
            match format {
                ReplyFormat::Json => ToolReply::Json(json!(sensations)),
                ReplyFormat::Text => ToolReply::Text(format!(
                    "💓 Sensations updated (fatigue: {:.1}, warmth: {:.1}, arousal: {:.1})",
                    sensations.fatigue, sensations.warmth, sensations.arousal
                )),
            }
        }

        // --------------------------------------------------------------
        // emotion_flow: append an emotion change to the history stream.
        // --------------------------------------------------------------
        "emotion_flow" => {
            let Some(emotion) = args.emotion_type else {
                return ToolReply::client_error("'emotion_type' is required for emotion_flow");
            };
            let intensity = args.emotion_intensity.unwrap_or(0.0);
            if let Err(e) =
                handle
                    .store
                    .append_emotion(args.memory_key.as_deref(), &emotion, intensity, now)
            {
                return ToolReply::server_error(e.to_string());
            }
            let _ = handle.context.update(|doc| {
                doc.current_emotion = emotion.clone();
                doc.current_emotion_intensity = Some(intensity.clamp(0.0, 1.0));
            });
            ToolReply::Text(format!("💭 Emotion recorded: {} ({:.1})", emotion, intensity))
        }

        // --------------------------------------------------------------
        // block: query names the block; content writes, absence reads.
        // --------------------------------------------------------------
        "block" => {
            let Some(name) = args.query else {
                return ToolReply::client_error("'query' (block name) is required for block");
            };
            match args.content {
                Some(content) => match handle.store.write_block(&name, &content, None, now) {
                    Ok(()) => ToolReply::Text(format!("🗂️ Block '{}' written", name)),
                    Err(e) => ToolReply::server_error(e.to_string()),
                },
                None => match handle.store.read_block(&name) {
                    Ok(Some(content)) => match format {
                        ReplyFormat::Json => {
                            ToolReply::Json(json!({ "name": name, "content": content }))
                        }
                        ReplyFormat::Text => {
                            ToolReply::Text(format!("🗂️ [{}]\n{}", name, content))
                        }
                    },
                    Ok(None) => ToolReply::client_error(format!("Block '{}' not found", name)),
                    Err(e) => ToolReply::server_error(e.to_string()),
                },
            }
        }

        // --------------------------------------------------------------
        // user_info: bitemporal update of user fields.
        // --------------------------------------------------------------
        "user_info" => {
            let Some(fields) = args.user_info else {
                return ToolReply::client_error(
                    "'user_info' (name / nickname / preferred_address) is required",
                );
            };
            let mut updated = Vec::new();
            for (key, value) in &fields {
                if !USER_STATE_KEYS.contains(&key.as_str()) {
                    continue;
                }
                match handle.store.update_user_state(key, value, now) {
                    Ok(()) => updated.push(key.clone()),
                    Err(e) => return ToolReply::server_error(e.to_string()),
                }
            }
            if updated.is_empty() {
                return ToolReply::client_error(format!(
                    "No valid user fields. Tracked: {}",
                    USER_STATE_KEYS.join(", ")
                ));
            }
            let _ = handle.context.update(|doc| {
                if let Some(name) = fields.get("name") {
                    doc.user_info.name = Some(name.clone());
                }
                if let Some(nickname) = fields.get("nickname") {
                    doc.user_info.nickname = Some(nickname.clone());
                }
                if let Some(address) = fields.get("preferred_address") {
                    doc.user_info.preferred_address = Some(address.clone());
                }
            });
            ToolReply::Text(format!("👤 Updated user fields: {}", updated.join(", ")))
        }

        // --------------------------------------------------------------
        // update_context: batch update of the context document fields.
        // --------------------------------------------------------------
        "update_context" => {
            let result = handle.context.update(|doc| {
                if let Some(emotion) = &args.emotion_type {
                    doc.current_emotion = emotion.clone();
                }
                if let Some(intensity) = args.emotion_intensity {
                    doc.current_emotion_intensity = Some(intensity.clamp(0.0, 1.0));
                }
                if let Some(state) = &args.physical_state {
                    doc.physical_state = state.clone();
                }
                if let Some(state) = &args.mental_state {
                    doc.mental_state = state.clone();
                }
                if let Some(environment) = &args.environment {
                    doc.environment = environment.clone();
                }
                if let Some(status) = &args.relationship_status {
                    doc.relationship_status = status.clone();
                }
                if let Some(action) = &args.action_tag {
                    doc.current_action_tag = Some(action.clone());
                }
            });
            match result {
                Ok(doc) => match format {
                    ReplyFormat::Json => ToolReply::Json(json!(doc)),
                    ReplyFormat::Text => ToolReply::Text(format!(
                        "🧠 Context updated (emotion: {}, physical: {}, mental: {}, environment: {})",
                        doc.current_emotion, doc.physical_state, doc.mental_state, doc.environment
                    )),
                },
                Err(e) => ToolReply::server_error(e.to_string()),
            }
        }

        other => ToolReply::client_error(format!("Unknown context operation '{}'", other)),
    }
}

/// Parse "complete:<id>" / "cancel:<id>" transitions.
fn parse_transition(query: &str) -> Option<(TaskStatus, i64)> {
    let (verb, id) = query.split_once(':')?;
    let id = id.trim().parse::<i64>().ok()?;
    match verb {
        "complete" => Some((TaskStatus::Completed, id)),
        "cancel" => Some((TaskStatus::Cancelled, id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testutil::test_engine;

    async fn run(
        engine: &Arc<MemoryEngine>,
        operation: &str,
        args: serde_json::Value,
    ) -> ToolReply {
        let args: MemoryArgs = serde_json::from_value(args).unwrap();
        execute(engine, "default", operation, args, ReplyFormat::Text).await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_promise_create_and_complete() {
        let (engine, _dir) = test_engine();
        let reply = run(
            &engine,
            "promise",
            json!({ "operation": "promise", "content": "weekend shopping" }),
        )
        .await;
        assert!(reply.render_text().contains("Promise #1"));

        let handle = engine.persona("default").unwrap();
        assert_eq!(
            handle.context.load().active_promise.as_deref(),
            Some("weekend shopping")
        );

        let reply = run(
            &engine,
            "promise",
            json!({ "operation": "promise", "query": "complete:1" }),
        )
        .await;
        assert!(reply.render_text().contains("completed"));
        assert!(handle
            .store
            .list_promises(Some(TaskStatus::Active))
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_goal_progress_to_completion() {
        let (engine, _dir) = test_engine();
        run(
            &engine,
            "goal",
            json!({ "operation": "goal", "content": "ship v1" }),
        )
        .await;
        let reply = run(
            &engine,
            "goal",
            json!({ "operation": "goal", "query": "progress:1:100" }),
        )
        .await;
        assert!(reply.render_text().contains("completed"));

        let handle = engine.persona("default").unwrap();
        let goals = handle.store.list_goals(None).unwrap();
        assert_eq!(goals[0].status, TaskStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sensation_appends_history_and_context() {
        let (engine, _dir) = test_engine();
        run(
            &engine,
            "sensation",
            json!({ "operation": "sensation", "fatigue": 0.8, "warmth": 0.6 }),
        )
        .await;

        let handle = engine.persona("default").unwrap();
        let latest = handle.store.latest_physical_sensations().unwrap().unwrap();
        assert_eq!(latest.sensations.fatigue, 0.8);
        assert_eq!(handle.context.load().physical_sensations.fatigue, 0.8);
        // Unspecified fields keep their previous values
        assert_eq!(latest.sensations.arousal, 0.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_emotion_flow_records_history() {
        let (engine, _dir) = test_engine();
        run(
            &engine,
            "emotion_flow",
            json!({ "operation": "emotion_flow", "emotion_type": "joy", "emotion_intensity": 0.9 }),
        )
        .await;

        let handle = engine.persona("default").unwrap();
        let cutoff = engine.now() - chrono::Duration::days(1);
        assert_eq!(handle.store.emotion_timeline(cutoff).unwrap().len(), 1);
        assert_eq!(handle.context.load().current_emotion, "joy");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_block_write_then_read() {
        let (engine, _dir) = test_engine();
        run(
            &engine,
            "block",
            json!({ "operation": "block", "query": "user_model", "content": "likes Rust" }),
        )
        .await;
        let reply = run(
            &engine,
            "block",
            json!({ "operation": "block", "query": "user_model" }),
        )
        .await;
        assert!(reply.render_text().contains("likes Rust"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_user_info_bitemporal_update() {
        let (engine, _dir) = test_engine();
        run(
            &engine,
            "user_info",
            json!({ "operation": "user_info", "user_info": { "name": "Rau", "hobby": "ignored" } }),
        )
        .await;

        let handle = engine.persona("default").unwrap();
        let current = handle.store.current_user_state().unwrap();
        assert_eq!(current.get("name").map(String::as_str), Some("Rau"));
        assert!(!current.contains_key("hobby"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_context_batch() {
        let (engine, _dir) = test_engine();
        run(
            &engine,
            "update_context",
            json!({
                "operation": "update_context",
                "emotion_type": "joy",
                "physical_state": "tired",
                "environment": "home"
            }),
        )
        .await;

        let handle = engine.persona("default").unwrap();
        let doc = handle.context.load();
        assert_eq!(doc.current_emotion, "joy");
        assert_eq!(doc.physical_state, "tired");
        assert_eq!(doc.environment, "home");
        // Untouched fields keep defaults
        assert_eq!(doc.mental_state, "calm");
    }
}
