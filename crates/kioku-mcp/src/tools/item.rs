//! Unified Item Tool
//!
//! Inventory and equipment management over the per-persona equipment store.
//! Physical items only - body states and memories belong to the memory
//! tool. Equip snapshots are what memory creation captures into
//! `equipped_items`, so the `memories` operation can search back by item.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use kioku_core::{MemoryEngine, SearchMode, SearchRequest, StoreError};

use super::{preview, ReplyFormat, ToolReply};

/// Input schema for the unified item tool.
pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "operation": {
                "type": "string",
                "enum": ["add", "remove", "equip", "unequip", "update", "rename",
                         "search", "history", "memories", "stats"],
                "description": "Operation to perform"
            },
            "item_name": { "type": "string", "description": "Item name (most operations)" },
            "description": { "type": "string" },
            "quantity": { "type": "integer", "default": 1, "minimum": 1 },
            "category": { "type": "string", "description": "e.g. clothing, accessory, weapon, consumable" },
            "tags": { "type": "array", "items": { "type": "string" } },
            "new_name": { "type": "string", "description": "New name (rename)" },
            "equipment": {
                "type": "object",
                "additionalProperties": { "type": "string" },
                "description": "Slot -> item name mapping (equip). Other slots keep their content."
            },
            "slots": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Slots to clear (unequip)"
            },
            "auto_add": { "type": "boolean", "default": true },
            "query": { "type": "string", "description": "Search term (search)" },
            "history_slot": { "type": "string", "description": "Slot filter (history)" },
            "days": { "type": "integer", "default": 7, "minimum": 1 },
            "top_k": { "type": "integer", "default": 10, "minimum": 1, "maximum": 50 },
            "format": { "type": "string", "enum": ["text", "json"], "default": "text" }
        },
        "required": ["operation"]
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ItemArgs {
    pub operation: String,
    pub item_name: Option<String>,
    pub description: Option<String>,
    pub quantity: Option<i64>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub new_name: Option<String>,
    pub equipment: Option<BTreeMap<String, String>>,
    pub slots: Option<Vec<String>>,
    pub auto_add: Option<bool>,
    pub query: Option<String>,
    pub history_slot: Option<String>,
    pub days: Option<i64>,
    pub top_k: Option<usize>,
    pub format: Option<String>,
}

fn store_error(e: StoreError) -> ToolReply {
    match e {
        StoreError::NotFound(name) => ToolReply::client_error(format!("Item not found: {}", name)),
        other => ToolReply::server_error(other.to_string()),
    }
}

fn require_item_name(args: &ItemArgs) -> Result<String, ToolReply> {
    args.item_name
        .clone()
        .ok_or_else(|| ToolReply::client_error("'item_name' is required for this operation"))
}

/// Execute the unified item tool for one persona.
pub async fn execute(engine: &Arc<MemoryEngine>, persona: &str, args: Option<Value>) -> ToolReply {
    let args: ItemArgs = match args {
        Some(value) => match serde_json::from_value(value) {
            Ok(args) => args,
            Err(e) => return ToolReply::client_error(format!("Invalid arguments: {}", e)),
        },
        None => return ToolReply::client_error("Missing arguments"),
    };

    let handle = match engine.persona(persona) {
        Ok(handle) => handle,
        Err(e) => return e.into(),
    };
    handle.context.touch(engine.now());

    let format = ReplyFormat::parse(args.format.as_deref());
    let now = engine.now();
    let equipment = &handle.equipment;

    match args.operation.to_lowercase().as_str() {
        "add" => {
            let name = match require_item_name(&args) {
                Ok(name) => name,
                Err(reply) => return reply,
            };
            let tags = args.tags.clone().unwrap_or_default();
            match equipment.add_item(
                &name,
                args.description.as_deref(),
                args.category.as_deref(),
                &tags,
                args.quantity.unwrap_or(1),
                now,
            ) {
                Ok(item) => match format {
                    ReplyFormat::Json => ToolReply::Json(json!(item)),
                    ReplyFormat::Text => ToolReply::Text(format!(
                        "✅ Added item: {} (category: {})",
                        item.item_name, item.category
                    )),
                },
                Err(e) => store_error(e),
            }
        }
        "remove" => {
            let name = match require_item_name(&args) {
                Ok(name) => name,
                Err(reply) => return reply,
            };
            match equipment.remove_item(&name, args.quantity.unwrap_or(1)) {
                Ok(remaining) => match format {
                    ReplyFormat::Json => {
                        ToolReply::Json(json!({ "item_name": name, "remaining": remaining }))
                    }
                    ReplyFormat::Text => ToolReply::Text(format!(
                        "🗑️ Removed {}: {} remaining",
                        name, remaining
                    )),
                },
                Err(e) => store_error(e),
            }
        }
        "equip" => {
            let Some(mapping) = args.equipment.clone().filter(|m| !m.is_empty()) else {
                return ToolReply::client_error(
                    "'equipment' (slot -> item name) is required for equip",
                );
            };
            match equipment.equip(&mapping, args.auto_add.unwrap_or(true), now) {
                Ok(()) => {
                    let snapshot = equipment.current_equipment().unwrap_or_default();
                    match format {
                        ReplyFormat::Json => ToolReply::Json(json!(snapshot)),
                        ReplyFormat::Text => {
                            let lines: Vec<String> = snapshot
                                .iter()
                                .map(|(slot, item)| format!("   {}: {}", slot, item))
                                .collect();
                            ToolReply::Text(format!("👗 Equipped:\n{}", lines.join("\n")))
                        }
                    }
                }
                Err(e) => store_error(e),
            }
        }
        "unequip" => {
            let Some(slots) = args.slots.clone().filter(|s| !s.is_empty()) else {
                return ToolReply::client_error("'slots' is required for unequip");
            };
            match equipment.unequip(&slots, now) {
                Ok(cleared) if cleared.is_empty() => {
                    ToolReply::Text("Nothing was equipped in those slots.".to_string())
                }
                Ok(cleared) => match format {
                    ReplyFormat::Json => ToolReply::Json(json!({ "cleared": cleared })),
                    ReplyFormat::Text => {
                        ToolReply::Text(format!("👕 Unequipped slots: {}", cleared.join(", ")))
                    }
                },
                Err(e) => store_error(e),
            }
        }
        "update" => {
            let name = match require_item_name(&args) {
                Ok(name) => name,
                Err(reply) => return reply,
            };
            match equipment.update_item(
                &name,
                args.description.as_deref(),
                args.category.as_deref(),
                args.tags.as_deref(),
            ) {
                Ok(()) => ToolReply::Text(format!("✅ Updated item: {}", name)),
                Err(e) => store_error(e),
            }
        }
        "rename" => {
            let name = match require_item_name(&args) {
                Ok(name) => name,
                Err(reply) => return reply,
            };
            let Some(new_name) = args.new_name.clone() else {
                return ToolReply::client_error("'new_name' is required for rename");
            };
            match equipment.rename_item(&name, &new_name) {
                Ok(()) => ToolReply::Text(format!("✅ Renamed {} -> {}", name, new_name)),
                Err(e) => store_error(e),
            }
        }
        "search" => {
            match equipment.search(args.query.as_deref(), args.category.as_deref()) {
                Ok(entries) => match format {
                    ReplyFormat::Json => ToolReply::Json(json!(entries)),
                    ReplyFormat::Text => {
                        if entries.is_empty() {
                            return ToolReply::Text("📦 No items found.".to_string());
                        }
                        let mut text = format!("📦 {} items:\n", entries.len());
                        for entry in &entries {
                            text.push_str(&format!(
                                "- {} x{} ({})\n",
                                entry.item.item_name, entry.quantity, entry.item.category
                            ));
                        }
                        ToolReply::Text(text.trim_end().to_string())
                    }
                },
                Err(e) => store_error(e),
            }
        }
        "history" => {
            let cutoff = now - chrono::Duration::days(args.days.unwrap_or(7).max(1));
            match equipment.history(args.history_slot.as_deref(), cutoff) {
                Ok(events) => match format {
                    ReplyFormat::Json => ToolReply::Json(json!(events)),
                    ReplyFormat::Text => {
                        if events.is_empty() {
                            return ToolReply::Text("📜 No equipment history.".to_string());
                        }
                        let mut text = format!("📜 {} events:\n", events.len());
                        for event in &events {
                            text.push_str(&format!(
                                "- [{}] {} {} ({})\n",
                                event.timestamp,
                                event.action,
                                event.item_name.as_deref().unwrap_or("?"),
                                event.slot
                            ));
                        }
                        ToolReply::Text(text.trim_end().to_string())
                    }
                },
                Err(e) => store_error(e),
            }
        }
        "memories" => {
            let name = match require_item_name(&args) {
                Ok(name) => name,
                Err(reply) => return reply,
            };
            // Memories whose equipment snapshot mentions the item.
            let request = SearchRequest {
                mode: SearchMode::Keyword,
                top_k: args.top_k.unwrap_or(10),
                equipped_item: Some(name.clone()),
                ..Default::default()
            };
            match engine.search(persona, request).await {
                Ok(hits) => match format {
                    ReplyFormat::Json => ToolReply::Json(json!(hits
                        .iter()
                        .map(|hit| json!({
                            "key": hit.record.key,
                            "content": preview(&hit.record.content, 120),
                            "created_at": hit.record.created_at.to_rfc3339(),
                        }))
                        .collect::<Vec<_>>())),
                    ReplyFormat::Text => {
                        if hits.is_empty() {
                            return ToolReply::Text(format!(
                                "📭 No memories with '{}' equipped.",
                                name
                            ));
                        }
                        let mut text =
                            format!("💭 {} memories with '{}' equipped:\n", hits.len(), name);
                        for hit in &hits {
                            text.push_str(&format!(
                                "- [{}] {}\n",
                                hit.record.key,
                                preview(&hit.record.content, 100)
                            ));
                        }
                        ToolReply::Text(text.trim_end().to_string())
                    }
                },
                Err(e) => e.into(),
            }
        }
        "stats" => match equipment.stats() {
            Ok((items, quantity, equipped)) => match format {
                ReplyFormat::Json => ToolReply::Json(json!({
                    "distinct_items": items,
                    "total_quantity": quantity,
                    "equipped_slots": equipped,
                })),
                ReplyFormat::Text => ToolReply::Text(format!(
                    "📊 Inventory: {} items ({} total), {} slots equipped",
                    items, quantity, equipped
                )),
            },
            Err(e) => store_error(e),
        },
        other => ToolReply::client_error(format!(
            "Unknown operation '{}'. Valid: add, remove, equip, unequip, update, rename, search, history, memories, stats",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testutil::test_engine;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_and_search() {
        let (engine, _dir) = test_engine();
        let reply = execute(
            &engine,
            "default",
            Some(json!({
                "operation": "add",
                "item_name": "White Dress",
                "category": "clothing"
            })),
        )
        .await;
        assert!(!reply.is_error());

        let reply = execute(
            &engine,
            "default",
            Some(json!({ "operation": "search", "query": "Dress", "format": "json" })),
        )
        .await;
        let ToolReply::Json(entries) = reply else { panic!() };
        assert_eq!(entries.as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_equip_snapshot_feeds_memory_creation() {
        let (engine, _dir) = test_engine();
        execute(
            &engine,
            "default",
            Some(json!({
                "operation": "equip",
                "equipment": { "top": "White Dress" }
            })),
        )
        .await;

        // A memory created now snapshots the equipped state
        let created = crate::tools::memory::execute(
            &engine,
            "default",
            Some(json!({ "operation": "create", "content": "wore it today", "format": "json" })),
        )
        .await;
        let ToolReply::Json(created) = created else { panic!() };
        assert_eq!(created["equipped_items"]["top"], "White Dress");

        // And the memories operation finds it back
        let reply = execute(
            &engine,
            "default",
            Some(json!({
                "operation": "memories",
                "item_name": "White Dress",
                "format": "json"
            })),
        )
        .await;
        let ToolReply::Json(hits) = reply else { panic!() };
        assert_eq!(hits.as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_missing_item_is_client_error() {
        let (engine, _dir) = test_engine();
        let reply = execute(
            &engine,
            "default",
            Some(json!({ "operation": "remove", "item_name": "Ghost Sword" })),
        )
        .await;
        assert!(matches!(reply, ToolReply::Error { client: true, .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unequip_then_history() {
        let (engine, _dir) = test_engine();
        execute(
            &engine,
            "default",
            Some(json!({ "operation": "equip", "equipment": { "weapon": "Sword" } })),
        )
        .await;
        execute(
            &engine,
            "default",
            Some(json!({ "operation": "unequip", "slots": ["weapon"] })),
        )
        .await;

        let reply = execute(
            &engine,
            "default",
            Some(json!({ "operation": "history", "history_slot": "weapon", "format": "json" })),
        )
        .await;
        let ToolReply::Json(events) = reply else { panic!() };
        assert_eq!(events.as_array().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stats() {
        let (engine, _dir) = test_engine();
        execute(
            &engine,
            "default",
            Some(json!({ "operation": "add", "item_name": "Potion", "quantity": 3 })),
        )
        .await;
        let reply = execute(
            &engine,
            "default",
            Some(json!({ "operation": "stats", "format": "json" })),
        )
        .await;
        let ToolReply::Json(stats) = reply else { panic!() };
        assert_eq!(stats["distinct_items"], 1);
        assert_eq!(stats["total_quantity"], 3);
    }
}
