//! MCP Resources
//!
//! Read-only resources: `memory://metrics` (engine counters, dirty flag,
//! queue depth, worker stamps) and `memory://cleanup-suggestions` (the
//! latest cleanup suggester report). Background-worker failures surface to
//! clients only through these.

use std::sync::Arc;

use serde_json::json;

use kioku_core::MemoryEngine;

use crate::protocol::messages::ResourceDescription;

pub const METRICS_URI: &str = "memory://metrics";
pub const CLEANUP_URI: &str = "memory://cleanup-suggestions";

pub fn list() -> Vec<ResourceDescription> {
    vec![
        ResourceDescription {
            uri: METRICS_URI.to_string(),
            name: "Memory engine metrics".to_string(),
            description: Some(
                "Store counts, vector-index dirty flag, queue depth and worker timestamps"
                    .to_string(),
            ),
            mime_type: "application/json".to_string(),
        },
        ResourceDescription {
            uri: CLEANUP_URI.to_string(),
            name: "Cleanup suggestions".to_string(),
            description: Some(
                "Near-duplicate memory pairs found by the cleanup suggester (non-destructive)"
                    .to_string(),
            ),
            mime_type: "application/json".to_string(),
        },
    ]
}

/// Resolve a resource URI to its JSON text, or `None` for unknown URIs.
pub fn read(engine: &Arc<MemoryEngine>, uri: &str) -> Option<String> {
    let value = match uri {
        METRICS_URI => engine.metrics(),
        CLEANUP_URI => json!(engine.cleanup_report()),
        _ => return None,
    };
    Some(serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()))
}
