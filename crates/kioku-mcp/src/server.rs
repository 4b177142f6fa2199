//! MCP Server Core
//!
//! Routes JSON-RPC requests to the tool and resource handlers. The persona
//! is bound per request: the HTTP transport passes the `x-persona` header,
//! stdio falls back to the process default.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use kioku_core::{persona, MemoryEngine};

use crate::protocol::messages::{
    CallToolRequest, CallToolResult, ContentBlock, InitializeRequest, InitializeResult,
    ReadResourceRequest, ReadResourceResult, ResourceContents, ServerCapabilities, ServerInfo,
    ToolDescription,
};
use crate::protocol::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_VERSION};
use crate::resources;
use crate::tools;

/// Per-call deadline; the durable write is not rolled back on expiry.
const TOOL_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct McpServer {
    engine: Arc<MemoryEngine>,
    default_persona: String,
    initialized: bool,
}

impl McpServer {
    pub fn new(engine: Arc<MemoryEngine>, default_persona: String) -> Self {
        Self {
            engine,
            default_persona,
            initialized: false,
        }
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    /// Handle one request. `persona_override` comes from the transport
    /// (`x-persona` header); notifications return `None`.
    pub async fn handle_request(
        &mut self,
        request: JsonRpcRequest,
        persona_override: Option<&str>,
    ) -> Option<JsonRpcResponse> {
        debug!("Handling request: {}", request.method);

        if !self.initialized
            && request.method != "initialize"
            && request.method != "notifications/initialized"
        {
            warn!("Rejecting '{}': server not initialized", request.method);
            return Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::server_not_initialized(),
            ));
        }

        let persona = persona::sanitize(persona_override.unwrap_or(&self.default_persona));

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params),
            "notifications/initialized" => return None,
            "tools/list" => self.handle_tools_list(),
            "tools/call" => self.handle_tools_call(request.params, &persona).await,
            "resources/list" => self.handle_resources_list(),
            "resources/read" => self.handle_resources_read(request.params),
            "ping" => Ok(serde_json::json!({})),
            method => Err(JsonRpcError::method_not_found(method)),
        };

        Some(match result {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => JsonRpcResponse::error(request.id, error),
        })
    }

    fn handle_initialize(
        &mut self,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: InitializeRequest = match params {
            Some(p) => {
                serde_json::from_value(p).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?
            }
            None => InitializeRequest::default(),
        };

        // Clients reject servers advertising a newer protocol revision.
        let negotiated = if request.protocol_version.as_str() < MCP_VERSION {
            request.protocol_version.clone()
        } else {
            MCP_VERSION.to_string()
        };

        self.initialized = true;
        info!("MCP session initialized (protocol {})", negotiated);

        let result = InitializeResult {
            protocol_version: negotiated,
            server_info: ServerInfo {
                name: "kioku".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: ServerCapabilities {
                tools: Some(HashMap::from([(
                    "listChanged".to_string(),
                    serde_json::json!(false),
                )])),
                resources: Some(HashMap::from([(
                    "listChanged".to_string(),
                    serde_json::json!(false),
                )])),
            },
            instructions: Some(
                "Kioku is a persona-scoped long-term memory service. Use the memory tool to \
                 create, search and manage memories, the item tool for inventory and equipment, \
                 and get_context for the always-in-context persona state. Pass the persona via \
                 the x-persona header when connecting over HTTP."
                    .to_string(),
            ),
        };

        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    fn handle_tools_list(&self) -> Result<serde_json::Value, JsonRpcError> {
        let tools = vec![
            ToolDescription {
                name: "memory".to_string(),
                description: Some(
                    "Unified memory operations. Memory ops: 'create' (store a memory with \
                     emotion/tags/importance), 'read' (by key, or recent when no query), \
                     'update', 'delete', 'search' (keyword/semantic/hybrid/related/smart with \
                     metadata filters), 'stats', 'check_routines' (recurring patterns at the \
                     current time). Context ops: 'promise', 'goal', 'sensation', \
                     'emotion_flow', 'block', 'user_info', 'update_context'."
                        .to_string(),
                ),
                input_schema: tools::memory::schema(),
            },
            ToolDescription {
                name: "item".to_string(),
                description: Some(
                    "Unified inventory and equipment tool. Operations: 'add', 'remove', \
                     'equip' (slot -> item, other slots keep their content), 'unequip', \
                     'update', 'rename', 'search', 'history', 'memories' (memories with the \
                     item equipped), 'stats'. Physical items only - memories and body states \
                     belong to the memory tool."
                        .to_string(),
                ),
                input_schema: tools::item::schema(),
            },
            ToolDescription {
                name: "get_context".to_string(),
                description: Some(
                    "Composite persona context: current state and mood, user state, memory \
                     blocks, active promises/goals, recent memories and anniversaries."
                        .to_string(),
                ),
                input_schema: tools::context::schema(),
            },
        ];

        Ok(serde_json::json!({ "tools": tools }))
    }

    async fn handle_tools_call(
        &self,
        params: Option<serde_json::Value>,
        persona: &str,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: CallToolRequest = match params {
            Some(p) => {
                serde_json::from_value(p).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?
            }
            None => return Err(JsonRpcError::invalid_params("Missing tool call parameters")),
        };

        // On expiry the durable write either completed or not; an already
        // enqueued vector task is not cancelled.
        let call = async {
            match request.name.as_str() {
                "memory" => {
                    Ok(tools::memory::execute(&self.engine, persona, request.arguments).await)
                }
                "item" => Ok(tools::item::execute(&self.engine, persona, request.arguments).await),
                "get_context" => {
                    Ok(tools::context::execute(&self.engine, persona, request.arguments).await)
                }
                other => Err(JsonRpcError::method_not_found(&format!("tool '{}'", other))),
            }
        };
        let reply = match tokio::time::timeout(TOOL_CALL_TIMEOUT, call).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Tool call '{}' timed out", request.name);
                tools::ToolReply::server_error(format!(
                    "Tool call timed out after {}s",
                    TOOL_CALL_TIMEOUT.as_secs()
                ))
            }
        };

        let result = CallToolResult {
            is_error: reply.is_error(),
            content: vec![ContentBlock::Text {
                text: reply.render_text(),
            }],
        };
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    fn handle_resources_list(&self) -> Result<serde_json::Value, JsonRpcError> {
        Ok(serde_json::json!({ "resources": resources::list() }))
    }

    fn handle_resources_read(
        &self,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: ReadResourceRequest = match params {
            Some(p) => {
                serde_json::from_value(p).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?
            }
            None => return Err(JsonRpcError::invalid_params("Missing resource parameters")),
        };

        let text = resources::read(&self.engine, &request.uri)
            .ok_or_else(|| JsonRpcError::resource_not_found(&request.uri))?;
        let result = ReadResourceResult {
            contents: vec![ResourceContents {
                uri: request.uri,
                mime_type: "application/json".to_string(),
                text,
            }],
        };
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
