//! HTTP Transport
//!
//! Serves the JSON-RPC tool-call surface over plain HTTP plus a small REST
//! dashboard. The persona travels per request, either as a bearer
//! credential or in the `x-persona` header.
//!
//! Endpoints:
//! - POST /mcp - JSON-RPC request -> JSON response
//! - DELETE /mcp - terminate session
//! - GET /api/metrics - engine metrics (dashboard)
//! - GET /api/cleanup - cleanup suggester report (dashboard)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use kioku_core::MemoryEngine;

use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::resources;
use crate::server::McpServer;

struct Session {
    server: Mutex<McpServer>,
}

struct AppState {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    engine: Arc<MemoryEngine>,
    default_persona: String,
}

pub struct HttpTransportConfig {
    pub host: String,
    pub port: u16,
}

pub struct HttpTransport {
    config: HttpTransportConfig,
}

/// Resolve the request persona: `x-persona` header first, then a bearer
/// credential, then the process default.
fn persona_from_headers(headers: &HeaderMap, default_persona: &str) -> String {
    if let Some(persona) = headers.get("x-persona").and_then(|v| v.to_str().ok()) {
        if !persona.is_empty() {
            return persona.to_string();
        }
    }
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return token.to_string();
            }
        }
    }
    default_persona.to_string()
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        self,
        engine: Arc<MemoryEngine>,
        default_persona: String,
    ) -> Result<(), std::io::Error> {
        let state = Arc::new(AppState {
            sessions: Mutex::new(HashMap::new()),
            engine,
            default_persona,
        });

        let app = Router::new()
            .route("/mcp", post(handle_post))
            .route("/mcp", delete(handle_delete))
            .route("/api/metrics", get(handle_metrics))
            .route("/api/cleanup", get(handle_cleanup))
            .layer(CorsLayer::permissive())
            .with_state(state);

        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        info!("MCP HTTP server listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("MCP HTTP server shutting down");
        Ok(())
    }
}

async fn get_or_create_session(state: &AppState, headers: &HeaderMap) -> (Arc<Session>, String) {
    let existing_id = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut sessions = state.sessions.lock().await;
    if let Some(id) = &existing_id {
        if let Some(session) = sessions.get(id) {
            return (Arc::clone(session), id.clone());
        }
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let server = McpServer::new(Arc::clone(&state.engine), state.default_persona.clone());
    let session = Arc::new(Session {
        server: Mutex::new(server),
    });
    sessions.insert(session_id.clone(), Arc::clone(&session));
    info!("Created new MCP session: {}", session_id);
    (session, session_id)
}

/// POST /mcp - handle one JSON-RPC request. Client faults are 4xx, our
/// faults 5xx; handled tool errors ride inside a 200 response.
async fn handle_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to parse JSON-RPC request: {}", e);
            let response = JsonRpcResponse::error(None, JsonRpcError::parse_error());
            return (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "application/json")],
                serde_json::to_string(&response).unwrap_or_default(),
            )
                .into_response();
        }
    };

    let persona = persona_from_headers(&headers, &state.default_persona);
    let (session, session_id) = get_or_create_session(&state, &headers).await;

    let mut server = session.server.lock().await;
    let response = server.handle_request(request, Some(&persona)).await;
    drop(server);

    match response {
        Some(response) => {
            let status = match &response.error {
                Some(error) if error.code == -32603 => StatusCode::INTERNAL_SERVER_ERROR,
                Some(_) => StatusCode::BAD_REQUEST,
                None => StatusCode::OK,
            };
            let json = serde_json::to_string(&response).unwrap_or_else(|_| {
                r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#
                    .to_string()
            });
            (
                status,
                [
                    (header::CONTENT_TYPE.as_str(), "application/json"),
                    ("mcp-session-id", session_id.as_str()),
                ],
                json,
            )
                .into_response()
        }
        // Notification: no body
        None => (
            StatusCode::ACCEPTED,
            [("mcp-session-id", session_id.as_str())],
        )
            .into_response(),
    }
}

/// DELETE /mcp - terminate a session.
async fn handle_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    match headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) {
        Some(id) => {
            let mut sessions = state.sessions.lock().await;
            if sessions.remove(id).is_some() {
                info!("Terminated MCP session: {}", id);
                StatusCode::OK.into_response()
            } else {
                (StatusCode::NOT_FOUND, "Session not found").into_response()
            }
        }
        None => (StatusCode::BAD_REQUEST, "Missing mcp-session-id header").into_response(),
    }
}

/// GET /api/metrics - dashboard view of the engine counters.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match resources::read(&state.engine, resources::METRICS_URI) {
        Some(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            text,
        )
            .into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// GET /api/cleanup - latest cleanup suggester report.
async fn handle_cleanup(State(state): State<Arc<AppState>>) -> Response {
    match resources::read(&state.engine, resources::CLEANUP_URI) {
        Some(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            text,
        )
            .into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_header_takes_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-persona", "luna".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer hertha".parse().unwrap());
        assert_eq!(persona_from_headers(&headers, "default"), "luna");
    }

    #[test]
    fn test_bearer_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer hertha".parse().unwrap());
        assert_eq!(persona_from_headers(&headers, "default"), "hertha");
    }

    #[test]
    fn test_default_persona() {
        let headers = HeaderMap::new();
        assert_eq!(persona_from_headers(&headers, "default"), "default");
    }

    #[test]
    fn test_empty_header_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-persona", "".parse().unwrap());
        assert_eq!(persona_from_headers(&headers, "default"), "default");
    }
}
