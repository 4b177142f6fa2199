//! Tool Layer
//!
//! The three tools exposed to callers: `memory`, `item` and `get_context`.
//! Every tool returns a [`ToolReply`] sum type; the transport decides how
//! to render it (human-readable text, structured JSON, or a single error
//! line with the failure sigil).

pub mod context;
pub mod context_ops;
pub mod item;
pub mod memory;

use kioku_core::EngineError;
use serde_json::Value;

/// Failure sigil prefixing every error line.
pub const ERROR_SIGIL: &str = "❌";

/// The result of a tool operation, formatted by the transport layer.
#[derive(Debug, Clone)]
pub enum ToolReply {
    /// Human-readable success text.
    Text(String),
    /// Structured payload (negotiated with `format=json`).
    Json(Value),
    /// Handled failure; `client` distinguishes 4xx-class from 5xx-class.
    Error { client: bool, message: String },
}

impl ToolReply {
    pub fn client_error(message: impl Into<String>) -> Self {
        ToolReply::Error {
            client: true,
            message: message.into(),
        }
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        ToolReply::Error {
            client: false,
            message: message.into(),
        }
    }

    /// Render as a single line of text (errors carry the sigil).
    pub fn render_text(&self) -> String {
        match self {
            ToolReply::Text(text) => text.clone(),
            ToolReply::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
            ToolReply::Error { message, .. } => format!("{} Error: {}", ERROR_SIGIL, message),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolReply::Error { .. })
    }
}

impl From<EngineError> for ToolReply {
    fn from(error: EngineError) -> Self {
        ToolReply::Error {
            client: error.is_client_error(),
            message: error.to_string(),
        }
    }
}

/// Requested reply format: human text by default, JSON when negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyFormat {
    #[default]
    Text,
    Json,
}

impl ReplyFormat {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("json") => ReplyFormat::Json,
            _ => ReplyFormat::Text,
        }
    }
}

/// Char-safe content preview for list rendering.
pub(crate) fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() > max_chars {
        let truncated: String = content.chars().take(max_chars).collect();
        format!("{}...", truncated)
    } else {
        content.to_string()
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rendering_carries_sigil() {
        let reply = ToolReply::client_error("content is required");
        let line = reply.render_text();
        assert!(line.starts_with(ERROR_SIGIL));
        assert!(line.contains("content is required"));
        assert!(reply.is_error());
    }

    #[test]
    fn test_reply_format_negotiation() {
        assert_eq!(ReplyFormat::parse(Some("json")), ReplyFormat::Json);
        assert_eq!(ReplyFormat::parse(Some("text")), ReplyFormat::Text);
        assert_eq!(ReplyFormat::parse(None), ReplyFormat::Text);
    }

    #[test]
    fn test_preview_char_safe() {
        let multibyte = "あ".repeat(50);
        let p = preview(&multibyte, 10);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), 13);
    }
}
