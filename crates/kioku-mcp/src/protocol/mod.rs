//! MCP Protocol Layer
//!
//! JSON-RPC types, the stdio transport, and the HTTP transport that also
//! carries the per-request persona header.

pub mod messages;
pub mod stdio;
pub mod types;

#[cfg(feature = "http")]
pub mod http;
