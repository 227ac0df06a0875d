use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong while talking to an MCP server.
///
/// Transport and spawn failures are terminal for their connection; protocol
/// failures (`Decode`, `Malformed`) are logged and the offending message is
/// dropped; `Rpc` and `Timeout` only concern the single waiting caller.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to spawn MCP server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("MCP server '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("failed to encode JSON-RPC message: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid JSON-RPC message: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed JSON-RPC message: {reason}")]
    Malformed { reason: String },
    #[error("MCP server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("MCP request '{method}' to '{server}' timed out after {timeout:?}")]
    Timeout {
        server: String,
        method: String,
        timeout: Duration,
    },
    #[error("MCP server '{server}' is not initialized")]
    NotInitialized { server: String },
    #[error("MCP server '{server}' connection closed")]
    ConnectionClosed { server: String },
    #[error("MCP server '{server}' is not registered")]
    ServerNotFound { server: String },
    #[error("tool '{tool}' not found on any MCP server")]
    ToolNotFound { tool: String },
    #[error("launch spec for MCP server '{server}' is missing a command")]
    MissingCommand { server: String },
}
