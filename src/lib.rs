//! mcp-relay: connection engine for MCP tool servers.
//!
//! Spawns tool-server processes, speaks newline-delimited JSON-RPC 2.0 over
//! their stdio pipes, correlates concurrent requests with asynchronously
//! arriving responses, and manages the full process lifecycle from the
//! capability handshake down to escalating shutdown. Conversion of tool
//! descriptors into an LLM function-calling schema and formatting of call
//! results live in the layers above; they consume [`ToolDispatch`].

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod protocol;

pub use config::{ConfigError, ServerSpec, load_servers};
pub use connection::{
    ConnectionOptions, ConnectionState, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SHUTDOWN_GRACE,
    McpConnection, ShutdownStep,
};
pub use error::McpError;
pub use manager::{AggregatedTool, McpManager, ToolDispatch};
pub use protocol::{PROTOCOL_VERSION, ToolDescriptor};

use tracing_subscriber::{EnvFilter, fmt};

/// Install the default tracing subscriber: `RUST_LOG` when set, `info`
/// otherwise. Safe to call more than once.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
