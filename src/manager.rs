//! Registry of named connections and the routing layer above them.
//!
//! The manager owns the name-to-connection mapping exclusively; connections
//! know nothing about each other. Registration order is kept because
//! implicit tool routing resolves duplicate tool names in favor of the
//! first-registered server.

use crate::config::{self, ServerSpec};
use crate::connection::{ConnectionOptions, McpConnection};
use crate::error::McpError;
use crate::protocol::ToolDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};

/// A tool descriptor tagged with the server it came from. Tool names are
/// only unique per server, so the origin tag is what keeps an aggregated
/// listing unambiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedTool {
    pub server: String,
    pub tool: ToolDescriptor,
}

/// The boundary consumed by layers that adapt tools for an LLM: everything
/// they need, nothing about processes or wire framing.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    async fn list_all_tools(&self) -> Vec<AggregatedTool>;

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        server: Option<&str>,
    ) -> Result<Value, McpError>;
}

pub struct McpManager {
    connections: AsyncMutex<Vec<(String, Arc<McpConnection>)>>,
    options: ConnectionOptions,
}

impl McpManager {
    pub fn new() -> Self {
        Self::with_options(ConnectionOptions::default())
    }

    pub fn with_options(options: ConnectionOptions) -> Self {
        Self {
            connections: AsyncMutex::new(Vec::new()),
            options,
        }
    }

    /// Spawn and initialize a tool server under `name`. Starting an
    /// already-registered name is a no-op success. A failed handshake
    /// tears the process down and leaves no partial registration behind.
    pub async fn start(&self, name: &str, spec: &ServerSpec) -> Result<(), McpError> {
        if self.connection(name).await.is_some() {
            info!(server = name, "MCP server is already running");
            return Ok(());
        }

        let connection = McpConnection::spawn_with_options(name, spec, self.options)?;
        if let Err(err) = connection.initialize().await {
            connection.close().await;
            return Err(err);
        }

        let duplicate = {
            let mut connections = self.connections.lock().await;
            if connections.iter().any(|(existing, _)| existing == name) {
                true
            } else {
                connections.push((name.to_string(), Arc::new(connection.clone())));
                false
            }
        };
        if duplicate {
            // Lost a start race for the same name; the first registration wins.
            connection.close().await;
            return Ok(());
        }

        info!(server = name, "started and initialized MCP server");
        Ok(())
    }

    /// Stop `name` and forget it. Returns `false` when the name is not
    /// registered. Bookkeeping is removed even when the process resists
    /// graceful shutdown; the escalation inside `close` deals with that.
    pub async fn stop(&self, name: &str) -> bool {
        let removed = {
            let mut connections = self.connections.lock().await;
            connections
                .iter()
                .position(|(existing, _)| existing == name)
                .map(|index| connections.remove(index))
        };

        match removed {
            Some((_, connection)) => {
                let step = connection.close().await;
                info!(server = name, step = ?step, "stopped MCP server");
                true
            }
            None => false,
        }
    }

    /// Stop every registered server. One stubborn server never prevents
    /// the others from being stopped.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, Arc<McpConnection>)> = {
            let mut connections = self.connections.lock().await;
            connections.drain(..).collect()
        };
        for (name, connection) in drained {
            let step = connection.close().await;
            info!(server = %name, step = ?step, "stopped MCP server");
        }
    }

    /// Registered server names in registration order.
    pub async fn servers(&self) -> Vec<String> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn connection(&self, name: &str) -> Option<Arc<McpConnection>> {
        self.connections
            .lock()
            .await
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, connection)| Arc::clone(connection))
    }

    /// Cached tool descriptors from every registered connection, each
    /// tagged with its origin server name.
    pub async fn list_all_tools(&self) -> Vec<AggregatedTool> {
        let snapshot: Vec<(String, Arc<McpConnection>)> =
            { self.connections.lock().await.clone() };

        let mut all = Vec::new();
        for (server, connection) in snapshot {
            for tool in connection.list_tools().await {
                all.push(AggregatedTool {
                    server: server.clone(),
                    tool,
                });
            }
        }
        all
    }

    /// Route a tool invocation. With an explicit `server` the call goes
    /// straight there; otherwise the first registered connection whose
    /// cached catalogue contains `tool` wins.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        server: Option<&str>,
    ) -> Result<Value, McpError> {
        if let Some(name) = server {
            let connection =
                self.connection(name)
                    .await
                    .ok_or_else(|| McpError::ServerNotFound {
                        server: name.to_string(),
                    })?;
            return connection.call_tool(tool, arguments).await;
        }

        let snapshot: Vec<(String, Arc<McpConnection>)> =
            { self.connections.lock().await.clone() };
        for (_, connection) in snapshot {
            let known = connection
                .list_tools()
                .await
                .iter()
                .any(|descriptor| descriptor.name == tool);
            if known {
                return connection.call_tool(tool, arguments).await;
            }
        }

        Err(McpError::ToolNotFound {
            tool: tool.to_string(),
        })
    }

    /// Read named launch specs from a JSON config file. Any I/O or parse
    /// failure is logged and an empty map returned, so callers can proceed
    /// with zero configured servers.
    pub fn load_config(&self, path: &Path) -> HashMap<String, ServerSpec> {
        match config::load_servers(path) {
            Ok(servers) => servers,
            Err(err) => {
                error!(path = %path.display(), %err, "failed to load MCP server config");
                HashMap::new()
            }
        }
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolDispatch for McpManager {
    async fn list_all_tools(&self) -> Vec<AggregatedTool> {
        McpManager::list_all_tools(self).await
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        server: Option<&str>,
    ) -> Result<Value, McpError> {
        McpManager::call_tool(self, tool, arguments, server).await
    }
}
