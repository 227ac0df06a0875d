use super::error::ConfigError;
use super::server::ServerSpec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::{fs, io};
use tracing::debug;

/// Raw document shape; only the `mcpServers` section matters here, any
/// sibling keys belong to other layers and are ignored.
#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: HashMap<String, ServerSpec>,
}

/// Read named launch specs from a JSON config file.
///
/// This is the strict variant: callers that prefer the
/// log-and-continue-with-nothing policy go through
/// [`McpManager::load_config`](crate::manager::McpManager::load_config).
pub fn load_servers(path: &Path) -> Result<HashMap<String, ServerSpec>, ConfigError> {
    debug!(path = %path.display(), "reading MCP server config");

    let content = fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let parsed: ConfigDocument =
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(parsed.mcp_servers)
}
