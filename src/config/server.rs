use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Launch spec for one tool-server process.
///
/// `command` and `args` come straight from the `mcpServers` section of a
/// config document; `env` is merged over the ambient environment at spawn
/// time. A missing command deserializes to an empty string and is rejected
/// before any process is spawned.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawServerSpec")]
pub struct ServerSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ServerSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawServerSpec {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
}

impl From<RawServerSpec> for ServerSpec {
    fn from(raw: RawServerSpec) -> Self {
        // `$VAR` and `~` expansion; unresolvable references fall back to
        // the literal text rather than failing the whole config.
        let expand = |s: &str| -> String {
            shellexpand::full(s)
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };

        Self {
            command: expand(&raw.command),
            args: raw.args.iter().map(|arg| expand(arg)).collect(),
            env: raw.env,
            cwd: raw.cwd.map(|dir| PathBuf::from(expand(&dir))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_full_spec() {
        let spec: ServerSpec = serde_json::from_str(
            r#"{
                "command": "/usr/bin/mcp-fs",
                "args": ["--root", "/tmp"],
                "env": {"API_KEY": "secret"},
                "cwd": "/tmp"
            }"#,
        )
        .unwrap();

        assert_eq!(spec.command, "/usr/bin/mcp-fs");
        assert_eq!(spec.args, vec!["--root", "/tmp"]);
        assert_eq!(spec.env.get("API_KEY"), Some(&"secret".to_string()));
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn missing_command_becomes_empty_string() {
        let spec: ServerSpec = serde_json::from_str(r#"{"args": ["--help"]}"#).unwrap();
        assert!(spec.command.is_empty());
        assert_eq!(spec.args, vec!["--help"]);
    }

    #[test]
    fn expands_home_in_command_and_args() {
        let home = std::env::var("HOME").expect("HOME set in test environment");
        let spec: ServerSpec = serde_json::from_str(
            r#"{"command": "$HOME/bin/server", "args": ["--data", "~/data"]}"#,
        )
        .unwrap();

        assert_eq!(spec.command, format!("{home}/bin/server"));
        assert_eq!(spec.args[1], format!("{home}/data"));
    }

    #[test]
    fn unknown_variable_is_left_verbatim() {
        let spec: ServerSpec =
            serde_json::from_str(r#"{"command": "${NO_SUCH_MCP_RELAY_VAR}/server"}"#).unwrap();
        assert_eq!(spec.command, "${NO_SUCH_MCP_RELAY_VAR}/server");
    }
}
