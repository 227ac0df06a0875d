// Config source tests: the strict loader and the manager's
// log-and-continue wrapper around it.

use mcp_relay::{ConfigError, McpManager, load_servers};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("mcp.json");
    fs::write(&path, content).expect("failed to write config");
    path
}

#[test]
fn loads_named_server_specs() {
    let dir = tempdir().expect("tempdir");
    let path = write_config(
        dir.path(),
        r#"{
            "mcpServers": {
                "filesystem": {
                    "command": "/usr/bin/mcp-fs",
                    "args": ["--root", "/srv"],
                    "env": {"FS_TOKEN": "abc"}
                },
                "search": {
                    "command": "mcp-search"
                }
            },
            "otherSection": {"ignored": true}
        }"#,
    );

    let servers = load_servers(&path).unwrap();
    assert_eq!(servers.len(), 2);

    let fs_spec = &servers["filesystem"];
    assert_eq!(fs_spec.command, "/usr/bin/mcp-fs");
    assert_eq!(fs_spec.args, vec!["--root", "/srv"]);
    assert_eq!(fs_spec.env.get("FS_TOKEN"), Some(&"abc".to_string()));

    let search_spec = &servers["search"];
    assert_eq!(search_spec.command, "mcp-search");
    assert!(search_spec.args.is_empty());
}

#[test]
fn document_without_server_section_yields_empty_map() {
    let dir = tempdir().expect("tempdir");
    let path = write_config(dir.path(), r#"{"model": "something-else"}"#);

    let servers = load_servers(&path).unwrap();
    assert!(servers.is_empty());
}

#[test]
fn missing_file_is_a_distinct_error() {
    let result = load_servers(Path::new("/nonexistent/mcp.json"));
    assert!(matches!(result, Err(ConfigError::NotFound { .. })));
}

#[test]
fn unparseable_document_is_a_parse_error() {
    let dir = tempdir().expect("tempdir");
    let path = write_config(dir.path(), "{ not json");

    let result = load_servers(&path);
    assert!(matches!(result, Err(ConfigError::Parse { .. })));
}

#[test]
fn manager_load_config_swallows_failures() {
    let manager = McpManager::new();

    let servers = manager.load_config(Path::new("/nonexistent/mcp.json"));
    assert!(servers.is_empty());

    let dir = tempdir().expect("tempdir");
    let path = write_config(dir.path(), "broken");
    assert!(manager.load_config(&path).is_empty());
}

#[test]
fn manager_load_config_passes_through_valid_specs() {
    let manager = McpManager::new();
    let dir = tempdir().expect("tempdir");
    let path = write_config(
        dir.path(),
        r#"{"mcpServers": {"only": {"command": "mcp-only"}}}"#,
    );

    let servers = manager.load_config(&path);
    assert_eq!(servers.len(), 1);
    assert_eq!(servers["only"].command, "mcp-only");
}
