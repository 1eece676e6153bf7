use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

/// Declarative record of an MCP server, as read from a manifest file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Parse one manifest document: either a JSON array of entries or an
/// object with a `servers` array. Entries without an id or command, and
/// entries declaring a non-stdio transport, are skipped.
pub fn parse_manifest(document: &Value, source: &str) -> Vec<McpServerDef> {
    let entries = match document {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => match map.get("servers").and_then(Value::as_array) {
            Some(entries) => entries.as_slice(),
            None => {
                warn!("manifest {source} has no servers array; ignoring");
                return Vec::new();
            }
        },
        _ => {
            warn!("manifest {source} is neither an array nor an object; ignoring");
            return Vec::new();
        }
    };

    let mut servers = Vec::new();
    for entry in entries {
        let id = entry
            .get("id")
            .or_else(|| entry.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let command = entry
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (Some(id), Some(command)) = (id, command) else {
            debug!("skipping manifest entry without id or command in {source}");
            continue;
        };

        let transport = entry
            .get("transport")
            .and_then(Value::as_str)
            .unwrap_or("stdio");
        if transport != "stdio" {
            warn!("server {id} declares unsupported transport {transport:?}; ignoring");
            continue;
        }

        let args = entry
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let env = entry
            .get("env")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        servers.push(McpServerDef {
            id,
            name: entry.get("name").and_then(Value::as_str).map(str::to_string),
            description: entry
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            command,
            args,
            env,
            metadata: entry.get("metadata").cloned(),
        });
    }
    servers
}

/// Read the configured manifest file (if any) and every `*.json` file in
/// each manifest directory. Duplicate ids are last-write-wins.
pub async fn load_manifests(
    manifest: Option<&Path>,
    manifest_dirs: &[std::path::PathBuf],
) -> HashMap<String, McpServerDef> {
    let mut servers = HashMap::new();

    if let Some(path) = manifest {
        for server in load_file(path).await {
            servers.insert(server.id.clone(), server);
        }
    }

    for dir in manifest_dirs {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!("skipping manifest dir {}: {err}", dir.display());
                continue;
            }
        };
        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        // Deterministic precedence within a directory.
        paths.sort();
        for path in paths {
            for server in load_file(&path).await {
                servers.insert(server.id.clone(), server);
            }
        }
    }

    servers
}

async fn load_file(path: &Path) -> Vec<McpServerDef> {
    let source = path.display().to_string();
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!("failed to read manifest {source}: {err}");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(document) => parse_manifest(&document, &source),
        Err(err) => {
            warn!("failed to parse manifest {source}: {err}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_array_and_object_forms() {
        let array = json!([{"id": "a", "command": "./srv"}]);
        assert_eq!(parse_manifest(&array, "test").len(), 1);

        let object = json!({"servers": [{"name": "b", "command": "./srv", "args": ["--x"]}]});
        let servers = parse_manifest(&object, "test");
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "b");
        assert_eq!(servers[0].args, vec!["--x".to_string()]);
    }

    #[test]
    fn skips_invalid_entries_and_foreign_transports() {
        let document = json!([
            {"id": "no-command"},
            {"command": "./anon"},
            {"id": "ws", "command": "./srv", "transport": "websocket"},
            {"id": "ok", "command": "./srv", "transport": "stdio"}
        ]);
        let servers = parse_manifest(&document, "test");
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "ok");
    }

    #[tokio::test]
    async fn directory_scan_is_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("01-first.json"),
            json!([{"id": "demo", "command": "./one"}]).to_string(),
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("02-second.json"),
            json!([{"id": "demo", "command": "./two"}]).to_string(),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "not a manifest")
            .await
            .unwrap();

        let servers = load_manifests(None, &[dir.path().to_path_buf()]).await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers["demo"].command, "./two");
    }
}
