use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::info;
use tracing::warn;

use overpass_mcp_client::McpClient;
use overpass_mcp_client::McpClientError;

use crate::config::Config;
use crate::mcp::manifest;
use crate::mcp::manifest::McpServerDef;

/// Timeout for `initialize` plus the initial `tools/list`.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for individual remote tool calls.
const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// A remote tool surfaced into the local tool namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    pub local_name: String,
    pub server_id: String,
    pub tool_name: String,
    pub description: Option<String>,
}

/// Owns the manifest inventory and at most one live client per server id.
/// Clients are spawned lazily on first use and torn down on `close_all`.
pub struct McpRegistry {
    config: Arc<Config>,
    servers: RwLock<HashMap<String, McpServerDef>>,
    clients: Mutex<HashMap<String, Arc<McpClient>>>,
}

impl McpRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            servers: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Discover manifests. Called at boot and on explicit refresh; within a
    /// single load, duplicate server ids are last-write-wins.
    pub async fn load(&self) -> usize {
        let discovered = manifest::load_manifests(
            self.config.mcp.manifest.as_deref(),
            &self.config.mcp.manifest_dirs,
        )
        .await;
        let count = discovered.len();
        let mut servers = self.servers.write().await;
        *servers = discovered;
        count
    }

    pub async fn servers(&self) -> Vec<McpServerDef> {
        let servers = self.servers.read().await;
        let mut list: Vec<McpServerDef> = servers.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn server(&self, id: &str) -> Option<McpServerDef> {
        self.servers.read().await.get(id).cloned()
    }

    /// Get (or lazily spawn) the client for a server. A client whose child
    /// has exited is discarded and respawned. `initialize` failures are
    /// logged but leave the client usable.
    pub async fn client_for(&self, id: &str) -> Result<Arc<McpClient>, McpClientError> {
        let def = self
            .server(id)
            .await
            .ok_or_else(|| McpClientError::Rpc {
                code: -32601,
                message: format!("unknown MCP server {id:?}"),
            })?;

        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(id) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
            clients.remove(id);
        }

        info!("spawning MCP server {id} ({})", def.command);
        let client = Arc::new(McpClient::spawn(&def.command, &def.args, &def.env).await?);
        if let Err(err) = client.initialize(Some(STARTUP_TIMEOUT)).await {
            warn!("MCP server {id} failed to initialize: {err}");
        }
        clients.insert(id.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Proxy a tool call to a server.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<Value, McpClientError> {
        let client = self.client_for(server_id).await?;
        client.call_tool(tool, arguments, Some(TOOL_TIMEOUT)).await
    }

    /// Enumerate remote tools across every configured server, spawning
    /// clients as needed. Servers that fail to answer are skipped.
    pub async fn remote_tools(&self) -> Vec<RemoteTool> {
        let servers = self.servers().await;
        let mut tools = Vec::new();
        for def in servers {
            let client = match self.client_for(&def.id).await {
                Ok(client) => client,
                Err(err) => {
                    warn!("skipping MCP server {}: {err}", def.id);
                    continue;
                }
            };
            let listing = match client.list_tools(Some(STARTUP_TIMEOUT)).await {
                Ok(listing) => listing,
                Err(err) => {
                    warn!("tools/list failed for MCP server {}: {err}", def.id);
                    continue;
                }
            };
            let Some(entries) = listing.get("tools").and_then(Value::as_array) else {
                continue;
            };
            for entry in entries {
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    continue;
                };
                tools.push(RemoteTool {
                    local_name: remote_tool_name(&def.id, name),
                    server_id: def.id.clone(),
                    tool_name: name.to_string(),
                    description: entry
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
        }
        tools
    }

    /// Close every live client, rejecting their pending requests. Used by
    /// the shutdown signal handler and by tests.
    pub async fn close_all(&self) {
        let clients: Vec<(String, Arc<McpClient>)> = {
            let mut guard = self.clients.lock().await;
            guard.drain().collect()
        };
        for (id, client) in clients {
            info!("closing MCP server {id}");
            client.close().await;
        }
    }
}

/// Local name for a remote tool: `mcp_<server>_<tool>` with every
/// non-alphanumeric run collapsed to a single underscore.
pub fn remote_tool_name(server_id: &str, tool_name: &str) -> String {
    format!(
        "mcp_{}_{}",
        sanitize_component(server_id),
        sanitize_component(tool_name)
    )
}

fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_separator = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_separator = false;
        } else if !last_was_separator {
            out.push('_');
            last_was_separator = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn remote_names_are_sanitized_and_collapsed() {
        assert_eq!(remote_tool_name("demo", "echo"), "mcp_demo_echo");
        assert_eq!(
            remote_tool_name("my.server", "read/file"),
            "mcp_my_server_read_file"
        );
        assert_eq!(
            remote_tool_name("a--b", "c..!!d"),
            "mcp_a_b_c_d"
        );
    }
}
