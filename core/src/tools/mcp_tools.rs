use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;

use crate::tools::context::ToolContext;
use crate::tools::registry::ToolHandler;

/// Enumerate the configured MCP servers.
pub struct McpServersTool;

#[async_trait]
impl ToolHandler for McpServersTool {
    async fn handle(&self, _call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let servers = ctx.mcp.servers().await;
        let listing: Vec<Value> = servers
            .iter()
            .map(|server| {
                json!({
                    "id": server.id,
                    "name": server.name,
                    "description": server.description,
                    "command": server.command,
                })
            })
            .collect();
        Ok(ToolResult::success(json!(listing).to_string()))
    }
}

/// Call a named tool on a named server, for clients that want to address
/// MCP servers explicitly rather than through the dynamic proxies.
pub struct McpCallTool;

#[async_trait]
impl ToolHandler for McpCallTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let server = call
            .string_arg(&["server", "server_id"])
            .ok_or_else(|| anyhow!("missing server argument"))?;
        let tool = call
            .string_arg(&["tool", "name"])
            .ok_or_else(|| anyhow!("missing tool argument"))?;
        let arguments = call.arguments.get("arguments").cloned();

        let reply = ctx
            .mcp
            .call_tool(&server, &tool, arguments)
            .await
            .map_err(|err| anyhow!("MCP call failed: {err}"))?;
        Ok(ToolResult::success(reply.to_string())
            .with_metadata("server", json!(server))
            .with_metadata("tool", json!(tool)))
    }
}

/// List or release sandbox sessions.
pub struct SandboxSessionsTool;

#[async_trait]
impl ToolHandler for SandboxSessionsTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        if let Some(release) = call.string_arg(&["release", "release_id"]) {
            let released = ctx.sandbox.release_session(&release);
            return Ok(ToolResult::success(
                json!({"released": released, "id": release}).to_string(),
            ));
        }
        let sessions = ctx.sandbox.list_sessions();
        Ok(ToolResult::success(serde_json::to_string(&sessions)?))
    }
}

/// Proxy for one remote tool discovered via `tools/list`. The full
/// argument mapping is forwarded as the call's arguments.
pub struct McpProxyTool {
    pub server_id: String,
    pub tool_name: String,
}

#[async_trait]
impl ToolHandler for McpProxyTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let arguments = Value::Object(call.arguments.clone());
        let reply = ctx
            .mcp
            .call_tool(&self.server_id, &self.tool_name, Some(arguments))
            .await
            .map_err(|err| anyhow!("MCP call failed: {err}"))?;
        Ok(ToolResult::success(reply.to_string())
            .with_metadata("server", json!(self.server_id))
            .with_metadata("tool", json!(self.tool_name)))
    }
}
