use std::sync::Arc;

use overpass_state::SessionStore;

use crate::config::Config;
use crate::exec::SandboxManager;
use crate::mcp::McpRegistry;
use crate::tools::index::WorkspaceIndex;

/// Everything a tool handler may need, threaded through every execution.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub config: Arc<Config>,
    pub store: SessionStore,
    pub sandbox: Arc<SandboxManager>,
    pub mcp: Arc<McpRegistry>,
    pub index: Arc<dyn WorkspaceIndex>,
    pub http: reqwest::Client,
}

impl ToolContext {
    pub fn workspace_root(&self) -> &std::path::Path {
        &self.config.workspace_root
    }
}
