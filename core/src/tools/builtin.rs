use std::sync::Arc;

use crate::mcp::RemoteTool;
use crate::tools::edits::EditHistoryTool;
use crate::tools::edits::EditRevertTool;
use crate::tools::git::GIT_TOOL_NAMES;
use crate::tools::git::GitTool;
use crate::tools::index::INDEX_TOOL_NAMES;
use crate::tools::index::IndexTool;
use crate::tools::mcp_tools::McpCallTool;
use crate::tools::mcp_tools::McpProxyTool;
use crate::tools::mcp_tools::McpServersTool;
use crate::tools::mcp_tools::SandboxSessionsTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::shell::PythonExecTool;
use crate::tools::shell::ShellTool;
use crate::tools::tasks::TASK_TOOL_NAMES;
use crate::tools::tasks::TaskTool;
use crate::tools::test_runs::TestHistoryTool;
use crate::tools::test_runs::TestRunTool;
use crate::tools::test_runs::TestSummaryTool;
use crate::tools::web::WebFetchTool;
use crate::tools::web::WebSearchTool;
use crate::tools::workspace::EditPatchTool;
use crate::tools::workspace::FsReadTool;
use crate::tools::workspace::FsWriteTool;

/// Register every built-in tool plus the common client synonyms.
pub fn register_builtin_tools(registry: &ToolRegistry) {
    registry.register("fs_read", Arc::new(FsReadTool));
    registry.register("fs_write", Arc::new(FsWriteTool));
    registry.register("edit_patch", Arc::new(EditPatchTool));

    registry.register("shell", Arc::new(ShellTool));
    registry.register("python_exec", Arc::new(PythonExecTool));

    let git = Arc::new(GitTool);
    for name in GIT_TOOL_NAMES {
        registry.register(name, git.clone());
    }

    let index = Arc::new(IndexTool);
    for name in INDEX_TOOL_NAMES {
        registry.register(name, index.clone());
    }

    registry.register("workspace_edit_history", Arc::new(EditHistoryTool));
    registry.register("workspace_edit_revert", Arc::new(EditRevertTool));

    let tasks = Arc::new(TaskTool);
    for name in TASK_TOOL_NAMES {
        registry.register(name, tasks.clone());
    }

    registry.register("workspace_test_run", Arc::new(TestRunTool));
    registry.register("workspace_test_history", Arc::new(TestHistoryTool));
    registry.register("workspace_test_summary", Arc::new(TestSummaryTool));

    registry.register("web_search", Arc::new(WebSearchTool));
    registry.register("web_fetch", Arc::new(WebFetchTool));

    registry.register("workspace_mcp_servers", Arc::new(McpServersTool));
    registry.register("workspace_mcp_call", Arc::new(McpCallTool));
    registry.register("workspace_sandbox_sessions", Arc::new(SandboxSessionsTool));

    for (alias, canonical) in [
        ("bash", "shell"),
        ("sh", "shell"),
        ("exec", "shell"),
        ("run_command", "shell"),
        ("python", "python_exec"),
        ("read_file", "fs_read"),
        ("cat", "fs_read"),
        ("write_file", "fs_write"),
        ("apply_patch", "edit_patch"),
        ("grep", "workspace_search"),
        ("search", "workspace_search"),
        ("ls", "workspace_list"),
        ("list_files", "workspace_list"),
        ("git_status", "workspace_git_status"),
        ("git_commit", "workspace_git_commit"),
        ("git_diff", "workspace_diff"),
        ("websearch", "web_search"),
        ("webfetch", "web_fetch"),
    ] {
        registry.register_alias(alias, canonical);
    }
}

/// Register proxies for tools discovered on MCP servers.
pub fn register_remote_tools(registry: &ToolRegistry, tools: &[RemoteTool]) {
    for tool in tools {
        registry.register(
            &tool.local_name,
            Arc::new(McpProxyTool {
                server_id: tool.server_id.clone(),
                tool_name: tool.tool_name.clone(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn every_documented_tool_is_registered() {
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry);
        let names = registry.tool_names();
        for expected in [
            "fs_read",
            "fs_write",
            "edit_patch",
            "shell",
            "python_exec",
            "workspace_git_status",
            "workspace_git_push",
            "workspace_diff",
            "workspace_release_notes",
            "workspace_list",
            "workspace_search",
            "workspace_symbol_search",
            "workspace_goto_definition",
            "workspace_edit_history",
            "workspace_edit_revert",
            "workspace_task_create",
            "workspace_tasks_list",
            "workspace_test_run",
            "workspace_test_summary",
            "web_search",
            "web_fetch",
            "workspace_mcp_servers",
            "workspace_mcp_call",
            "workspace_sandbox_sessions",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn aliases_resolve_to_canonical_names() {
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry);
        assert_eq!(registry.canonical_name("bash").as_deref(), Some("shell"));
        assert_eq!(
            registry.canonical_name("grep").as_deref(),
            Some("workspace_search")
        );
        assert_eq!(registry.canonical_name("CAT").as_deref(), Some("fs_read"));
    }
}
