use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;

use crate::tools::context::ToolContext;
use crate::tools::registry::ToolHandler;
use crate::tools::workspace::record_edit;
use crate::tools::workspace::resolve_workspace_path;

/// List recorded before/after snapshots, optionally for one path.
pub struct EditHistoryTool;

#[async_trait]
impl ToolHandler for EditHistoryTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let path = call.string_arg(&["path", "file"]);
        let limit = call
            .arguments
            .get("limit")
            .and_then(Value::as_i64)
            .unwrap_or(20)
            .clamp(1, 200);
        let edits = ctx.store.list_edits(path.as_deref(), limit).await?;
        let listing: Vec<Value> = edits
            .iter()
            .map(|edit| {
                json!({
                    "id": edit.id,
                    "path": edit.path,
                    "tool": edit.tool,
                    "created_at": edit.created_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(ToolResult::success(json!(listing).to_string()))
    }
}

/// Restore the before-snapshot of a recorded edit. The revert itself is
/// recorded, so it can be reverted in turn.
pub struct EditRevertTool;

#[async_trait]
impl ToolHandler for EditRevertTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let id = call
            .string_arg(&["id", "edit_id"])
            .ok_or_else(|| anyhow!("missing edit id"))?;
        let edit = ctx
            .store
            .get_edit(&id)
            .await?
            .ok_or_else(|| anyhow!("no edit recorded under {id:?}"))?;

        let path = resolve_workspace_path(ctx.workspace_root(), &edit.path)?;
        let current = tokio::fs::read_to_string(&path).await.ok();
        match &edit.before_content {
            Some(before) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, before).await?;
            }
            // The edit created the file; reverting removes it.
            None => {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }
        record_edit(
            ctx,
            &edit.path,
            current.as_deref(),
            edit.before_content.as_deref(),
            "workspace_edit_revert",
        )
        .await?;

        Ok(ToolResult::success(format!("reverted {} to edit {id}", edit.path)))
    }
}
