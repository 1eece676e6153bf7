use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;

use crate::tools::context::ToolContext;
use crate::tools::registry::ToolHandler;

pub const TASK_TOOL_NAMES: &[&str] = &[
    "workspace_task_create",
    "workspace_task_get",
    "workspace_task_update",
    "workspace_task_set_status",
    "workspace_task_delete",
    "workspace_tasks_list",
];

/// CRUD over the task table; one handler per the whole family.
pub struct TaskTool;

#[async_trait]
impl ToolHandler for TaskTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let store = &ctx.store;
        match call.name.as_str() {
            "workspace_task_create" => {
                let title = call
                    .string_arg(&["title", "name"])
                    .ok_or_else(|| anyhow!("missing title argument"))?;
                let description = call
                    .string_arg(&["description", "body"])
                    .unwrap_or_default();
                let id = format!("task_{}", Uuid::new_v4().simple());
                let task = store
                    .create_task(&id, Some(&ctx.session_id), &title, &description)
                    .await?;
                Ok(ToolResult::success(serde_json::to_string(&task)?))
            }
            "workspace_task_get" => {
                let id = required_id(call)?;
                let task = store
                    .get_task(&id)
                    .await?
                    .ok_or_else(|| anyhow!("no task {id:?}"))?;
                Ok(ToolResult::success(serde_json::to_string(&task)?))
            }
            "workspace_task_update" => {
                let id = required_id(call)?;
                let title = call.string_arg(&["title", "name"]);
                let description = call.string_arg(&["description", "body"]);
                let task = store
                    .update_task(&id, title.as_deref(), description.as_deref())
                    .await?
                    .ok_or_else(|| anyhow!("no task {id:?}"))?;
                Ok(ToolResult::success(serde_json::to_string(&task)?))
            }
            "workspace_task_set_status" => {
                let id = required_id(call)?;
                let status = call
                    .string_arg(&["status", "state"])
                    .ok_or_else(|| anyhow!("missing status argument"))?;
                let task = store
                    .set_task_status(&id, &status)
                    .await?
                    .ok_or_else(|| anyhow!("no task {id:?}"))?;
                Ok(ToolResult::success(serde_json::to_string(&task)?))
            }
            "workspace_task_delete" => {
                let id = required_id(call)?;
                let deleted = store.delete_task(&id).await?;
                Ok(ToolResult::success(json!({"deleted": deleted}).to_string()))
            }
            "workspace_tasks_list" => {
                let all = call
                    .arguments
                    .get("all")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let session = (!all).then_some(ctx.session_id.as_str());
                let tasks = store.list_tasks(session).await?;
                Ok(ToolResult::success(serde_json::to_string(&tasks)?))
            }
            other => Err(anyhow!("unknown task tool {other:?}")),
        }
    }
}

fn required_id(call: &ToolCall) -> anyhow::Result<String> {
    call.string_arg(&["id", "task_id"])
        .ok_or_else(|| anyhow!("missing task id"))
}
