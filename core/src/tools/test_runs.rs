use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;

use crate::exec::SandboxMode;
use crate::exec::runner;
use crate::exec::runner::RunRequest;
use crate::tools::context::ToolContext;
use crate::tools::registry::ToolHandler;
use crate::tools::web::truncate_to_char_boundary;

const OUTPUT_LIMIT: usize = 64 * 1024;

/// Run the test command through the subprocess runner (sandbox-eligible)
/// and persist the outcome for later inspection.
pub struct TestRunTool;

#[async_trait]
impl ToolHandler for TestRunTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let command = call
            .string_arg(&["command", "cmd"])
            .or_else(|| ctx.config.policy.git.test_command.clone())
            .ok_or_else(|| anyhow!("no test command given or configured"))?;

        let request = RunRequest {
            command: command.clone(),
            cwd: Some(ctx.workspace_root().to_path_buf()),
            timeout_ms: call.arguments.get("timeout_ms").and_then(Value::as_u64),
            shell: true,
            ..Default::default()
        };
        let request = if ctx.sandbox.should_sandbox(SandboxMode::Auto) {
            ctx.sandbox.wrap(request, &ctx.session_id)?
        } else {
            request
        };
        let outcome = runner::run_process(request).await?;

        let mut output = outcome.stdout.clone();
        if !outcome.stderr.is_empty() {
            output.push('\n');
            output.push_str(&outcome.stderr);
        }
        truncate_to_char_boundary(&mut output, OUTPUT_LIMIT);

        ctx.store
            .record_test_run(
                &format!("run_{}", Uuid::new_v4().simple()),
                Some(&ctx.session_id),
                &command,
                outcome.exit_code,
                &output,
                outcome.duration_ms as i64,
            )
            .await?;

        let passed = outcome.exit_code == Some(0) && !outcome.timed_out;
        let body = json!({
            "command": command,
            "passed": passed,
            "exit_code": outcome.exit_code,
            "duration_ms": outcome.duration_ms,
            "timed_out": outcome.timed_out,
            "output": output,
        });
        let mut result = ToolResult::success(body.to_string());
        if !passed {
            result.ok = false;
            result.status = 422;
        }
        Ok(result)
    }
}

/// Recent test runs, newest first.
pub struct TestHistoryTool;

#[async_trait]
impl ToolHandler for TestHistoryTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let limit = call
            .arguments
            .get("limit")
            .and_then(Value::as_i64)
            .unwrap_or(10)
            .clamp(1, 100);
        let runs = ctx.store.list_test_runs(limit).await?;
        let listing: Vec<Value> = runs
            .iter()
            .map(|run| {
                json!({
                    "id": run.id,
                    "command": run.command,
                    "exit_code": run.exit_code,
                    "duration_ms": run.duration_ms,
                    "created_at": run.created_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(ToolResult::success(json!(listing).to_string()))
    }
}

/// Aggregate pass/fail counts over recent runs.
pub struct TestSummaryTool;

#[async_trait]
impl ToolHandler for TestSummaryTool {
    async fn handle(&self, _call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let runs = ctx.store.list_test_runs(100).await?;
        let total = runs.len();
        let passed = runs.iter().filter(|run| run.exit_code == Some(0)).count();
        let body = json!({
            "total": total,
            "passed": passed,
            "failed": total - passed,
            "last_run": runs.first().map(|run| run.created_at.to_rfc3339()),
        });
        Ok(ToolResult::success(body.to_string()))
    }
}
