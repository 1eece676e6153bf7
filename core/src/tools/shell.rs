use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;

use crate::exec::SandboxMode;
use crate::exec::runner;
use crate::exec::runner::RunRequest;
use crate::policy::normalize_shell_command;
use crate::tools::context::ToolContext;
use crate::tools::registry::ToolHandler;

fn sandbox_mode(call: &ToolCall) -> SandboxMode {
    call.string_arg(&["sandbox"])
        .map(|raw| SandboxMode::parse(&raw))
        .unwrap_or_default()
}

fn timeout_arg(call: &ToolCall) -> Option<u64> {
    call.arguments
        .get("timeout_ms")
        .or_else(|| call.arguments.get("timeout"))
        .and_then(Value::as_u64)
}

async fn run_maybe_sandboxed(
    request: RunRequest,
    mode: SandboxMode,
    ctx: &ToolContext,
) -> anyhow::Result<ToolResult> {
    let request = if ctx.sandbox.should_sandbox(mode) {
        ctx.sandbox.wrap(request, &ctx.session_id)?
    } else {
        request
    };
    let outcome = runner::run_process(request).await?;

    let mut content = outcome.stdout.clone();
    if !outcome.stderr.is_empty() {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&outcome.stderr);
    }
    if outcome.timed_out {
        content.push_str("\n[process timed out]");
    }

    let ok = !outcome.timed_out && outcome.exit_code == Some(0);
    let mut result = if ok {
        ToolResult::success(content)
    } else {
        let mut failed = ToolResult::success(content);
        failed.ok = false;
        failed.status = 422;
        failed
    };
    result = result
        .with_metadata("exit_code", json!(outcome.exit_code))
        .with_metadata("duration_ms", json!(outcome.duration_ms))
        .with_metadata("timed_out", json!(outcome.timed_out));
    if outcome.stdout_overflow || outcome.stderr_overflow {
        result = result.with_metadata("truncated", json!(true));
    }
    Ok(result)
}

/// Run a shell command inside the workspace, optionally in the sandbox.
pub struct ShellTool;

#[async_trait]
impl ToolHandler for ShellTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let command = normalize_shell_command(call);
        if command.is_empty() {
            return Err(anyhow!("missing command argument"));
        }
        let request = RunRequest {
            command,
            cwd: Some(ctx.workspace_root().to_path_buf()),
            timeout_ms: timeout_arg(call),
            shell: true,
            ..Default::default()
        };
        run_maybe_sandboxed(request, sandbox_mode(call), ctx).await
    }
}

/// Execute a python snippet by piping it to the interpreter's stdin.
pub struct PythonExecTool;

#[async_trait]
impl ToolHandler for PythonExecTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let code = call
            .string_arg(&["code", "script", "source"])
            .ok_or_else(|| anyhow!("missing code argument"))?;
        let request = RunRequest {
            command: "python3".to_string(),
            args: vec!["-".to_string()],
            cwd: Some(ctx.workspace_root().to_path_buf()),
            input: Some(code),
            timeout_ms: timeout_arg(call),
            shell: false,
            ..Default::default()
        };
        run_maybe_sandboxed(request, sandbox_mode(call), ctx).await
    }
}
