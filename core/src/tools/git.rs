use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;

use crate::exec::runner;
use crate::exec::runner::RunRequest;
use crate::tools::context::ToolContext;
use crate::tools::registry::ToolHandler;

/// All `workspace_git_*` and diff/log tools go through one handler; each
/// canonical name maps to a fixed `git` argument list. The policy engine
/// has already gated push/pull/commit by the time execution starts.
pub struct GitTool;

pub const GIT_TOOL_NAMES: &[&str] = &[
    "workspace_git_status",
    "workspace_git_stage",
    "workspace_git_unstage",
    "workspace_git_commit",
    "workspace_git_push",
    "workspace_git_pull",
    "workspace_git_merge",
    "workspace_git_rebase",
    "workspace_git_checkout",
    "workspace_git_branch",
    "workspace_git_branches",
    "workspace_git_stash",
    "workspace_git_conflicts",
    "workspace_diff",
    "workspace_diff_summary",
    "workspace_diff_review",
    "workspace_release_notes",
];

fn paths_arg(call: &ToolCall) -> Vec<String> {
    match call.arguments.get("paths") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(path)) => vec![path.clone()],
        _ => call
            .string_arg(&["path", "file"])
            .map(|p| vec![p])
            .unwrap_or_default(),
    }
}

fn git_args_for(name: &str, call: &ToolCall, autostash: bool) -> anyhow::Result<Vec<String>> {
    let mut args: Vec<String> = match name {
        "workspace_git_status" => vec!["status".into(), "--porcelain=v1".into(), "--branch".into()],
        "workspace_git_stage" => {
            let mut args = vec!["add".into()];
            let paths = paths_arg(call);
            if paths.is_empty() {
                args.push("-A".into());
            } else {
                args.push("--".into());
                args.extend(paths);
            }
            args
        }
        "workspace_git_unstage" => {
            let mut args = vec!["reset".into(), "HEAD".into(), "--".into()];
            let paths = paths_arg(call);
            if paths.is_empty() {
                args.push(".".into());
            } else {
                args.extend(paths);
            }
            args
        }
        "workspace_git_commit" => {
            let message = call
                .string_arg(&["message", "msg", "commit_message"])
                .ok_or_else(|| anyhow!("missing commit message"))?;
            vec!["commit".into(), "-m".into(), message]
        }
        "workspace_git_push" => {
            let mut args = vec!["push".into()];
            if let Some(remote) = call.string_arg(&["remote"]) {
                args.push(remote);
                if let Some(branch) = call.string_arg(&["branch"]) {
                    args.push(branch);
                }
            }
            args
        }
        "workspace_git_pull" => {
            let mut args = vec!["pull".into()];
            if autostash {
                args.push("--autostash".into());
            }
            args
        }
        "workspace_git_merge" => {
            let branch = call
                .string_arg(&["branch", "ref", "target"])
                .ok_or_else(|| anyhow!("missing branch argument"))?;
            vec!["merge".into(), branch]
        }
        "workspace_git_rebase" => {
            let branch = call
                .string_arg(&["branch", "ref", "onto"])
                .ok_or_else(|| anyhow!("missing branch argument"))?;
            let mut args = vec!["rebase".into()];
            if autostash {
                args.push("--autostash".into());
            }
            args.push(branch);
            args
        }
        "workspace_git_checkout" => {
            let target = call
                .string_arg(&["ref", "branch", "target"])
                .ok_or_else(|| anyhow!("missing ref argument"))?;
            let mut args = vec!["checkout".into()];
            if call
                .arguments
                .get("create")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                args.push("-b".into());
            }
            args.push(target);
            args
        }
        "workspace_git_branch" => {
            let name = call
                .string_arg(&["name", "branch"])
                .ok_or_else(|| anyhow!("missing branch name"))?;
            vec!["branch".into(), name]
        }
        "workspace_git_branches" => {
            vec!["branch".into(), "--list".into(), "-a".into(), "-v".into()]
        }
        "workspace_git_stash" => {
            let action = call
                .string_arg(&["action", "subcommand"])
                .unwrap_or_else(|| "push".to_string());
            match action.as_str() {
                "push" | "pop" | "list" | "drop" | "apply" => vec!["stash".into(), action],
                other => return Err(anyhow!("unsupported stash action {other:?}")),
            }
        }
        "workspace_git_conflicts" => vec![
            "diff".into(),
            "--name-only".into(),
            "--diff-filter=U".into(),
        ],
        "workspace_diff" => {
            let mut args = vec!["diff".into()];
            if call
                .arguments
                .get("staged")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                args.push("--cached".into());
            }
            let paths = paths_arg(call);
            if !paths.is_empty() {
                args.push("--".into());
                args.extend(paths);
            }
            args
        }
        "workspace_diff_summary" => vec!["diff".into(), "--stat".into()],
        "workspace_diff_review" => vec!["diff".into(), "--numstat".into()],
        "workspace_release_notes" => {
            let range = call
                .string_arg(&["range", "since"])
                .unwrap_or_else(|| "HEAD~20..HEAD".to_string());
            vec![
                "log".into(),
                "--pretty=format:- %s (%h)".into(),
                "--no-merges".into(),
                range,
            ]
        }
        other => return Err(anyhow!("unknown git tool {other:?}")),
    };
    args.insert(0, "--no-pager".into());
    Ok(args)
}

#[async_trait]
impl ToolHandler for GitTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let args = git_args_for(&call.name, call, ctx.config.policy.git.autostash)?;
        let outcome = runner::run_process(RunRequest {
            command: "git".to_string(),
            args,
            cwd: Some(ctx.workspace_root().to_path_buf()),
            shell: false,
            ..Default::default()
        })
        .await?;

        let mut content = outcome.stdout.clone();
        if !outcome.stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&outcome.stderr);
        }

        let mut result = if outcome.exit_code == Some(0) {
            ToolResult::success(content)
        } else {
            let mut failed = ToolResult::success(content);
            failed.ok = false;
            failed.status = 422;
            failed
        };
        result = result.with_metadata("exit_code", json!(outcome.exit_code));
        Ok(result)
    }
}
