use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;

use crate::tools::context::ToolContext;
use crate::tools::registry::ToolHandler;

const PATH_KEYS: &[&str] = &["path", "file", "file_path", "filename"];
const CONTENT_KEYS: &[&str] = &["content", "text", "data"];

/// Resolve a user-supplied path against the workspace root, failing closed
/// on anything that would escape it. Purely lexical: `..` components are
/// rejected rather than resolved, and absolute paths must already sit
/// inside the root.
pub fn resolve_workspace_path(root: &Path, raw: &str) -> anyhow::Result<PathBuf> {
    if raw.is_empty() {
        bail!("path is empty");
    }
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    bail!("path {raw:?} escapes the workspace root");
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }

    let root_normalized: PathBuf = root
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if !normalized.starts_with(&root_normalized) {
        bail!("path {raw:?} escapes the workspace root");
    }
    Ok(normalized)
}

fn workspace_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

pub struct FsReadTool;

#[async_trait]
impl ToolHandler for FsReadTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let raw = call
            .string_arg(PATH_KEYS)
            .ok_or_else(|| anyhow!("missing path argument"))?;
        let path = resolve_workspace_path(ctx.workspace_root(), &raw)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {raw}"))?;
        Ok(ToolResult::success(content)
            .with_metadata("path", json!(workspace_relative(ctx.workspace_root(), &path))))
    }
}

pub struct FsWriteTool;

#[async_trait]
impl ToolHandler for FsWriteTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let raw = call
            .string_arg(PATH_KEYS)
            .ok_or_else(|| anyhow!("missing path argument"))?;
        let content = call
            .arguments
            .iter()
            .find(|(key, _)| CONTENT_KEYS.contains(&key.as_str()))
            .and_then(|(_, value)| value.as_str())
            .unwrap_or_default()
            .to_string();

        let path = resolve_workspace_path(ctx.workspace_root(), &raw)?;
        let before = tokio::fs::read_to_string(&path).await.ok();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &content)
            .await
            .with_context(|| format!("failed to write {raw}"))?;

        let relative = workspace_relative(ctx.workspace_root(), &path);
        record_edit(ctx, &relative, before.as_deref(), Some(&content), "fs_write").await?;

        Ok(
            ToolResult::success(format!("wrote {} bytes to {relative}", content.len()))
                .with_metadata("path", json!(relative)),
        )
    }
}

pub struct EditPatchTool;

#[async_trait]
impl ToolHandler for EditPatchTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let patch = call
            .string_arg(&["patch", "diff", "content"])
            .ok_or_else(|| anyhow!("missing patch argument"))?;

        let files = parse_unified_patch(&patch)?;
        if files.is_empty() {
            bail!("patch contains no file sections");
        }

        let mut touched = Vec::new();
        for file in &files {
            let path = resolve_workspace_path(ctx.workspace_root(), &file.path)?;
            let before = tokio::fs::read_to_string(&path).await.ok();
            let after = apply_hunks(before.as_deref().unwrap_or(""), &file.hunks)
                .with_context(|| format!("failed to apply patch to {}", file.path))?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &after).await?;

            let relative = workspace_relative(ctx.workspace_root(), &path);
            record_edit(ctx, &relative, before.as_deref(), Some(&after), "edit_patch").await?;
            touched.push(relative);
        }

        Ok(
            ToolResult::success(format!("patched {}", touched.join(", ")))
                .with_metadata("files", json!(touched)),
        )
    }
}

pub(crate) async fn record_edit(
    ctx: &ToolContext,
    path: &str,
    before: Option<&str>,
    after: Option<&str>,
    tool: &str,
) -> anyhow::Result<()> {
    ctx.store
        .record_edit(
            &format!("edit_{}", Uuid::new_v4().simple()),
            Some(&ctx.session_id),
            path,
            before,
            after,
            tool,
        )
        .await
}

#[derive(Debug, PartialEq)]
pub(crate) struct PatchFile {
    pub path: String,
    pub hunks: Vec<Hunk>,
}

#[derive(Debug, PartialEq)]
pub(crate) struct Hunk {
    pub old_start: usize,
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// Parse a unified diff into per-file hunk lists. The target path is taken
/// from the `+++` header with any `a/`/`b/` prefix stripped.
pub(crate) fn parse_unified_patch(patch: &str) -> anyhow::Result<Vec<PatchFile>> {
    let mut files: Vec<PatchFile> = Vec::new();
    let mut current: Option<PatchFile> = None;

    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("+++ ") {
            let path = rest
                .split_whitespace()
                .next()
                .unwrap_or(rest)
                .trim_start_matches("b/")
                .trim_start_matches("a/")
                .to_string();
            if path == "/dev/null" {
                bail!("patch deletes files, which is not supported");
            }
            if let Some(file) = current.take() {
                files.push(file);
            }
            current = Some(PatchFile {
                path,
                hunks: Vec::new(),
            });
        } else if let Some(rest) = line.strip_prefix("@@") {
            let file = current
                .as_mut()
                .ok_or_else(|| anyhow!("hunk header before file header"))?;
            let old_start = parse_hunk_old_start(rest)?;
            file.hunks.push(Hunk {
                old_start,
                lines: Vec::new(),
            });
        } else if let Some(file) = current.as_mut()
            && let Some(hunk) = file.hunks.last_mut()
        {
            match line.chars().next() {
                Some('+') => hunk.lines.push(HunkLine::Add(line[1..].to_string())),
                Some('-') => hunk.lines.push(HunkLine::Remove(line[1..].to_string())),
                Some(' ') => hunk.lines.push(HunkLine::Context(line[1..].to_string())),
                // "\ No newline at end of file" and blank separators.
                _ => {}
            }
        }
    }
    if let Some(file) = current.take() {
        files.push(file);
    }
    Ok(files)
}

fn parse_hunk_old_start(header: &str) -> anyhow::Result<usize> {
    // Header shape: " -12,4 +15,6 @@ optional context".
    let old = header
        .trim_start()
        .strip_prefix('-')
        .ok_or_else(|| anyhow!("malformed hunk header {header:?}"))?;
    let digits: String = old.chars().take_while(char::is_ascii_digit).collect();
    digits
        .parse()
        .with_context(|| format!("malformed hunk header {header:?}"))
}

/// Apply hunks to the original text. Each hunk is anchored at its declared
/// old-start line; context and removal lines must match exactly.
pub(crate) fn apply_hunks(original: &str, hunks: &[Hunk]) -> anyhow::Result<String> {
    let lines: Vec<&str> = original.lines().collect();
    let mut output: Vec<String> = Vec::new();
    let mut cursor = 0usize;

    for hunk in hunks {
        let start = hunk.old_start.saturating_sub(1);
        if start < cursor {
            bail!("hunks overlap or are out of order");
        }
        output.extend(lines[cursor..start.min(lines.len())].iter().map(|s| s.to_string()));
        cursor = start.min(lines.len());

        for hunk_line in &hunk.lines {
            match hunk_line {
                HunkLine::Context(expected) => {
                    let actual = lines
                        .get(cursor)
                        .ok_or_else(|| anyhow!("context ran past end of file"))?;
                    if actual != expected {
                        bail!("context mismatch at line {}: {actual:?} != {expected:?}", cursor + 1);
                    }
                    output.push(expected.clone());
                    cursor += 1;
                }
                HunkLine::Remove(expected) => {
                    let actual = lines
                        .get(cursor)
                        .ok_or_else(|| anyhow!("removal ran past end of file"))?;
                    if actual != expected {
                        bail!("removal mismatch at line {}: {actual:?} != {expected:?}", cursor + 1);
                    }
                    cursor += 1;
                }
                HunkLine::Add(added) => output.push(added.clone()),
            }
        }
    }
    output.extend(lines[cursor.min(lines.len())..].iter().map(|s| s.to_string()));

    let mut result = output.join("\n");
    if original.ends_with('\n') || original.is_empty() {
        result.push('\n');
    }
    Ok(result)
}
