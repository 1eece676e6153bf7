use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use async_trait::async_trait;
use regex::Regex;
use regex::escape;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;

use crate::tools::context::ToolContext;
use crate::tools::registry::ToolHandler;

const DEFAULT_MAX_RESULTS: usize = 200;
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub path: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SymbolHit {
    pub path: String,
    pub line: usize,
    pub name: String,
    pub kind: String,
}

/// Seam to the repository indexer. The real indexer (tree-sitter backed) is
/// a collaborator; the filesystem implementation below is the default.
#[async_trait]
pub trait WorkspaceIndex: Send + Sync {
    async fn list(&self, prefix: Option<&str>, max: usize) -> anyhow::Result<Vec<String>>;
    async fn search(&self, pattern: &str, max: usize) -> anyhow::Result<Vec<SearchHit>>;
    async fn symbol_search(&self, query: &str, max: usize) -> anyhow::Result<Vec<SymbolHit>>;
    async fn symbol_references(&self, symbol: &str, max: usize) -> anyhow::Result<Vec<SearchHit>>;
    async fn goto_definition(&self, symbol: &str) -> anyhow::Result<Option<SymbolHit>>;
    async fn rebuild(&self) -> anyhow::Result<usize>;
    async fn project_summary(&self) -> anyhow::Result<Value>;
}

/// Regex-over-files index. Good enough to back the workspace tools without
/// the tree-sitter machinery.
pub struct FsIndex {
    root: PathBuf,
}

impl FsIndex {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn walk(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if !SKIPPED_DIRS.contains(&name.as_ref()) && !name.starts_with('.') {
                        stack.push(path);
                    }
                } else if file_type.is_file() {
                    let small_enough = entry
                        .metadata()
                        .map(|m| m.len() <= MAX_FILE_BYTES)
                        .unwrap_or(false);
                    if small_enough {
                        files.push(path);
                    }
                }
            }
        }
        files.sort();
        files
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    fn grep(&self, regex: &Regex, max: usize) -> Vec<SearchHit> {
        let mut hits = Vec::new();
        for path in self.walk() {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (index, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    hits.push(SearchHit {
                        path: self.relative(&path),
                        line: index + 1,
                        text: line.trim_end().to_string(),
                    });
                    if hits.len() >= max {
                        return hits;
                    }
                }
            }
        }
        hits
    }

    fn definitions(&self, query: &str, max: usize) -> anyhow::Result<Vec<SymbolHit>> {
        let pattern = format!(
            r"^\s*(?:pub\s+)?(fn|struct|enum|trait|impl|mod|class|def|function|const|static|type|interface)\s+({})",
            escape(query)
        );
        let regex = Regex::new(&pattern)?;
        let mut hits = Vec::new();
        for path in self.walk() {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (index, line) in content.lines().enumerate() {
                if let Some(captures) = regex.captures(line) {
                    hits.push(SymbolHit {
                        path: self.relative(&path),
                        line: index + 1,
                        name: captures
                            .get(2)
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_else(|| query.to_string()),
                        kind: captures
                            .get(1)
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_default(),
                    });
                    if hits.len() >= max {
                        return Ok(hits);
                    }
                }
            }
        }
        Ok(hits)
    }
}

#[async_trait]
impl WorkspaceIndex for FsIndex {
    async fn list(&self, prefix: Option<&str>, max: usize) -> anyhow::Result<Vec<String>> {
        let files = self.walk();
        let mut listed: Vec<String> = files
            .iter()
            .map(|path| self.relative(path))
            .filter(|relative| prefix.is_none_or(|p| relative.starts_with(p)))
            .collect();
        listed.truncate(max);
        Ok(listed)
    }

    async fn search(&self, pattern: &str, max: usize) -> anyhow::Result<Vec<SearchHit>> {
        let regex = Regex::new(pattern).or_else(|_| Regex::new(&escape(pattern)))?;
        Ok(self.grep(&regex, max))
    }

    async fn symbol_search(&self, query: &str, max: usize) -> anyhow::Result<Vec<SymbolHit>> {
        self.definitions(query, max)
    }

    async fn symbol_references(&self, symbol: &str, max: usize) -> anyhow::Result<Vec<SearchHit>> {
        let regex = Regex::new(&format!(r"\b{}\b", escape(symbol)))?;
        Ok(self.grep(&regex, max))
    }

    async fn goto_definition(&self, symbol: &str) -> anyhow::Result<Option<SymbolHit>> {
        Ok(self.definitions(symbol, 1)?.into_iter().next())
    }

    async fn rebuild(&self) -> anyhow::Result<usize> {
        Ok(self.walk().len())
    }

    async fn project_summary(&self) -> anyhow::Result<Value> {
        let files = self.walk();
        let mut by_extension: BTreeMap<String, usize> = BTreeMap::new();
        for path in &files {
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| "(none)".to_string());
            *by_extension.entry(ext).or_default() += 1;
        }
        Ok(json!({
            "root": self.root.display().to_string(),
            "files": files.len(),
            "by_extension": by_extension,
        }))
    }
}

fn max_results(call: &ToolCall) -> usize {
    call.arguments
        .get("limit")
        .or_else(|| call.arguments.get("max"))
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_RESULTS)
        .clamp(1, 2000)
}

/// One handler backs every indexer-facing tool; the canonical name selects
/// the operation.
pub struct IndexTool;

pub const INDEX_TOOL_NAMES: &[&str] = &[
    "workspace_list",
    "workspace_search",
    "workspace_symbol_search",
    "workspace_symbol_references",
    "workspace_goto_definition",
    "workspace_index_rebuild",
    "project_summary",
];

#[async_trait]
impl ToolHandler for IndexTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let index = &ctx.index;
        let max = max_results(call);
        let body = match call.name.as_str() {
            "workspace_list" => {
                let prefix = call.string_arg(&["prefix", "path", "dir"]);
                json!(index.list(prefix.as_deref(), max).await?)
            }
            "workspace_search" => {
                let pattern = call
                    .string_arg(&["pattern", "query", "q"])
                    .ok_or_else(|| anyhow!("missing pattern argument"))?;
                json!(index.search(&pattern, max).await?)
            }
            "workspace_symbol_search" => {
                let query = call
                    .string_arg(&["symbol", "query", "name"])
                    .ok_or_else(|| anyhow!("missing symbol argument"))?;
                json!(index.symbol_search(&query, max).await?)
            }
            "workspace_symbol_references" => {
                let symbol = call
                    .string_arg(&["symbol", "name"])
                    .ok_or_else(|| anyhow!("missing symbol argument"))?;
                json!(index.symbol_references(&symbol, max).await?)
            }
            "workspace_goto_definition" => {
                let symbol = call
                    .string_arg(&["symbol", "name"])
                    .ok_or_else(|| anyhow!("missing symbol argument"))?;
                json!(index.goto_definition(&symbol).await?)
            }
            "workspace_index_rebuild" => {
                let files = index.rebuild().await?;
                json!({"indexed_files": files})
            }
            "project_summary" => index.project_summary().await?,
            other => return Err(anyhow!("unknown index tool {other:?}")),
        };
        Ok(ToolResult::success(body.to_string()))
    }
}
