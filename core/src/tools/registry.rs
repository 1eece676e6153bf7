use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::warn;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolError;
use overpass_protocol::ToolResult;

use crate::tools::context::ToolContext;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult>;
}

struct RegistryInner {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    lowercase: HashMap<String, String>,
    aliases: HashMap<String, String>,
}

/// Named tool handlers with alias resolution and tolerant payload
/// normalization. Registration happens at startup (built-ins) and after
/// boot (remote MCP tools); execution read-locks only.
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                handlers: HashMap::new(),
                lowercase: HashMap::new(),
                aliases: HashMap::new(),
            }),
        }
    }

    pub fn register(&self, name: &str, handler: Arc<dyn ToolHandler>) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        if inner.handlers.insert(name.to_string(), handler).is_some() {
            warn!("overwriting handler for tool {name}");
        }
        inner
            .lowercase
            .insert(name.to_ascii_lowercase(), name.to_string());
    }

    /// Common client synonyms; aliases are case-folded before lookup.
    pub fn register_alias(&self, alias: &str, canonical: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner
                .aliases
                .insert(alias.to_ascii_lowercase(), canonical.to_string());
        }
    }

    /// Resolution order: exact name, lowercase shadow, alias table.
    pub fn resolve(&self, name: &str) -> Option<(String, Arc<dyn ToolHandler>)> {
        let inner = self.inner.read().ok()?;
        if let Some(handler) = inner.handlers.get(name) {
            return Some((name.to_string(), Arc::clone(handler)));
        }
        let lowered = name.to_ascii_lowercase();
        if let Some(canonical) = inner.lowercase.get(&lowered) {
            let handler = inner.handlers.get(canonical)?;
            return Some((canonical.clone(), Arc::clone(handler)));
        }
        if let Some(canonical) = inner.aliases.get(&lowered) {
            let handler = inner.handlers.get(canonical)?;
            return Some((canonical.clone(), Arc::clone(handler)));
        }
        None
    }

    pub fn canonical_name(&self, name: &str) -> Option<String> {
        self.resolve(name).map(|(canonical, _)| canonical)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let mut names: Vec<String> = inner.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute a call. Never returns an error: unregistered tools become a
    /// 404 result, handler failures a 500 result, and the loop continues.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some((canonical, handler)) = self.resolve(&call.name) else {
            return ToolResult::failure(
                404,
                "tool_not_found",
                format!("no tool registered under {:?}", call.name),
            );
        };
        // Handlers see the canonical name, not whatever alias the model used.
        let mut call = call.clone();
        call.name = canonical.clone();
        match handler.handle(&call, ctx).await {
            Ok(result) => result,
            Err(err) => {
                warn!("tool {canonical} failed: {err:#}");
                let message = err.to_string();
                let content = json!({
                    "error": "tool_execution_failed",
                    "tool": canonical,
                    "message": message,
                })
                .to_string();
                ToolResult {
                    ok: false,
                    status: 500,
                    content,
                    metadata: Map::new(),
                    error: Some(ToolError {
                        code: "tool_execution_failed".to_string(),
                        message,
                    }),
                }
            }
        }
    }
}

/// Normalize an upstream tool-call object into a [`ToolCall`].
///
/// Tolerates both the Anthropic `tool_use` shape (`id`/`name`/`input`) and
/// the chat-completions shape (`function.name` with stringified
/// `function.arguments`). Invalid argument JSON yields an empty mapping; a
/// call id is assigned when the upstream provides none.
pub fn normalize_tool_call(raw: &Value) -> ToolCall {
    let id = raw
        .get("id")
        .or_else(|| raw.get("tool_use_id"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));

    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| {
            raw.get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
        })
        .unwrap_or_default()
        .to_string();

    let arguments_value = raw
        .get("input")
        .or_else(|| raw.get("arguments"))
        .or_else(|| raw.get("function").and_then(|f| f.get("arguments")))
        .cloned()
        .unwrap_or(Value::Null);

    let arguments = normalize_arguments(arguments_value);

    ToolCall {
        id,
        name,
        arguments,
        raw: raw.clone(),
    }
}

/// Arguments arrive either structured or as a JSON string.
pub fn normalize_arguments(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                warn!("tool arguments decoded to non-object {other}; using empty mapping");
                Map::new()
            }
            Err(err) => {
                warn!("invalid tool argument JSON ({err}); using empty mapping");
                Map::new()
            }
        },
        Value::Null => Map::new(),
        other => {
            warn!("unsupported tool argument payload {other}; using empty mapping");
            Map::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn handle(&self, call: &ToolCall, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::success(format!("echo:{}", call.id)))
        }
    }

    #[test]
    fn resolution_prefers_exact_then_lowercase_then_alias() {
        let registry = ToolRegistry::new();
        registry.register("fs_read", Arc::new(EchoTool));
        registry.register_alias("cat", "fs_read");

        assert_eq!(registry.canonical_name("fs_read").as_deref(), Some("fs_read"));
        assert_eq!(registry.canonical_name("FS_READ").as_deref(), Some("fs_read"));
        assert_eq!(registry.canonical_name("Cat").as_deref(), Some("fs_read"));
        assert_eq!(registry.canonical_name("nope"), None);
    }

    #[test]
    fn normalizes_anthropic_shape() {
        let call = normalize_tool_call(&json!({
            "id": "toolu_1",
            "name": "fs_read",
            "input": {"path": "README.md"}
        }));
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.name, "fs_read");
        assert_eq!(call.arguments["path"], json!("README.md"));
    }

    #[test]
    fn normalizes_openai_shape_with_string_arguments() {
        let call = normalize_tool_call(&json!({
            "id": "call_9",
            "function": {"name": "shell", "arguments": "{\"command\":\"ls\"}"}
        }));
        assert_eq!(call.name, "shell");
        assert_eq!(call.arguments["command"], json!("ls"));
    }

    #[test]
    fn invalid_argument_json_yields_empty_mapping() {
        let call = normalize_tool_call(&json!({
            "id": "c",
            "name": "shell",
            "arguments": "{not json"
        }));
        assert!(call.arguments.is_empty());
    }

    #[test]
    fn missing_id_is_assigned() {
        let call = normalize_tool_call(&json!({"name": "shell", "input": {}}));
        assert!(call.id.starts_with("call_"));
        let other = normalize_tool_call(&json!({"name": "shell", "input": {}}));
        assert_ne!(call.id, other.id);
    }
}
