use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// A tool invocation extracted from an upstream assistant message.
///
/// `id` is stable for the lifetime of one request: it is taken from the
/// upstream object when present and generated otherwise, and tool-result
/// turns are correlated back to it. `raw` keeps the upstream object
/// untouched for logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub raw: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            raw: Value::Null,
        }
    }

    /// First string value among the given argument keys, trimmed.
    pub fn string_arg(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| {
            self.arguments
                .get(*key)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

/// Normalized output of executing (or denying) a tool call. Results become
/// tool-role turns in the session transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub ok: bool,
    pub status: u16,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            ok: true,
            status: 200,
            content: content.into(),
            metadata: Map::new(),
            error: None,
        }
    }

    pub fn failure(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        let content = serde_json::json!({"error": code, "message": message}).to_string();
        Self {
            ok: false,
            status,
            content,
            metadata: Map::new(),
            error: Some(ToolError { code, message }),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn failure_embeds_error_in_content() {
        let result = ToolResult::failure(403, "git_push_disabled", "push is disabled");
        assert!(!result.ok);
        assert_eq!(result.status, 403);
        let content: Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(content["error"], json!("git_push_disabled"));
    }

    #[test]
    fn string_arg_accepts_synonyms() {
        let mut args = Map::new();
        args.insert("file_path".to_string(), json!("src/main.rs"));
        let call = ToolCall::new("c1", "fs_read", args);
        assert_eq!(
            call.string_arg(&["path", "file", "file_path"]),
            Some("src/main.rs".to_string())
        );
        assert_eq!(call.string_arg(&["missing"]), None);
    }
}
