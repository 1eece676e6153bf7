use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Anthropic-compatible `/v1/messages` request body.
///
/// Only the fields the proxy inspects are typed; everything else is kept in
/// `extra` so the request can be forwarded to the upstream provider without
/// dropping fields the proxy does not understand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    #[serde(
        default,
        alias = "sessionId",
        alias = "conversation_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Value,
}

impl Message {
    pub fn user(content: impl Into<Value>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<Value>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A tool advertised to the model. `input_schema` is advisory; the proxy
/// never validates arguments against it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One block of an Anthropic-style message. Unknown block types are carried
/// through untouched via the `Other` variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    #[serde(untagged)]
    Other(Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Anthropic-compatible assistant message, used for responses the proxy
/// synthesizes itself (budget exhaustion, limit notices). Upstream bodies
/// are forwarded as raw JSON and never re-encoded through this type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

impl MessagesResponse {
    /// Build a synthetic assistant message with a single text block.
    pub fn synthetic(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            content: vec![ContentBlock::text(text)],
            model: model.into(),
            stop_reason: Some(StopReason::EndTurn),
            stop_sequence: None,
            usage: Usage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_roundtrips_unknown_fields() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hello"}],
            "metadata": {"user_id": "u-1"},
            "stop_sequences": ["###"]
        });
        let req: MessagesRequest = serde_json::from_value(body.clone()).unwrap();
        assert_eq!(req.model, "m");
        assert_eq!(req.extra.get("metadata"), Some(&json!({"user_id": "u-1"})));
        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back.get("stop_sequences"), body.get("stop_sequences"));
    }

    #[test]
    fn session_id_aliases_resolve() {
        let req: MessagesRequest =
            serde_json::from_value(json!({"model": "m", "messages": [], "sessionId": "s-1"}))
                .unwrap();
        assert_eq!(req.session_id.as_deref(), Some("s-1"));
        let req: MessagesRequest =
            serde_json::from_value(json!({"model": "m", "messages": [], "conversation_id": "s-2"}))
                .unwrap();
        assert_eq!(req.session_id.as_deref(), Some("s-2"));
    }

    #[test]
    fn unknown_content_block_is_preserved() {
        let block: ContentBlock =
            serde_json::from_value(json!({"type": "thinking", "thinking": "hmm"})).unwrap();
        match &block {
            ContentBlock::Other(value) => {
                assert_eq!(value.get("type"), Some(&json!("thinking")));
            }
            other => panic!("expected Other, got {other:?}"),
        }
        let back = serde_json::to_value(&block).unwrap();
        assert_eq!(back, json!({"type": "thinking", "thinking": "hmm"}));
    }

    #[test]
    fn tool_use_block_parses() {
        let block: ContentBlock = serde_json::from_value(json!({
            "type": "tool_use",
            "id": "toolu_1",
            "name": "fs_read",
            "input": {"path": "README.md"}
        }))
        .unwrap();
        assert_eq!(
            block,
            ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "fs_read".to_string(),
                input: json!({"path": "README.md"}),
            }
        );
    }
}
