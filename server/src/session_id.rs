use axum::http::HeaderMap;
use serde_json::Value;

/// Header names recognized for session binding, in resolution order.
pub const SESSION_HEADERS: &[&str] = &[
    "x-session-id",
    "x-claude-session-id",
    "x-claude-session",
    "x-claude-conversation-id",
    "anthropic-session-id",
];

/// Body fields recognized for session binding, in resolution order.
const SESSION_BODY_FIELDS: &[&str] = &["session_id", "sessionId", "conversation_id"];

/// Resolve the session id from headers then body fields. Returns the id
/// and whether it was generated (no recognized source present).
pub fn resolve_session_id(headers: &HeaderMap, body: Option<&Value>) -> (String, bool) {
    for name in SESSION_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok())
            && !value.trim().is_empty()
        {
            return (value.trim().to_string(), false);
        }
    }
    if let Some(body) = body {
        for field in SESSION_BODY_FIELDS {
            if let Some(value) = body.get(*field).and_then(Value::as_str)
                && !value.trim().is_empty()
            {
                return (value.trim().to_string(), false);
            }
        }
    }
    (uuid::Uuid::new_v4().to_string(), true)
}

/// Header-only resolution for endpoints without a body.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    for name in SESSION_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok())
            && !value.trim().is_empty()
        {
            return Some(value.trim().to_string());
        }
    }
    None
}
