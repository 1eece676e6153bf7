use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

/// The request fields that participate in the cache key. Everything else
/// (session ids, headers, stream flags) never enters the key.
const KEY_FIELDS: &[&str] = &[
    "model",
    "input",
    "messages",
    "tools",
    "tool_choice",
    "temperature",
    "top_p",
    "max_tokens",
];

struct CacheEntry {
    value: Value,
    created_at: Instant,
    expires_at: Option<Instant>,
}

/// Content-addressed LRU cache of terminal (non-tool-use) model responses.
///
/// Entries are ordered most-recently-used at the tail; lookups move the hit
/// to the tail and lazily drop expired entries. Reads and writes both deep
/// clone, so callers can never alias the stored value.
pub struct PromptCache {
    entries: Mutex<Vec<(String, CacheEntry)>>,
    ttl: Option<Duration>,
    max_entries: usize,
    enabled: bool,
}

impl PromptCache {
    pub fn new(enabled: bool, ttl_ms: u64, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            ttl: (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms)),
            max_entries: max_entries.max(1),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// SHA-256 over the canonical serialization of the key fields.
    pub fn key_for(request: &Value) -> String {
        let mut canonical = String::new();
        canonical.push('{');
        let mut first = true;
        for field in KEY_FIELDS {
            let Some(value) = request.get(*field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if !first {
                canonical.push(',');
            }
            first = false;
            canonical.push_str(&format!("{:?}:", field));
            write_canonical(&mut canonical, value);
        }
        canonical.push('}');

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Whether a successful response may enter the cache: HTTP 200 and no
    /// tool calls in the first choice / content. This guarantees a cached
    /// response is always safe to return without replaying tools.
    pub fn admits(status: u16, response: &Value) -> bool {
        if status != 200 {
            return false;
        }
        !response_has_tool_calls(response)
    }

    pub fn lookup(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().ok()?;
        entries.retain(|(_, entry)| entry.expires_at.is_none_or(|at| at > now));
        let index = entries.iter().position(|(k, _)| k == key)?;
        let hit = entries.remove(index);
        let value = hit.1.value.clone();
        entries.push(hit);
        Some(value)
    }

    pub fn store(&self, key: String, value: &Value) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let entry = CacheEntry {
            value: value.clone(),
            created_at: now,
            expires_at: self.ttl.map(|ttl| now + ttl),
        };
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.retain(|(k, _)| k != &key);
        entries.push((key, entry));
        while entries.len() > self.max_entries {
            let (evicted, entry) = entries.remove(0);
            debug!(
                "evicting cache entry {evicted} after {:?}",
                entry.created_at.elapsed()
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonical JSON: object keys sorted recursively, array order preserved,
/// `null` members of objects dropped (absent and null are equivalent).
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, _)| k)
                .collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&format!("{key:?}:"));
                write_canonical(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Detect tool calls in either response shape: Anthropic `tool_use` content
/// blocks, or chat-completions `choices[0].message.tool_calls`.
pub fn response_has_tool_calls(response: &Value) -> bool {
    if let Some(content) = response.get("content").and_then(Value::as_array)
        && content
            .iter()
            .any(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
    {
        return true;
    }
    if let Some(choices) = response.get("choices").and_then(Value::as_array)
        && let Some(first) = choices.first()
        && let Some(calls) = first
            .get("message")
            .and_then(|m| m.get("tool_calls"))
            .and_then(Value::as_array)
    {
        return !calls.is_empty();
    }
    false
}
