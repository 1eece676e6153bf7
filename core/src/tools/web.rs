use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;

use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;

use crate::tools::context::ToolContext;
use crate::tools::registry::ToolHandler;

const FETCH_LIMIT: usize = 256 * 1024;

/// Truncate to at most `max` bytes without splitting a UTF-8 character;
/// `String::truncate` panics off a char boundary.
pub(crate) fn truncate_to_char_boundary(text: &mut String, max: usize) {
    let mut end = max.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// Query the configured external search endpoint.
pub struct WebSearchTool;

#[async_trait]
impl ToolHandler for WebSearchTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let query = call
            .string_arg(&["query", "q", "search"])
            .ok_or_else(|| anyhow!("missing query argument"))?;
        let web = &ctx.config.web;
        let response = ctx
            .http
            .get(&web.search_endpoint)
            .query(&[("q", query.as_str())])
            .timeout(Duration::from_millis(web.timeout_ms))
            .send()
            .await
            .context("search endpoint unreachable")?;
        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        truncate_to_char_boundary(&mut body, FETCH_LIMIT);

        let mut result = ToolResult::success(body).with_metadata("query", json!(query));
        if status >= 400 {
            result.ok = false;
            result.status = status;
        }
        Ok(result)
    }
}

/// Bounded HTTP GET with a host allowlist. Non-URL input is treated as a
/// search query and routed through the search endpoint, which is what the
/// web-fallback path relies on.
pub struct WebFetchTool;

#[async_trait]
impl ToolHandler for WebFetchTool {
    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let target = call
            .string_arg(&["url", "query", "q"])
            .ok_or_else(|| anyhow!("missing url argument"))?;
        let web = &ctx.config.web;

        let url = if target.starts_with("http://") || target.starts_with("https://") {
            target.clone()
        } else {
            format!(
                "{}?q={}",
                web.search_endpoint,
                urlencode(&target)
            )
        };

        if !web.allow_all_hosts {
            let host = reqwest::Url::parse(&url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default();
            let allowed = web
                .allowed_hosts
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(&host));
            if !allowed {
                return Ok(ToolResult::failure(
                    403,
                    "host_not_allowed",
                    format!("host {host:?} is not on the allowlist"),
                ));
            }
        }

        let response = ctx
            .http
            .get(&url)
            .timeout(Duration::from_millis(web.timeout_ms))
            .send()
            .await
            .with_context(|| format!("fetch of {url} failed"))?;
        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        truncate_to_char_boundary(&mut body, FETCH_LIMIT);

        let mut result = ToolResult::success(body).with_metadata("url", json!(url));
        if status >= 400 {
            result.ok = false;
            result.status = status;
        }
        Ok(result)
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("hello world"), "hello+world");
        assert_eq!(urlencode("a&b=c"), "a%26b%3Dc");
        assert_eq!(urlencode("safe-chars_.~"), "safe-chars_.~");
    }

    #[test]
    fn truncation_never_splits_a_character() {
        // "é" is two bytes; a limit of 3 lands mid-character.
        let mut text = "aéé".to_string();
        truncate_to_char_boundary(&mut text, 3);
        assert_eq!(text, "aé");

        let mut ascii = "abcdef".to_string();
        truncate_to_char_boundary(&mut ascii, 4);
        assert_eq!(ascii, "abcd");

        let mut short = "ab".to_string();
        truncate_to_char_boundary(&mut short, 10);
        assert_eq!(short, "ab");
    }
}
