use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use overpass_protocol::MessagesRequest;
use overpass_protocol::MessagesResponse;
use overpass_protocol::TerminationReason;
use overpass_protocol::ToolCall;
use overpass_protocol::ToolResult;
use overpass_protocol::Turn;
use overpass_protocol::TurnRole;
use overpass_state::SessionStore;

use crate::cache::PromptCache;
use crate::config::Config;
use crate::error::OverpassErr;
use crate::error::Result;
use crate::exec::SandboxManager;
use crate::mcp::McpRegistry;
use crate::metrics::Metrics;
use crate::policy::PolicyEngine;
use crate::provider::ModelProvider;
use crate::provider::provider_from_config;
use crate::tools::ToolContext;
use crate::tools::ToolRegistry;
use crate::tools::index::FsIndex;
use crate::tools::index::WorkspaceIndex;
use crate::tools::register_builtin_tools;
use crate::tools::register_remote_tools;
use crate::tools::registry::normalize_tool_call;
use crate::web_fallback::triggers_web_fallback;

pub const TERMINATION_HEADER: &str = "x-termination-reason";

/// The result of one `/v1/messages` request after the loop has finished.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub termination: TerminationReason,
}

impl ProcessOutcome {
    fn terminal(status: u16, body: Value, termination: TerminationReason) -> Self {
        Self {
            status,
            headers: vec![(TERMINATION_HEADER.to_string(), termination.to_string())],
            body,
            termination,
        }
    }
}

/// Which wire shape the upstream spoke; tool results are echoed back in the
/// same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireShape {
    Anthropic,
    Chat,
}

#[derive(Debug)]
struct ParsedAssistant {
    shape: WireShape,
    /// Full upstream message object, recorded as the assistant turn.
    transcript_message: Value,
    /// The `{role, content}` object appended to the next request.
    conversation_message: Value,
    text: String,
    tool_calls: Vec<ToolCall>,
}

/// The step loop: cache probe → provider call → tool dispatch → transcript
/// append → termination check, bounded by step/tool/duration budgets.
pub struct Orchestrator {
    config: Arc<Config>,
    provider: Arc<dyn ModelProvider>,
    cache: Arc<PromptCache>,
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    store: SessionStore,
    metrics: Arc<Metrics>,
    sandbox: Arc<SandboxManager>,
    mcp: Arc<McpRegistry>,
    index: Arc<dyn WorkspaceIndex>,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, store: SessionStore) -> Self {
        let provider = provider_from_config(&config);
        Self::with_provider(config, store, provider)
    }

    /// Constructor used by tests to inject a mock provider.
    pub fn with_provider(
        config: Arc<Config>,
        store: SessionStore,
        provider: Arc<dyn ModelProvider>,
    ) -> Self {
        let cache = Arc::new(PromptCache::new(
            config.cache.enabled,
            config.cache.ttl_ms,
            config.cache.max_entries,
        ));
        let registry = Arc::new(ToolRegistry::new());
        register_builtin_tools(&registry);
        let policy = Arc::new(PolicyEngine::new(Arc::clone(&config)));
        let sandbox = Arc::new(SandboxManager::new(Arc::clone(&config)));
        let mcp = Arc::new(McpRegistry::new(Arc::clone(&config)));
        let index: Arc<dyn WorkspaceIndex> =
            Arc::new(FsIndex::new(config.workspace_root.clone()));
        Self {
            config,
            provider,
            cache,
            registry,
            policy,
            store,
            metrics: Arc::new(Metrics::default()),
            sandbox,
            mcp,
            index,
            http: reqwest::Client::new(),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn mcp(&self) -> Arc<McpRegistry> {
        Arc::clone(&self.mcp)
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Discover MCP manifests and register remote tool proxies. Called at
    /// boot and on explicit refresh.
    pub async fn bootstrap_mcp(&self) {
        let servers = self.mcp.load().await;
        if servers == 0 {
            debug!("no MCP servers configured");
            return;
        }
        let tools = self.mcp.remote_tools().await;
        info!(
            "registering {} remote MCP tools from {servers} servers",
            tools.len()
        );
        register_remote_tools(&self.registry, &tools);
    }

    fn tool_context(&self, session_id: &str) -> ToolContext {
        ToolContext {
            session_id: session_id.to_string(),
            config: Arc::clone(&self.config),
            store: self.store.clone(),
            sandbox: Arc::clone(&self.sandbox),
            mcp: Arc::clone(&self.mcp),
            index: Arc::clone(&self.index),
            http: self.http.clone(),
        }
    }

    /// Process one request through the agent loop. Tool and policy errors
    /// are recovered into tool turns; provider errors surface verbatim;
    /// store errors abort the request.
    pub async fn process_message(&self, payload: Value, session_id: &str) -> Result<ProcessOutcome> {
        let request: MessagesRequest =
            serde_json::from_value(payload.clone()).unwrap_or_default();
        let max_steps = request
            .max_steps
            .unwrap_or(self.config.policy.max_steps)
            .max(1);
        let deadline = request
            .max_duration_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let model = if request.model.is_empty() {
            self.config.default_model().to_string()
        } else {
            request.model.clone()
        };

        let ctx = self.tool_context(session_id);
        self.append_incoming_user_turn(session_id, &payload).await?;

        let mut working_messages: Vec<Value> = payload
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let base_request = strip_control_fields(&payload);
        let mut tool_calls_executed: u32 = 0;

        for step in 0..max_steps {
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return self
                    .finish_synthetic(
                        session_id,
                        &model,
                        "The request duration limit was reached before the task completed.",
                        TerminationReason::DurationLimit,
                    )
                    .await;
            }

            let mut request_body = base_request.clone();
            if let Some(object) = request_body.as_object_mut() {
                object.insert("messages".to_string(), Value::Array(working_messages.clone()));
            }

            let cache_key = PromptCache::key_for(&request_body);
            if let Some(hit) = self.cache.lookup(&cache_key) {
                debug!("prompt cache hit at step {step}");
                self.metrics.record_cache_hit();
                self.append_turn(
                    session_id,
                    Turn::new(TurnRole::Assistant, "message", hit.clone())
                        .with_metadata(json!({"cache": "hit"})),
                )
                .await?;
                self.metrics.record_success();
                let mut outcome =
                    ProcessOutcome::terminal(200, hit, TerminationReason::CacheHit);
                outcome.headers.push(("x-cache".to_string(), "hit".to_string()));
                return Ok(outcome);
            }

            let response = match self.provider.invoke(&request_body).await {
                Ok(response) => response,
                Err(OverpassErr::Upstream(err)) => {
                    warn!("provider unreachable: {err}");
                    self.metrics.record_error();
                    return Ok(ProcessOutcome::terminal(
                        502,
                        json!({"error": "upstream_unreachable", "message": err.to_string()}),
                        TerminationReason::ProviderError,
                    ));
                }
                Err(err) => return Err(err),
            };
            if !response.is_success() {
                info!("provider returned {}; surfacing verbatim", response.status);
                self.metrics.record_error();
                return Ok(ProcessOutcome::terminal(
                    response.status,
                    response.body,
                    TerminationReason::ProviderError,
                ));
            }

            let parsed = parse_assistant_response(&response.body);
            self.append_turn(
                session_id,
                Turn::new(
                    TurnRole::Assistant,
                    "message",
                    parsed.transcript_message.clone(),
                ),
            )
            .await?;

            if parsed.tool_calls.is_empty() {
                let wants_fallback = self.provider.web_fallback_enabled()
                    && triggers_web_fallback(&parsed.text);
                if !wants_fallback {
                    let mut body = response.body.clone();
                    self.policy.sanitize_content(&mut body);
                    if PromptCache::admits(response.status, &body) {
                        self.cache.store(cache_key, &body);
                    }
                    self.metrics.record_success();
                    return Ok(ProcessOutcome::terminal(
                        200,
                        body,
                        TerminationReason::Completion,
                    ));
                }

                // The model claims it cannot browse: synthesize a web_fetch
                // for the user's apparent query and loop with the result.
                let query = last_user_text(&working_messages).unwrap_or_default();
                info!("web fallback triggered; fetching {query:?}");
                let call = synthetic_web_fetch_call(&query);
                let (result, executed) = self
                    .dispatch_one(&ctx, session_id, &call, tool_calls_executed)
                    .await?;
                if executed {
                    tool_calls_executed += 1;
                }
                append_exchange(
                    &mut working_messages,
                    &parsed,
                    &[(call, result)],
                );
                continue;
            }

            let mut results: Vec<(ToolCall, ToolResult)> = Vec::new();
            let mut quota_hit = false;
            for call in &parsed.tool_calls {
                let (result, executed) = self
                    .dispatch_one(&ctx, session_id, call, tool_calls_executed)
                    .await?;
                if executed {
                    tool_calls_executed += 1;
                } else if result
                    .error
                    .as_ref()
                    .is_some_and(|e| e.code == "tool_limit_reached")
                {
                    quota_hit = true;
                }
                results.push((call.clone(), result));
            }

            if quota_hit {
                return self
                    .finish_synthetic(
                        session_id,
                        &model,
                        "The per-turn tool call limit was reached before the task completed.",
                        TerminationReason::ToolLimitReached,
                    )
                    .await;
            }

            append_exchange(&mut working_messages, &parsed, &results);
        }

        self.finish_synthetic(
            session_id,
            &model,
            "The step limit was reached before the task completed.",
            TerminationReason::StepLimit,
        )
        .await
    }

    /// Policy-gate and (if allowed) execute one tool call, appending the
    /// tool turn either way. Returns the result and whether a real
    /// execution happened.
    async fn dispatch_one(
        &self,
        ctx: &ToolContext,
        session_id: &str,
        call: &ToolCall,
        tool_calls_executed: u32,
    ) -> Result<(ToolResult, bool)> {
        let canonical = self
            .registry
            .canonical_name(&call.name)
            .unwrap_or_else(|| call.name.clone());
        let decision = self
            .policy
            .evaluate_tool_call(call, &canonical, tool_calls_executed)
            .await;

        let (result, executed) = if decision.allowed {
            self.metrics.record_tool_call();
            let result = self.registry.execute(call, ctx).await;
            (result, true)
        } else {
            debug!(
                "policy denied {canonical}: {:?}",
                decision.code.as_deref().unwrap_or("unknown")
            );
            let result = ToolResult::failure(
                decision.status.unwrap_or(403),
                decision.code.as_deref().unwrap_or("policy_denied"),
                decision.reason.as_deref().unwrap_or("denied by policy"),
            );
            (result, false)
        };

        let turn = Turn::new(
            TurnRole::Tool,
            "tool_result",
            json!({
                "tool_use_id": call.id,
                "tool": canonical,
                "ok": result.ok,
                "content": result.content,
            }),
        )
        .with_status(i64::from(result.status))
        .with_metadata(json!({"metadata": result.metadata}));
        self.append_turn(session_id, turn).await?;
        Ok((result, executed))
    }

    async fn finish_synthetic(
        &self,
        session_id: &str,
        model: &str,
        text: &str,
        termination: TerminationReason,
    ) -> Result<ProcessOutcome> {
        let message = MessagesResponse::synthetic(model, text);
        let body = serde_json::to_value(&message)?;
        self.append_turn(
            session_id,
            Turn::new(TurnRole::Assistant, "message", body.clone())
                .with_metadata(json!({"synthetic": true, "termination": termination})),
        )
        .await?;
        self.metrics.record_success();
        Ok(ProcessOutcome::terminal(200, body, termination))
    }

    async fn append_incoming_user_turn(&self, session_id: &str, payload: &Value) -> Result<()> {
        let Some(messages) = payload.get("messages").and_then(Value::as_array) else {
            return Ok(());
        };
        let Some(last_user) = messages
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        else {
            return Ok(());
        };
        self.append_turn(
            session_id,
            Turn::new(TurnRole::User, "message", last_user.clone()),
        )
        .await
    }

    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<()> {
        self.store
            .append_turn(session_id, &turn)
            .await
            .map_err(OverpassErr::store)
    }
}

/// Strip the proxy's own control fields before forwarding upstream.
fn strip_control_fields(payload: &Value) -> Value {
    let mut body = payload.clone();
    if let Some(object) = body.as_object_mut() {
        for field in [
            "stream",
            "max_steps",
            "max_duration_ms",
            "session_id",
            "sessionId",
            "conversation_id",
        ] {
            object.remove(field);
        }
    }
    body
}

/// Extract the assistant message and its tool calls from either upstream
/// shape.
fn parse_assistant_response(body: &Value) -> ParsedAssistant {
    // Chat-completions shape: choices[0].message with optional tool_calls.
    if let Some(choices) = body.get("choices").and_then(Value::as_array)
        && let Some(message) = choices.first().and_then(|choice| choice.get("message"))
    {
        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| calls.iter().map(normalize_tool_call).collect())
            .unwrap_or_default();
        return ParsedAssistant {
            shape: WireShape::Chat,
            transcript_message: message.clone(),
            conversation_message: message.clone(),
            text,
            tool_calls,
        };
    }

    // Anthropic shape: top-level content block list.
    let content = body.get("content").and_then(Value::as_array);
    let text = content
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("\n")
        })
        .unwrap_or_default();
    let tool_calls = content
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
                .map(normalize_tool_call)
                .collect()
        })
        .unwrap_or_default();
    let conversation_message = json!({
        "role": "assistant",
        "content": body.get("content").cloned().unwrap_or(Value::Array(Vec::new())),
    });
    ParsedAssistant {
        shape: WireShape::Anthropic,
        transcript_message: body.clone(),
        conversation_message,
        text,
        tool_calls,
    }
}

/// Append the assistant message and its tool results to the next request's
/// message list, in the wire shape the upstream spoke.
fn append_exchange(
    messages: &mut Vec<Value>,
    parsed: &ParsedAssistant,
    results: &[(ToolCall, ToolResult)],
) {
    messages.push(parsed.conversation_message.clone());
    match parsed.shape {
        WireShape::Anthropic => {
            let blocks: Vec<Value> = results
                .iter()
                .map(|(call, result)| {
                    json!({
                        "type": "tool_result",
                        "tool_use_id": call.id,
                        "content": result.content,
                        "is_error": !result.ok,
                    })
                })
                .collect();
            messages.push(json!({"role": "user", "content": blocks}));
        }
        WireShape::Chat => {
            for (call, result) in results {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": result.content,
                }));
            }
        }
    }
}

fn last_user_text(messages: &[Value]) -> Option<String> {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?;
    match last_user.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(blocks)) => {
            let text = blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("\n");
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

fn synthetic_web_fetch_call(query: &str) -> ToolCall {
    let mut arguments = serde_json::Map::new();
    arguments.insert("query".to_string(), Value::String(query.to_string()));
    let mut call = ToolCall::new(
        format!("call_{}", uuid::Uuid::new_v4().simple()),
        "web_fetch",
        arguments,
    );
    call.raw = json!({"synthetic": true, "name": "web_fetch", "query": query});
    call
}
