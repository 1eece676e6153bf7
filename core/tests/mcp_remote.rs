use std::collections::HashMap;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path_regex;

use overpass_core::Config;
use overpass_core::Orchestrator;
use overpass_protocol::TerminationReason;
use overpass_protocol::TurnRole;
use overpass_state::SessionStore;

/// A line-oriented JSON-RPC stub server good enough for initialize,
/// tools/list, and tools/call.
const STUB_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"serverInfo":{"name":"demo"}}}\n' "$id" ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echo arguments"}]}}\n' "$id" ;;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echo reply"}]}}\n' "$id" ;;
  esac
done
"#;

async fn harness_with_manifest() -> (TempDir, Orchestrator, MockServer) {
    let workspace = TempDir::new().unwrap();
    let manifest_dir = workspace.path().join("mcp");
    std::fs::create_dir_all(&manifest_dir).unwrap();
    std::fs::write(
        manifest_dir.join("demo.json"),
        json!([{
            "id": "demo",
            "command": "sh",
            "args": ["-c", STUB_SERVER],
            "transport": "stdio"
        }])
        .to_string(),
    )
    .unwrap();

    let server = MockServer::start().await;
    let vars: HashMap<String, String> = [
        ("DATABRICKS_API_BASE", server.uri().as_str()),
        ("DATABRICKS_API_KEY", "pat-test"),
        ("WORKSPACE_ROOT", workspace.path().to_str().unwrap()),
        ("MCP_MANIFEST_DIRS", manifest_dir.to_str().unwrap()),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = Arc::new(Config::from_env_map(&vars));
    let store = SessionStore::open(&workspace.path().join("sessions.db"))
        .await
        .unwrap();
    let orchestrator = Orchestrator::new(config, store);
    orchestrator.bootstrap_mcp().await;
    (workspace, orchestrator, server)
}

#[tokio::test]
async fn remote_tool_round_trips_through_the_loop() {
    let (_workspace, orchestrator, server) = harness_with_manifest().await;

    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_mcp",
            "role": "assistant",
            "content": [{
                "type": "tool_use",
                "id": "toolu_mcp",
                "name": "mcp_demo_echo",
                "input": {"msg": "hi"}
            }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_done",
            "role": "assistant",
            "content": [{"type": "text", "text": "the server said: echo reply"}]
        })))
        .mount(&server)
        .await;

    let outcome = orchestrator
        .process_message(
            json!({
                "model": "m",
                "messages": [{"role": "user", "content": "call the demo echo tool"}]
            }),
            "s-mcp",
        )
        .await
        .unwrap();
    assert_eq!(outcome.termination, TerminationReason::Completion);

    let session = orchestrator
        .store()
        .get_session("s-mcp")
        .await
        .unwrap()
        .unwrap();
    let tool_turn = session
        .history
        .iter()
        .find(|turn| turn.role == TurnRole::Tool)
        .unwrap();
    assert_eq!(tool_turn.status, Some(200));
    let content = tool_turn.content["content"].as_str().unwrap();
    assert!(content.contains("echo reply"), "unexpected content {content:?}");

    orchestrator.mcp().close_all().await;
}

#[tokio::test]
async fn web_fallback_fetches_and_reinvokes() {
    let workspace = TempDir::new().unwrap();
    let server = MockServer::start().await;

    // The "search endpoint" the synthetic web_fetch will hit.
    Mock::given(method("GET"))
        .and(path_regex(r"/search"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fresh web results"))
        .expect(1)
        .mount(&server)
        .await;

    // First reply refuses for lack of browsing; second uses the fetched data.
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_refuse",
            "role": "assistant",
            "content": [{"type": "text", "text": "I don't have browser access to check that."}]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_informed",
            "role": "assistant",
            "content": [{"type": "text", "text": "According to the web: fresh web results"}]
        })))
        .mount(&server)
        .await;

    let search_endpoint = format!("{}/search", server.uri());
    let vars: HashMap<String, String> = [
        ("DATABRICKS_API_BASE", server.uri().as_str()),
        ("DATABRICKS_API_KEY", "pat-test"),
        ("WORKSPACE_ROOT", workspace.path().to_str().unwrap()),
        ("WEB_SEARCH_ENDPOINT", search_endpoint.as_str()),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = Arc::new(Config::from_env_map(&vars));
    let store = SessionStore::open(&workspace.path().join("sessions.db"))
        .await
        .unwrap();
    let orchestrator = Orchestrator::new(config, store);

    let outcome = orchestrator
        .process_message(
            json!({
                "model": "m",
                "messages": [{"role": "user", "content": "what's the latest rust release?"}]
            }),
            "s-fallback",
        )
        .await
        .unwrap();
    assert_eq!(outcome.termination, TerminationReason::Completion);
    let text = outcome.body["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("fresh web results"));

    let session = orchestrator
        .store()
        .get_session("s-fallback")
        .await
        .unwrap()
        .unwrap();
    let tool_turn = session
        .history
        .iter()
        .find(|turn| turn.role == TurnRole::Tool)
        .unwrap();
    assert_eq!(tool_turn.content["tool"], json!("web_fetch"));
}
