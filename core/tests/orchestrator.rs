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

struct Harness {
    _workspace: TempDir,
    orchestrator: Orchestrator,
    server: MockServer,
}

async fn harness(extra_env: &[(&str, &str)]) -> Harness {
    let workspace = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let mut vars: HashMap<String, String> = [
        ("DATABRICKS_API_BASE", server.uri().as_str()),
        ("DATABRICKS_API_KEY", "pat-test"),
        ("WORKSPACE_ROOT", workspace.path().to_str().unwrap()),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (key, value) in extra_env {
        vars.insert(key.to_string(), value.to_string());
    }
    let config = Arc::new(Config::from_env_map(&vars));
    let store = SessionStore::open(&workspace.path().join("sessions.db"))
        .await
        .unwrap();
    let orchestrator = Orchestrator::new(config, store);
    Harness {
        _workspace: workspace,
        orchestrator,
        server,
    }
}

fn text_response(text: &str) -> Value {
    json!({
        "id": "msg_up",
        "type": "message",
        "role": "assistant",
        "model": "m",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn"
    })
}

fn tool_use_response(id: &str, name: &str, input: Value) -> Value {
    json!({
        "id": "msg_tool",
        "type": "message",
        "role": "assistant",
        "model": "m",
        "content": [
            {"type": "text", "text": "working on it"},
            {"type": "tool_use", "id": id, "name": name, "input": input}
        ],
        "stop_reason": "tool_use"
    })
}

fn request_body(text: &str) -> Value {
    json!({
        "model": "m",
        "messages": [{"role": "user", "content": text}],
        "stream": false
    })
}

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let h = harness(&[]).await;
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("hello back")))
        .expect(1)
        .mount(&h.server)
        .await;

    let first = h
        .orchestrator
        .process_message(request_body("hello"), "s-cache")
        .await
        .unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.termination, TerminationReason::Completion);

    let second = h
        .orchestrator
        .process_message(request_body("hello"), "s-cache")
        .await
        .unwrap();
    assert_eq!(second.termination, TerminationReason::CacheHit);
    assert_eq!(second.body, first.body);
    // expect(1) on the mock verifies exactly one upstream call happened.
}

#[tokio::test]
async fn tool_round_trip_appends_four_turns() {
    let h = harness(&[]).await;
    std::fs::write(h._workspace.path().join("README.md"), "# demo project\n").unwrap();

    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_use_response(
            "toolu_1",
            "fs_read",
            json!({"path": "README.md"}),
        )))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(text_response("the readme says demo")),
        )
        .mount(&h.server)
        .await;

    let outcome = h
        .orchestrator
        .process_message(request_body("read README"), "s-tools")
        .await
        .unwrap();
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.termination, TerminationReason::Completion);

    let session = h
        .orchestrator
        .store()
        .get_session("s-tools")
        .await
        .unwrap()
        .unwrap();
    let roles: Vec<TurnRole> = session.history.iter().map(|turn| turn.role).collect();
    assert_eq!(
        roles,
        vec![
            TurnRole::User,
            TurnRole::Assistant,
            TurnRole::Tool,
            TurnRole::Assistant
        ]
    );
    let tool_turn = &session.history[2];
    assert_eq!(tool_turn.status, Some(200));
    assert!(
        tool_turn.content["content"]
            .as_str()
            .unwrap()
            .contains("# demo project")
    );
    assert_eq!(tool_turn.content["tool_use_id"], json!("toolu_1"));
}

#[tokio::test]
async fn denied_git_push_becomes_tool_turn_and_loop_continues() {
    let h = harness(&[("POLICY_GIT_ALLOW_PUSH", "false")]).await;

    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_use_response(
            "toolu_push",
            "workspace_git_push",
            json!({}),
        )))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(text_response("push was not allowed")),
        )
        .mount(&h.server)
        .await;

    let outcome = h
        .orchestrator
        .process_message(request_body("push my branch"), "s-push")
        .await
        .unwrap();
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.termination, TerminationReason::Completion);

    let session = h
        .orchestrator
        .store()
        .get_session("s-push")
        .await
        .unwrap()
        .unwrap();
    let tool_turn = session
        .history
        .iter()
        .find(|turn| turn.role == TurnRole::Tool)
        .unwrap();
    assert_eq!(tool_turn.status, Some(403));
    assert!(
        tool_turn.content["content"]
            .as_str()
            .unwrap()
            .contains("git_push_disabled")
    );
}

#[tokio::test]
async fn step_limit_stops_after_exactly_n_upstream_calls() {
    let h = harness(&[("POLICY_MAX_STEPS", "2")]).await;

    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_use_response(
            "toolu_loop",
            "shell",
            json!({"command": "echo again"}),
        )))
        .expect(2)
        .mount(&h.server)
        .await;

    let outcome = h
        .orchestrator
        .process_message(request_body("loop forever"), "s-steps")
        .await
        .unwrap();
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.termination, TerminationReason::StepLimit);
    let text = outcome.body["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("step limit"), "unexpected text {text:?}");
}

#[tokio::test]
async fn tool_quota_synthesizes_limit_message() {
    let h = harness(&[("POLICY_MAX_TOOL_CALLS", "1")]).await;

    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_two_tools",
            "role": "assistant",
            "content": [
                {"type": "tool_use", "id": "t1", "name": "shell", "input": {"command": "echo one"}},
                {"type": "tool_use", "id": "t2", "name": "shell", "input": {"command": "echo two"}}
            ]
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let outcome = h
        .orchestrator
        .process_message(request_body("run both"), "s-quota")
        .await
        .unwrap();
    assert_eq!(outcome.termination, TerminationReason::ToolLimitReached);

    let session = h
        .orchestrator
        .store()
        .get_session("s-quota")
        .await
        .unwrap()
        .unwrap();
    let tool_turns: Vec<_> = session
        .history
        .iter()
        .filter(|turn| turn.role == TurnRole::Tool)
        .collect();
    assert_eq!(tool_turns.len(), 2);
    assert_eq!(tool_turns[0].status, Some(200));
    assert_eq!(tool_turns[1].status, Some(429));
}

#[tokio::test]
async fn provider_errors_surface_verbatim() {
    let h = harness(&[]).await;
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(json!({"error": "overloaded"})),
        )
        .mount(&h.server)
        .await;

    let outcome = h
        .orchestrator
        .process_message(request_body("hi"), "s-err")
        .await
        .unwrap();
    assert_eq!(outcome.status, 503);
    assert_eq!(outcome.body, json!({"error": "overloaded"}));
    assert_eq!(outcome.termination, TerminationReason::ProviderError);
}

#[tokio::test]
async fn unknown_tool_yields_404_tool_turn() {
    let h = harness(&[]).await;
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_use_response(
            "toolu_missing",
            "does_not_exist",
            json!({}),
        )))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("gave up")))
        .mount(&h.server)
        .await;

    let outcome = h
        .orchestrator
        .process_message(request_body("use the mystery tool"), "s-404")
        .await
        .unwrap();
    assert_eq!(outcome.termination, TerminationReason::Completion);

    let session = h
        .orchestrator
        .store()
        .get_session("s-404")
        .await
        .unwrap()
        .unwrap();
    let tool_turn = session
        .history
        .iter()
        .find(|turn| turn.role == TurnRole::Tool)
        .unwrap();
    assert_eq!(tool_turn.status, Some(404));
}

#[tokio::test]
async fn chat_completion_shape_round_trips() {
    let h = harness(&[]).await;
    std::fs::write(h._workspace.path().join("note.txt"), "chat shape works\n").unwrap();

    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_chat",
                        "function": {
                            "name": "fs_read",
                            "arguments": "{\"path\":\"note.txt\"}"
                        }
                    }]
                }
            }]
        })))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/serving-endpoints/.*/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "done"}}]
        })))
        .mount(&h.server)
        .await;

    let outcome = h
        .orchestrator
        .process_message(request_body("read the note"), "s-chat")
        .await
        .unwrap();
    assert_eq!(outcome.termination, TerminationReason::Completion);

    // The follow-up request must carry the tool result as a tool-role
    // message, matching the chat wire shape.
    let requests = h.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let messages = second["messages"].as_array().unwrap();
    let tool_message = messages
        .iter()
        .find(|m| m["role"] == json!("tool"))
        .unwrap();
    assert_eq!(tool_message["tool_call_id"], json!("call_chat"));
    assert!(
        tool_message["content"]
            .as_str()
            .unwrap()
            .contains("chat shape works")
    );
}
