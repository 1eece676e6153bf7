use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::HeaderName;
use axum::http::header::HeaderValue;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::response::sse::Event;
use axum::response::sse::Sse;
use axum::routing::get;
use axum::routing::post;
use futures::stream;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::error;

use overpass_core::Orchestrator;
use overpass_core::orchestrator::ProcessOutcome;

use crate::session_id::resolve_session_id;
use crate::session_id::session_id_from_headers;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route(
            "/debug/session",
            get(get_debug_session).delete(delete_debug_session),
        )
        .route("/v1/messages", post(post_messages))
        .with_state(state)
}

async fn get_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn get_metrics(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.orchestrator.metrics().snapshot();
    Json(serde_json::to_value(snapshot).unwrap_or_default())
}

async fn get_debug_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = session_id_from_headers(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing session header"})),
        )
            .into_response();
    };
    match state.orchestrator.store().get_session(&session_id).await {
        Ok(Some(session)) => Json(serde_json::to_value(session).unwrap_or_default()).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found", "session_id": session_id})),
        )
            .into_response(),
        Err(err) => {
            error!("failed to load session {session_id}: {err:#}");
            internal_error(&err.to_string())
        }
    }
}

async fn delete_debug_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = session_id_from_headers(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing session header"})),
        )
            .into_response();
    };
    match state.orchestrator.store().delete_session(&session_id).await {
        Ok(deleted) => Json(json!({"deleted": deleted, "session_id": session_id})).into_response(),
        Err(err) => {
            error!("failed to delete session {session_id}: {err:#}");
            internal_error(&err.to_string())
        }
    }
}

async fn post_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let orchestrator = &state.orchestrator;
    orchestrator.metrics().record_request();

    let (session_id, generated) = resolve_session_id(&headers, Some(&payload));
    debug!(session = %session_id, generated, "handling /v1/messages");
    if generated
        && let Err(err) = orchestrator
            .store()
            .upsert_session(&session_id, &json!({"generated": true}))
            .await
    {
        error!("failed to mark generated session: {err:#}");
        orchestrator.metrics().record_error();
        return internal_error(&err.to_string());
    }

    let stream_requested = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let outcome = match orchestrator.process_message(payload, &session_id).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("orchestrator failure: {err:#}");
            orchestrator.metrics().record_error();
            return internal_error(&err.to_string());
        }
    };

    if stream_requested && outcome.status == 200 {
        orchestrator.metrics().record_streaming_session();
        return sse_response(outcome);
    }

    json_response(outcome)
}

fn json_response(outcome: ProcessOutcome) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(outcome.body)).into_response();
    for (name, value) in &outcome.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// One `message` event carrying the full final body, then one `end` event
/// with the termination reason.
fn sse_response(outcome: ProcessOutcome) -> Response {
    let message = Event::default()
        .event("message")
        .json_data(json!({"type": "message", "message": outcome.body}))
        .unwrap_or_else(|_| Event::default().event("message").data("{}"));
    let end = Event::default()
        .event("end")
        .json_data(json!({"termination": outcome.termination}))
        .unwrap_or_else(|_| Event::default().event("end").data("{}"));

    let events = stream::iter(vec![
        Ok::<Event, Infallible>(message),
        Ok::<Event, Infallible>(end),
    ]);
    let mut response = Sse::new(events).into_response();
    response.headers_mut().insert(
        axum::http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    response
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal_error", "message": message})),
    )
        .into_response()
}
