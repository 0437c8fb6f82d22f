//! OpenAI-compatible request server.
//!
//! Surface:
//!
//! - `POST /v1/chat/completions`: accepts the OpenAI chat-completion
//!   request shape. With `stream: true` the response is an SSE stream of
//!   `chat.completion.chunk` objects whose `delta.content` carries the next
//!   pipeline progress unit, terminated by `data: [DONE]`; otherwise the
//!   units are accumulated into a single `chat.completion` envelope.
//! - `GET /v1/models`: announces the orchestrator model plus its live
//!   voting configuration.
//! - `POST /api/session/{id}/resume`: reattaches to a persisted task and
//!   resumes from its last durable stage. Resuming a terminal task returns
//!   the existing artifact without re-running anything.
//! - `GET /api/task/{id}/melodic-line`: read-only reasoning-chain dump.
//! - `GET /api/task/{id}/agent/{agent}/context`: the context block the
//!   named agent would be handed right now.
//!
//! Back-pressure: live pipelines are capped (`MAX_IN_FLIGHT_TASKS`); beyond
//! the cap new requests get a retryable 503. Client disconnects drop the
//! SSE stream, which the pipeline observes at its next chunk boundary and
//! treats as cancellation.
//!
//! Errors use `{"error": {"type", "message"}}` bodies with the taxonomy's
//! status mapping.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::ReceiverStream;

use crate::makerflow::error::OrchestratorError;
use crate::makerflow::pipeline::Pipeline;
use crate::makerflow::store::save_task;
use crate::makerflow::task::TaskState;

/// Model id announced on the OpenAI surface.
pub const MODEL_ID: &str = "makerflow-orchestrator";

/// Shared state behind every handler.
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    inflight: Arc<Semaphore>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let cap = pipeline.config().max_in_flight;
        Self {
            pipeline,
            inflight: Arc::new(Semaphore::new(cap)),
        }
    }
}

/// Build the router. All handlers share one [`AppState`].
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models))
        .route("/api/session/{id}/resume", post(resume))
        .route("/api/task/{id}/melodic-line", get(melodic_line))
        .route("/api/task/{id}/agent/{agent}/context", get(agent_context))
        .with_state(state)
}

// ── Request DTOs ────────────────────────────────────────────────────────

/// Chat completion request body (OpenAI-compatible). Unrecognized fields
/// (`temperature`, `model`, ...) are accepted and ignored at this layer.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Message content: a plain string or an array of parts (OpenAI
/// multimodal). Non-text parts are skipped during extraction.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Optional resume body; an empty body means non-streaming.
#[derive(Debug, Default, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub stream: bool,
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    // Parse by hand so malformed payloads answer 400, not a framework 422.
    let request: ChatCompletionRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(OrchestratorError::BadRequest(format!(
                "malformed chat completion request: {}",
                e
            )))
        }
    };
    let Some(user_message) = last_user_message(&request.messages) else {
        return error_response(OrchestratorError::BadRequest(
            "no user message in messages".to_string(),
        ));
    };

    let Ok(permit) = Arc::clone(&state.inflight).try_acquire_owned() else {
        return overloaded_response();
    };

    let task = TaskState::new(user_message, state.pipeline.config().max_iterations);
    let ttl = state.pipeline.config().task_ttl;
    if let Err(err) = save_task(state.pipeline.store().as_ref(), &task, ttl).await {
        return error_response(err);
    }
    log::info!("task {} accepted (stream={})", task.task_id, request.stream);

    execute(state, task, request.stream, permit).await
}

async fn models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = state.pipeline.config();
    Json(json!({
        "object": "list",
        "data": [{
            "id": MODEL_ID,
            "object": "model",
            "owned_by": "makerflow",
            "mode": config.validator_mode.as_str(),
            "num_candidates": config.num_candidates,
            "vote_k": config.vote_threshold,
        }]
    }))
}

async fn resume(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    body: String,
) -> Response {
    // The body may be empty; when present it carries the stream flag.
    let stream = serde_json::from_str::<ResumeRequest>(&body)
        .map(|r| r.stream)
        .unwrap_or(false);

    let task = match state.pipeline.resume(&task_id).await {
        Ok(task) => task,
        Err(err) => return error_response(err),
    };

    // A terminal task resumes as a no-op: serve the stored artifact.
    if task.status.is_terminal() {
        let content = terminal_artifact(&task);
        return if stream {
            let chunks = vec![content];
            sse_from_chunks(&task.task_id, chunks).into_response()
        } else {
            completion_envelope(&task.task_id, &content).into_response()
        };
    }

    let Ok(permit) = Arc::clone(&state.inflight).try_acquire_owned() else {
        return overloaded_response();
    };
    log::info!("task {} resuming from {}", task.task_id, task.status.as_str());
    execute(state, task, stream, permit).await
}

async fn melodic_line(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Response {
    match state.pipeline.melodic().chain(&task_id).await {
        Some(nodes) => Json(json!({ "task_id": task_id, "nodes": nodes })).into_response(),
        None => error_response(OrchestratorError::TaskNotFound(task_id)),
    }
}

async fn agent_context(
    State(state): State<Arc<AppState>>,
    Path((task_id, agent)): Path<(String, String)>,
) -> Response {
    let Some(role) = crate::makerflow::agent::AgentRole::parse(&agent) else {
        return error_response(OrchestratorError::BadRequest(format!(
            "unknown agent '{}'",
            agent
        )));
    };
    let context = state.pipeline.melodic().context_for(&task_id, role).await;
    Json(json!({ "task_id": task_id, "agent": role.as_str(), "context": context }))
        .into_response()
}

// ── Execution plumbing ──────────────────────────────────────────────────

/// Hand a task to the pipeline, shaping the reply as SSE or a buffered
/// envelope. The in-flight permit travels with the pipeline task so the
/// slot frees exactly when the run ends.
async fn execute(
    state: Arc<AppState>,
    task: TaskState,
    stream: bool,
    permit: OwnedSemaphorePermit,
) -> Response {
    let task_id = task.task_id.clone();
    let (tx, rx) = mpsc::channel::<String>(64);
    let pipeline = Arc::clone(&state.pipeline);
    let handle = tokio::spawn(async move {
        let result = pipeline.run(task, tx).await;
        drop(permit);
        result
    });

    if stream {
        // The handle is detached: the stream carries all the client sees,
        // and dropping the stream cancels the run at its next chunk.
        drop(handle);
        sse_response(&task_id, rx).into_response()
    } else {
        let mut rx = rx;
        let mut units: Vec<String> = Vec::new();
        while let Some(chunk) = rx.recv().await {
            units.push(chunk);
        }
        let (final_task, error) = match handle.await {
            Ok(result) => result,
            Err(e) => {
                return error_response(OrchestratorError::Internal(format!(
                    "pipeline task join: {}",
                    e
                )))
            }
        };
        if let Some(err) = error {
            return error_response(err);
        }
        let content = units.join("\n");
        completion_envelope(&final_task.task_id, &content).into_response()
    }
}

fn last_user_message(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role.eq_ignore_ascii_case("user"))
        .and_then(|m| m.content.as_ref().map(|c| c.as_text()))
        .filter(|text| !text.trim().is_empty())
}

/// What a terminal task has to show: code first, then the plan (the answer
/// for question intent), then the failure tag.
fn terminal_artifact(task: &TaskState) -> String {
    if let Some(code) = &task.code {
        return code.clone();
    }
    if let Some(plan) = &task.plan {
        return plan.clone();
    }
    match &task.failure {
        Some(failure) => format!("[ERROR] {}", failure),
        None => String::new(),
    }
}

// ── Response shaping ────────────────────────────────────────────────────

fn chunk_body(task_id: &str, content: Option<&str>, finish_reason: Option<&str>) -> String {
    let delta = match content {
        Some(text) => json!({ "content": text }),
        None => json!({}),
    };
    json!({
        "id": format!("chatcmpl-{}", task_id),
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": MODEL_ID,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }]
    })
    .to_string()
}

fn sse_response(
    task_id: &str,
    rx: mpsc::Receiver<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let task_id = task_id.to_string();
    let tail_id = task_id.clone();
    let body = ReceiverStream::new(rx)
        // Each pipeline unit becomes one chunk; a separator keeps units
        // readable when clients concatenate deltas.
        .map(move |unit| Ok(Event::default().data(chunk_body(&task_id, Some(&format!("{}\n", unit)), None))))
        .chain(futures_util::stream::iter(vec![
            Ok(Event::default().data(chunk_body(&tail_id, None, Some("stop")))),
            Ok(Event::default().data("[DONE]")),
        ]));
    Sse::new(body)
}

fn sse_from_chunks(
    task_id: &str,
    chunks: Vec<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut events: Vec<Result<Event, std::convert::Infallible>> = chunks
        .into_iter()
        .map(|unit| Ok(Event::default().data(chunk_body(task_id, Some(&unit), None))))
        .collect();
    events.push(Ok(Event::default().data(chunk_body(task_id, None, Some("stop")))));
    events.push(Ok(Event::default().data("[DONE]")));
    Sse::new(futures_util::stream::iter(events))
}

fn completion_envelope(task_id: &str, content: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "id": format!("chatcmpl-{}", task_id),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": MODEL_ID,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }]
        })),
    )
}

fn error_response(err: OrchestratorError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    // The body carries a short, non-leaking message; the full detail stays
    // in the server log. Pipeline failures are additionally logged with the
    // task and correlation ids where they occur.
    if status.is_server_error() {
        log::error!("request failed ({}): {}", err.error_type(), err);
    } else {
        log::warn!("request rejected ({}): {}", err.error_type(), err);
    }
    (
        status,
        Json(json!({
            "error": { "type": err.error_type(), "message": err.client_message() }
        })),
    )
        .into_response()
}

/// Back-pressure rejection: retryable, not part of the task taxonomy.
fn overloaded_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": {
                "type": "overloaded",
                "message": "too many in-flight tasks, retry shortly"
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_user_message_picks_latest() {
        let messages = vec![
            ChatMessage {
                role: "system".into(),
                content: Some(MessageContent::Text("sys".into())),
            },
            ChatMessage {
                role: "user".into(),
                content: Some(MessageContent::Text("first".into())),
            },
            ChatMessage {
                role: "assistant".into(),
                content: Some(MessageContent::Text("mid".into())),
            },
            ChatMessage {
                role: "user".into(),
                content: Some(MessageContent::Text("second".into())),
            },
        ];
        assert_eq!(last_user_message(&messages).as_deref(), Some("second"));
    }

    #[test]
    fn test_last_user_message_joins_parts() {
        let messages = vec![ChatMessage {
            role: "user".into(),
            content: Some(MessageContent::Parts(vec![
                ContentPart {
                    text: Some("hello ".into()),
                },
                ContentPart { text: None },
                ContentPart {
                    text: Some("world".into()),
                },
            ])),
        }];
        assert_eq!(last_user_message(&messages).as_deref(), Some("hello world"));
    }

    #[test]
    fn test_chunk_body_shape() {
        let body = chunk_body("t1", Some("hi"), None);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "hi");
        assert_eq!(value["choices"][0]["finish_reason"], serde_json::Value::Null);

        let tail = chunk_body("t1", None, Some("stop"));
        let value: serde_json::Value = serde_json::from_str(&tail).unwrap();
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_request_parses_string_or_parts_content() {
        let raw = r#"{"messages":[{"role":"user","content":"plain"}],"stream":true,"model":"x","temperature":0.5}"#;
        let request: ChatCompletionRequest = serde_json::from_str(raw).unwrap();
        assert!(request.stream);
        assert_eq!(last_user_message(&request.messages).as_deref(), Some("plain"));

        let raw = r#"{"messages":[{"role":"user","content":[{"type":"text","text":"p1"}]}]}"#;
        let request: ChatCompletionRequest = serde_json::from_str(raw).unwrap();
        assert!(!request.stream);
        assert_eq!(last_user_message(&request.messages).as_deref(), Some("p1"));
    }
}
