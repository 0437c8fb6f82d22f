//! Agent backend client.
//!
//! Every LLM role is served by an HTTP endpoint speaking the OpenAI
//! chat-completions shape. The [`AgentBackend`] trait abstracts over the
//! transport so the pipeline, voter, and compressor can be exercised against
//! scripted backends in tests; [`HttpAgentBackend`] is the production
//! implementation.
//!
//! # Transport behaviour
//!
//! - One shared, pooled `reqwest` client for the whole process. Keeping a
//!   single instance keeps TLS sessions and DNS lookups warm across the
//!   thousands of calls a busy orchestrator makes.
//! - One retry with a 500 ms backoff for transport errors and 5xx answers.
//!   4xx answers and timeouts never retry.
//! - Streaming responses are SSE: `data: {json}` frames terminated by
//!   `data: [DONE]`. Frames are drained incrementally from a pending byte
//!   buffer; malformed frames are skipped.
//! - Every call logs a span line with agent name, prompt size, response
//!   size, latency, and the terminal error kind if any.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use makerflow::agent::{AgentRegistry, AgentRole};
//! use makerflow::client::{AgentBackend, CallOptions, HttpAgentBackend};
//!
//! # async {
//! let registry = Arc::new(AgentRegistry::from_env());
//! let backend = HttpAgentBackend::new(registry);
//! let reply = backend
//!     .call_sync(AgentRole::Planner, "You plan.", "Plan a CLI tool.", &CallOptions::default())
//!     .await
//!     .unwrap();
//! println!("{}", reply);
//! # };
//! ```

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use tokio::sync::Mutex;

use crate::makerflow::agent::{AgentRegistry, AgentRole};
use crate::makerflow::error::OrchestratorError;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Recognized per-call options.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Sampling temperature, 0.0 to 2.0.
    pub temperature: f32,
    pub max_tokens: u32,
    /// Caller intends to consume the streaming form. `call` always streams
    /// regardless; `call_sync` ignores this.
    pub stream: bool,
    /// Override of the role's configured deadline.
    pub timeout_ms: Option<u64>,
    pub stop_sequences: Vec<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            stream: false,
            timeout_ms: None,
            stop_sequences: Vec::new(),
        }
    }
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// One incremental piece of a streaming response.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Content delta. May be empty on finish-reason frames.
    pub content: String,
    pub finish_reason: Option<String>,
}

/// Stream of chunks, in arrival order.
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<StreamChunk, OrchestratorError>> + Send>>;

/// Transport abstraction over the agent endpoints.
///
/// Implementations must be `Send + Sync`; they are shared across every live
/// pipeline behind an `Arc`.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Request/response call. Returns the assistant content.
    async fn call_sync(
        &self,
        role: AgentRole,
        system_prompt: &str,
        user_prompt: &str,
        options: &CallOptions,
    ) -> Result<String, OrchestratorError>;

    /// Streaming call yielding chunks as they arrive, preserving order.
    ///
    /// The default implementation resolves the sync call and yields it as a
    /// single chunk, which suits backends without streaming support.
    async fn call(
        &self,
        role: AgentRole,
        system_prompt: &str,
        user_prompt: &str,
        options: &CallOptions,
    ) -> Result<ChunkStream, OrchestratorError> {
        let content = self
            .call_sync(role, system_prompt, user_prompt, options)
            .await?;
        let chunk = StreamChunk {
            content,
            finish_reason: Some("stop".to_string()),
        };
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(chunk)])))
    }

    /// Usage reported by the most recent call, when the backend provides it.
    async fn last_usage(&self) -> Option<TokenUsage> {
        None
    }
}

/// Production backend: raw OpenAI-compatible HTTP with SSE streaming.
pub struct HttpAgentBackend {
    registry: Arc<AgentRegistry>,
    usage: Mutex<Option<TokenUsage>>,
}

impl HttpAgentBackend {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            usage: Mutex::new(None),
        }
    }

    fn build_body(
        &self,
        role: AgentRole,
        system_prompt: &str,
        user_prompt: &str,
        options: &CallOptions,
        stream: bool,
    ) -> serde_json::Value {
        let profile = self.registry.profile(role);
        let mut body = serde_json::json!({
            "model": profile.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": stream,
        });
        if !options.stop_sequences.is_empty() {
            body["stop"] = serde_json::json!(options.stop_sequences);
        }
        body
    }

    /// Send the request once. `Err(true)` means the failure is retryable.
    async fn send_once(
        &self,
        role: AgentRole,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, (OrchestratorError, bool)> {
        let profile = self.registry.profile(role);
        let sent = get_shared_http_client()
            .post(&profile.endpoint)
            .header("Content-Type", "application/json")
            .json(body)
            .send();

        let resp = match tokio::time::timeout(timeout, sent).await {
            Err(_) => {
                return Err((
                    OrchestratorError::AgentTimeout(format!(
                        "{}: no response within {} ms",
                        role,
                        timeout.as_millis()
                    )),
                    false,
                ))
            }
            Ok(Err(e)) => {
                return Err((
                    OrchestratorError::AgentUnavailable(format!("{}: {}", role, e)),
                    true,
                ))
            }
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retryable = status.is_server_error();
        let text = resp.text().await.unwrap_or_default();
        Err((
            OrchestratorError::AgentUnavailable(format!(
                "{}: HTTP {} {}",
                role,
                status.as_u16(),
                truncate(&text, 200)
            )),
            retryable,
        ))
    }

    /// Send with the retry policy: one retry, 500 ms backoff, transport and
    /// 5xx failures only.
    async fn send_with_retry(
        &self,
        role: AgentRole,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, OrchestratorError> {
        match self.send_once(role, body, timeout).await {
            Ok(resp) => Ok(resp),
            Err((err, retryable)) => {
                if !retryable {
                    return Err(err);
                }
                log::warn!("agent {} call failed ({}), retrying once", role, err);
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.send_once(role, body, timeout)
                    .await
                    .map_err(|(err, _)| err)
            }
        }
    }

    fn timeout_for(&self, role: AgentRole, options: &CallOptions) -> Duration {
        let ms = options
            .timeout_ms
            .unwrap_or_else(|| self.registry.profile(role).timeout_ms);
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn call_sync(
        &self,
        role: AgentRole,
        system_prompt: &str,
        user_prompt: &str,
        options: &CallOptions,
    ) -> Result<String, OrchestratorError> {
        let body = self.build_body(role, system_prompt, user_prompt, options, false);
        let timeout = self.timeout_for(role, options);
        let prompt_bytes = system_prompt.len() + user_prompt.len();
        let started = Instant::now();

        let result: Result<String, OrchestratorError> = async {
            let resp = self.send_with_retry(role, &body, timeout).await?;
            let text = tokio::time::timeout(timeout, resp.text())
                .await
                .map_err(|_| {
                    OrchestratorError::AgentTimeout(format!("{}: body read timed out", role))
                })?
                .map_err(|e| OrchestratorError::AgentUnavailable(format!("{}: {}", role, e)))?;

            let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                OrchestratorError::AgentMalformedResponse(format!("{}: {}", role, e))
            })?;

            if let Some(usage) = parsed.get("usage") {
                let input = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                let output = usage
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                *self.usage.lock().await = Some(TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input + output,
                });
            }

            parsed
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    OrchestratorError::AgentMalformedResponse(format!(
                        "{}: no choices[0].message.content",
                        role
                    ))
                })
        }
        .await;

        let latency_ms = started.elapsed().as_millis();
        match &result {
            Ok(content) => log::info!(
                "agent_call agent={} prompt_bytes={} response_bytes={} latency_ms={}",
                role,
                prompt_bytes,
                content.len(),
                latency_ms
            ),
            Err(err) => log::error!(
                "agent_call agent={} prompt_bytes={} latency_ms={} error={}",
                role,
                prompt_bytes,
                latency_ms,
                err.error_type()
            ),
        }
        result
    }

    async fn call(
        &self,
        role: AgentRole,
        system_prompt: &str,
        user_prompt: &str,
        options: &CallOptions,
    ) -> Result<ChunkStream, OrchestratorError> {
        let body = self.build_body(role, system_prompt, user_prompt, options, true);
        let timeout = self.timeout_for(role, options);
        let started = Instant::now();
        let resp = self.send_with_retry(role, &body, timeout).await?;
        log::info!(
            "agent_call agent={} prompt_bytes={} streaming=true first_byte_ms={}",
            role,
            system_prompt.len() + user_prompt.len(),
            started.elapsed().as_millis()
        );

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        // Backends without streaming support answer with a plain completion.
        if !content_type.contains("text/event-stream") {
            let text = resp
                .text()
                .await
                .map_err(|e| OrchestratorError::AgentUnavailable(format!("{}: {}", role, e)))?;
            let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                OrchestratorError::AgentMalformedResponse(format!("{}: {}", role, e))
            })?;
            let content = parsed
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            let chunk = StreamChunk {
                content,
                finish_reason: Some("stop".to_string()),
            };
            return Ok(Box::pin(futures_util::stream::iter(vec![Ok(chunk)])));
        }

        let body_stream = resp.bytes_stream().map(|r| r.map(|b| b.to_vec()));
        let state = SseDecoder {
            role,
            body: Box::pin(body_stream),
            pending: String::new(),
            queue: VecDeque::new(),
            timeout,
            done: false,
        };

        let stream = futures_util::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(chunk) = st.queue.pop_front() {
                    return Some((Ok(chunk), st));
                }
                if st.done {
                    return None;
                }
                match tokio::time::timeout(st.timeout, st.body.next()).await {
                    Err(_) => {
                        st.done = true;
                        let err = OrchestratorError::AgentTimeout(format!(
                            "{}: stream stalled past {} ms",
                            st.role,
                            st.timeout.as_millis()
                        ));
                        return Some((Err(err), st));
                    }
                    Ok(None) => {
                        st.done = true;
                        drain_sse_frames(&mut st.pending, &mut st.queue);
                    }
                    Ok(Some(Err(e))) => {
                        st.done = true;
                        let err = OrchestratorError::AgentUnavailable(format!(
                            "{}: stream error: {}",
                            st.role, e
                        ));
                        return Some((Err(err), st));
                    }
                    Ok(Some(Ok(bytes))) => {
                        st.pending.push_str(&String::from_utf8_lossy(&bytes));
                        if drain_sse_frames(&mut st.pending, &mut st.queue) {
                            st.done = true;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn last_usage(&self) -> Option<TokenUsage> {
        self.usage.lock().await.clone()
    }
}

struct SseDecoder {
    role: AgentRole,
    body: Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>,
    pending: String,
    queue: VecDeque<StreamChunk>,
    timeout: Duration,
    done: bool,
}

/// Drain complete SSE frames from `pending` into `queue`.
///
/// A frame is a line starting with `data:`; the payload is either the
/// literal `[DONE]` (returns `true`) or a chunk JSON whose
/// `choices[0].delta.content` and `choices[0].finish_reason` are extracted.
/// Lines that fail to parse are skipped.
pub(crate) fn drain_sse_frames(pending: &mut String, queue: &mut VecDeque<StreamChunk>) -> bool {
    let mut finished = false;
    while let Some(pos) = pending.find('\n') {
        let line: String = pending.drain(..=pos).collect();
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            finished = true;
            break;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            continue;
        };
        let choice = value.get("choices").and_then(|c| c.get(0));
        let content = choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|f| f.as_str())
            .map(|f| f.to_string());
        if !content.is_empty() || finish_reason.is_some() {
            queue.push_back(StreamChunk {
                content,
                finish_reason,
            });
        }
    }
    finished
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_sse_frames_basic() {
        let mut pending = String::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n",
        );
        let mut queue = VecDeque::new();
        let done = drain_sse_frames(&mut pending, &mut queue);
        assert!(!done);
        let joined: String = queue.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(joined, "Hello");
    }

    #[test]
    fn test_drain_sse_frames_done_marker() {
        let mut pending = String::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\ndata: [DONE]\n",
        );
        let mut queue = VecDeque::new();
        let done = drain_sse_frames(&mut pending, &mut queue);
        assert!(done);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_sse_frames_partial_frame_stays_pending() {
        let mut pending = String::from("data: {\"choices\":[{\"delta\":{\"cont");
        let mut queue = VecDeque::new();
        let done = drain_sse_frames(&mut pending, &mut queue);
        assert!(!done);
        assert!(queue.is_empty());
        assert!(!pending.is_empty());

        pending.push_str("ent\":\"ok\"}}]}\n");
        drain_sse_frames(&mut pending, &mut queue);
        assert_eq!(queue.pop_front().unwrap().content, "ok");
    }

    #[test]
    fn test_drain_sse_frames_skips_garbage() {
        let mut pending = String::from(": keepalive\ndata: not json\ndata: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n");
        let mut queue = VecDeque::new();
        drain_sse_frames(&mut pending, &mut queue);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].content, "a");
    }

    #[test]
    fn test_default_call_options() {
        let options = CallOptions::default();
        assert!((options.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(options.max_tokens, 4096);
        assert!(!options.stream);
        assert!(options.timeout_ms.is_none());
    }
}
