//! Client for the external tool server.
//!
//! Codebase retrieval (file reads, structure overviews, code search, test
//! runs) lives behind an opaque REST endpoint: `POST /api/tool` with a
//! `{tool, args}` body and a JSON result. Only the planner stage calls
//! tools, and the pipeline bounds how many calls it may make per task.
//!
//! Failures map onto two taxonomy kinds: transport or non-2xx answers are
//! [`ToolUnavailable`](crate::makerflow::error::OrchestratorError::ToolUnavailable),
//! 2xx answers whose body is not usable JSON are
//! [`ToolInvalidResult`](crate::makerflow::error::OrchestratorError::ToolInvalidResult).

use std::time::Duration;

use crate::makerflow::client::get_shared_http_client;
use crate::makerflow::error::OrchestratorError;

/// Default deadline for a tool call.
const TOOL_TIMEOUT: Duration = Duration::from_secs(15);

/// Tools the planner is allowed to request.
pub const KNOWN_TOOLS: &[&str] = &["read_file", "analyze_codebase", "search_code", "run_tests"];

/// Thin client over the tool server's single endpoint.
pub struct ToolServerClient {
    base_url: String,
    timeout: Duration,
}

impl ToolServerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: TOOL_TIMEOUT,
        }
    }

    /// Invoke a named tool with JSON arguments and return the JSON result.
    pub async fn invoke(
        &self,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let url = format!("{}/api/tool", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({ "tool": tool, "args": args });

        let started = std::time::Instant::now();
        let send = get_shared_http_client().post(&url).json(&body).send();
        let resp = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| {
                OrchestratorError::ToolUnavailable(format!(
                    "{}: no response within {} ms",
                    tool,
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| OrchestratorError::ToolUnavailable(format!("{}: {}", tool, e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| OrchestratorError::ToolUnavailable(format!("{}: {}", tool, e)))?;

        if !status.is_success() {
            return Err(OrchestratorError::ToolUnavailable(format!(
                "{}: HTTP {}",
                tool,
                status.as_u16()
            )));
        }

        let value = serde_json::from_str::<serde_json::Value>(&text).map_err(|e| {
            OrchestratorError::ToolInvalidResult(format!("{}: {}", tool, e))
        })?;

        log::debug!(
            "tool_call tool={} latency_ms={} result_bytes={}",
            tool,
            started.elapsed().as_millis(),
            text.len()
        );
        Ok(value)
    }

    pub async fn read_file(&self, path: &str) -> Result<serde_json::Value, OrchestratorError> {
        self.invoke("read_file", serde_json::json!({ "path": path })).await
    }

    pub async fn analyze_codebase(&self) -> Result<serde_json::Value, OrchestratorError> {
        self.invoke("analyze_codebase", serde_json::json!({})).await
    }

    pub async fn search_code(&self, query: &str) -> Result<serde_json::Value, OrchestratorError> {
        self.invoke("search_code", serde_json::json!({ "query": query })).await
    }

    pub async fn run_tests(&self, path: &str) -> Result<serde_json::Value, OrchestratorError> {
        self.invoke("run_tests", serde_json::json!({ "path": path })).await
    }
}
