//! Error taxonomy for the orchestrator.
//!
//! Every component boundary in the crate reports failures through
//! [`OrchestratorError`]. The variants map one-to-one onto the kinds of
//! failure an operator can observe: transport trouble with an LLM backend,
//! tool-server trouble, voting that produced nothing usable, review loop
//! signals, and request-server conditions.
//!
//! Two variants are *signals* rather than faults: [`ValidationRejected`]
//! feeds the coding loop and [`MaxIterationsExceeded`] is the terminal state
//! of an exhausted loop. Everything else terminates the task as `failed`.
//!
//! [`ValidationRejected`]: OrchestratorError::ValidationRejected
//! [`MaxIterationsExceeded`]: OrchestratorError::MaxIterationsExceeded

use std::error::Error;
use std::fmt;

/// Errors that can occur while driving a task through the pipeline.
///
/// The enum is the crate's single error currency. Components construct the
/// variant that describes what happened; the request server maps the variant
/// to an HTTP status ([`http_status`](OrchestratorError::http_status)), a
/// machine-readable tag ([`error_type`](OrchestratorError::error_type)), and
/// a terminal stream chunk ([`stream_tag`](OrchestratorError::stream_tag)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// An agent endpoint was unreachable, or kept answering 5xx after the
    /// retry budget was spent. The message names the agent.
    AgentUnavailable(String),

    /// No bytes arrived from an agent endpoint within its deadline.
    AgentTimeout(String),

    /// An agent answered with a payload that does not conform to the
    /// chat-completion shape (no choices, non-JSON body, empty content).
    AgentMalformedResponse(String),

    /// The tool server was unreachable or answered with an error status.
    ToolUnavailable(String),

    /// The tool server answered 200 but the body was not a usable result.
    ToolInvalidResult(String),

    /// A MAKER round produced no candidate that survived filtering.
    CandidateExhaustion,

    /// The reviewer rejected the current code. Carries the feedback text
    /// that is fed back into the next coding round. Not a fault.
    ValidationRejected(String),

    /// The coding loop ran out of iterations without an approval.
    MaxIterationsExceeded,

    /// The context compressor could not fit the prompt into its budget even
    /// after summarization.
    ContextOverflow(String),

    /// No task with the given id exists in the store (or it expired).
    TaskNotFound(String),

    /// Another execution holds a live lease on the task.
    TaskLocked(String),

    /// The client payload was malformed.
    BadRequest(String),

    /// Anything unexpected: I/O trouble with the state directory,
    /// serialization bugs, joined-task panics.
    Internal(String),
}

impl OrchestratorError {
    /// Snake-case tag used in JSON error bodies and terminal stream chunks.
    pub fn error_type(&self) -> &'static str {
        match self {
            OrchestratorError::AgentUnavailable(_) => "agent_unavailable",
            OrchestratorError::AgentTimeout(_) => "agent_timeout",
            OrchestratorError::AgentMalformedResponse(_) => "agent_malformed_response",
            OrchestratorError::ToolUnavailable(_) => "tool_unavailable",
            OrchestratorError::ToolInvalidResult(_) => "tool_invalid_result",
            OrchestratorError::CandidateExhaustion => "candidate_exhaustion",
            OrchestratorError::ValidationRejected(_) => "validation_rejected",
            OrchestratorError::MaxIterationsExceeded => "max_iterations_exceeded",
            OrchestratorError::ContextOverflow(_) => "context_overflow",
            OrchestratorError::TaskNotFound(_) => "task_not_found",
            OrchestratorError::TaskLocked(_) => "task_locked",
            OrchestratorError::BadRequest(_) => "bad_request",
            OrchestratorError::Internal(_) => "internal",
        }
    }

    /// HTTP status the request server answers with when this error surfaces
    /// on a non-streaming response.
    ///
    /// `TaskLocked` maps to 503 so clients treat it as retryable; the lease
    /// that caused it expires within minutes.
    pub fn http_status(&self) -> u16 {
        match self {
            OrchestratorError::BadRequest(_) => 400,
            OrchestratorError::TaskNotFound(_) => 404,
            OrchestratorError::AgentTimeout(_) => 408,
            OrchestratorError::AgentUnavailable(_) | OrchestratorError::TaskLocked(_) => 503,
            _ => 500,
        }
    }

    /// Terminal chunk appended to a streaming response when the task fails,
    /// e.g. `[ERROR] agent_timeout`.
    pub fn stream_tag(&self) -> String {
        format!("[ERROR] {}", self.error_type())
    }

    /// Short, non-leaking message for client-facing error bodies.
    ///
    /// Upstream detail (agent response bodies, transport errors, file
    /// paths) stays in the server log; only request-level variants echo
    /// material the client supplied itself (task ids, payload problems).
    pub fn client_message(&self) -> String {
        match self {
            OrchestratorError::AgentUnavailable(_) => {
                "an agent backend is unavailable".to_string()
            }
            OrchestratorError::AgentTimeout(_) => "an agent backend timed out".to_string(),
            OrchestratorError::AgentMalformedResponse(_) => {
                "an agent backend returned an unusable response".to_string()
            }
            OrchestratorError::ToolUnavailable(_) => "the tool server is unavailable".to_string(),
            OrchestratorError::ToolInvalidResult(_) => {
                "the tool server returned an unusable result".to_string()
            }
            OrchestratorError::CandidateExhaustion => {
                "no usable candidate was produced".to_string()
            }
            OrchestratorError::ValidationRejected(_) => {
                "the generated code was rejected by review".to_string()
            }
            OrchestratorError::MaxIterationsExceeded => {
                "the iteration budget was exhausted".to_string()
            }
            OrchestratorError::ContextOverflow(_) => {
                "the conversation no longer fits the context budget".to_string()
            }
            OrchestratorError::TaskNotFound(id) => format!("task not found: {}", id),
            OrchestratorError::TaskLocked(id) => format!("task is locked: {}", id),
            OrchestratorError::BadRequest(msg) => format!("bad request: {}", msg),
            OrchestratorError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::AgentUnavailable(msg) => write!(f, "Agent unavailable: {}", msg),
            OrchestratorError::AgentTimeout(msg) => write!(f, "Agent timed out: {}", msg),
            OrchestratorError::AgentMalformedResponse(msg) => {
                write!(f, "Agent returned a malformed response: {}", msg)
            }
            OrchestratorError::ToolUnavailable(msg) => write!(f, "Tool server unavailable: {}", msg),
            OrchestratorError::ToolInvalidResult(msg) => {
                write!(f, "Tool server returned an invalid result: {}", msg)
            }
            OrchestratorError::CandidateExhaustion => {
                write!(f, "No usable candidate survived the generation round")
            }
            OrchestratorError::ValidationRejected(feedback) => {
                write!(f, "Validation rejected: {}", feedback)
            }
            OrchestratorError::MaxIterationsExceeded => {
                write!(f, "Maximum iterations exceeded without an approved result")
            }
            OrchestratorError::ContextOverflow(msg) => write!(f, "Context overflow: {}", msg),
            OrchestratorError::TaskNotFound(id) => write!(f, "Task not found: {}", id),
            OrchestratorError::TaskLocked(id) => write!(f, "Task is locked: {}", id),
            OrchestratorError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            OrchestratorError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl Error for OrchestratorError {}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Internal(format!("serialization: {}", e))
    }
}
