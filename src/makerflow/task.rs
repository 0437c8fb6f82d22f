//! Task state: the single mutable record a pipeline run operates on.
//!
//! A [`TaskState`] is created by the request server when a chat completion
//! arrives, mutated only by pipeline stage transitions, and serialized to
//! the KV store under `task:{id}` after every stage so an interrupted run
//! can resume from its last durable state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline stage the task is currently in (or terminated at).
///
/// Transitions are monotonic along the happy path; the only backward edge
/// is `Reviewing -> Coding` when the reviewer rejects and iterations remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Preprocessing,
    Planning,
    Coding,
    Voting,
    Reviewing,
    Complete,
    Failed,
    MaxIterationsExceeded,
}

impl TaskStatus {
    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::MaxIterationsExceeded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Preprocessing => "preprocessing",
            TaskStatus::Planning => "planning",
            TaskStatus::Coding => "coding",
            TaskStatus::Voting => "voting",
            TaskStatus::Reviewing => "reviewing",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::MaxIterationsExceeded => "max_iterations_exceeded",
        }
    }
}

/// Coarse classification of the user request, decided during preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Answerable with prose; the pipeline skips the coding stages entirely.
    Question,
    SimpleCode,
    ComplexCode,
}

/// Reviewer decision on the current candidate code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    /// What must change. Empty when approved. Fed back into the next coding
    /// round as a reviewer turn.
    pub feedback: String,
}

/// All mutable per-task state, serialized to the KV store as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Server-unique opaque id.
    pub task_id: String,
    /// The raw user message as received.
    pub user_input: String,
    pub status: TaskStatus,
    /// Number of coding rounds entered so far. Zero until the first MAKER
    /// round starts; never exceeds `max_iterations`.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Normalized task description from the preprocessor.
    pub preprocessed: Option<String>,
    pub intent: Option<Intent>,
    /// Latest plan, or the direct answer for question intent.
    pub plan: Option<String>,
    /// Latest winning candidate code.
    pub code: Option<String>,
    /// Latest reviewer verdict.
    pub verdict: Option<Verdict>,
    /// Short failure reason for `Failed` tasks. Full detail goes to the log.
    pub failure: Option<String>,
    /// Accumulated token usage reported by agent backends, when available.
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    /// Create a fresh task for a user message. Allocates a new task id.
    pub fn new(user_input: impl Into<String>, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            user_input: user_input.into(),
            status: TaskStatus::Created,
            iteration: 0,
            max_iterations,
            preprocessed: None,
            intent: None,
            plan: None,
            code: None,
            verdict: None,
            failure: None,
            total_tokens: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a new status and refresh the update timestamp.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// KV key for this task.
    pub fn store_key(&self) -> String {
        task_key(&self.task_id)
    }
}

/// KV key for a task id: `task:{id}`.
pub fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

/// KV key for a task's lease: `task:{id}:lock`.
pub fn lock_key(task_id: &str) -> String {
    format!("task:{}:lock", task_id)
}
