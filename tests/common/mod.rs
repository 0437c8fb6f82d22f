//! Shared test fixtures: a scripted agent backend and pipeline wiring.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use makerflow::agent::AgentRole;
use makerflow::client::{AgentBackend, CallOptions};
use makerflow::config::OrchestratorConfig;
use makerflow::error::OrchestratorError;
use makerflow::melodic::MelodicStore;
use makerflow::pipeline::Pipeline;
use makerflow::store::{KvStore, MemoryKvStore};

/// One recorded agent invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub role: AgentRole,
    pub user_prompt: String,
}

/// Backend with per-role scripted reply queues. When a queue runs dry the
/// role falls back to a sensible default so unscripted stages still flow.
pub struct ScriptedBackend {
    replies: Mutex<HashMap<AgentRole, VecDeque<Result<String, OrchestratorError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub async fn script(&self, role: AgentRole, reply: &str) {
        self.replies
            .lock()
            .await
            .entry(role)
            .or_default()
            .push_back(Ok(reply.to_string()));
    }

    pub async fn script_err(&self, role: AgentRole, err: OrchestratorError) {
        self.replies
            .lock()
            .await
            .entry(role)
            .or_default()
            .push_back(Err(err));
    }

    pub async fn count(&self, role: AgentRole) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.role == role)
            .count()
    }

    pub async fn prompts_for(&self, role: AgentRole) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.role == role)
            .map(|c| c.user_prompt.clone())
            .collect()
    }
}

fn default_reply(role: AgentRole) -> String {
    match role {
        AgentRole::Preprocessor => {
            r#"{"task": "default normalized task", "intent": "complex_code"}"#.to_string()
        }
        AgentRole::Planner => "1. implement the requested change".to_string(),
        AgentRole::Coder => "def generated():\n    return 1  # filler".to_string(),
        AgentRole::Voter => "A".to_string(),
        AgentRole::Validator => r#"{"status": "approved", "feedback": ""}"#.to_string(),
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn call_sync(
        &self,
        role: AgentRole,
        _system_prompt: &str,
        user_prompt: &str,
        _options: &CallOptions,
    ) -> Result<String, OrchestratorError> {
        self.calls.lock().await.push(RecordedCall {
            role,
            user_prompt: user_prompt.to_string(),
        });
        let scripted = self
            .replies
            .lock()
            .await
            .get_mut(&role)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(reply) => reply,
            None => Ok(default_reply(role)),
        }
    }
}

/// A pipeline over the scripted backend, an in-memory store, and an
/// in-memory reasoning chain. Returns the store too so tests can inspect
/// persisted task state.
pub fn test_pipeline(backend: Arc<ScriptedBackend>) -> (Arc<Pipeline>, Arc<MemoryKvStore>) {
    let store = Arc::new(MemoryKvStore::new());
    let kv: Arc<dyn KvStore> = Arc::clone(&store) as Arc<dyn KvStore>;
    let pipeline = Pipeline::new(
        backend,
        kv,
        Arc::new(MelodicStore::in_memory()),
        None,
        Arc::new(OrchestratorConfig::default()),
    );
    (Arc::new(pipeline), store)
}

/// Drive a task to completion, collecting every streamed unit.
pub async fn run_collect(
    pipeline: &Arc<Pipeline>,
    task: makerflow::task::TaskState,
) -> (
    makerflow::task::TaskState,
    Option<OrchestratorError>,
    Vec<String>,
) {
    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let pipeline = Arc::clone(pipeline);
    let handle = tokio::spawn(async move { pipeline.run(task, tx).await });
    let mut units = Vec::new();
    while let Some(unit) = rx.recv().await {
        units.push(unit);
    }
    let (task, error) = handle.await.expect("pipeline task panicked");
    (task, error, units)
}
