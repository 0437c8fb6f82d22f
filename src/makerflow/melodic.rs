//! Shared reasoning-chain memory: the melodic line.
//!
//! Every agent action on a task appends a [`ReasoningNode`] describing what
//! the agent saw, what it produced, and why. The per-task chain is the
//! "melodic line": later agents receive a rendered view of all prior
//! reasoning, not just prior outputs, so intent survives the hops between
//! pipeline stages.
//!
//! Nodes are append-only and SHA-256 hash-chained to their predecessor, so
//! tampering with a persisted chain is detectable via
//! [`MelodicLine::verify_integrity`]. Each task's chain is persisted as
//! newline-delimited JSON (a header line followed by one node per line) and
//! is reloaded on restart.
//!
//! The store is optional: when disabled (or when the state directory is not
//! writable) the pipeline runs without injected chain context and nothing
//! fails.
//!
//! # Structure
//!
//! ```text
//! task chain (.jsonl on disk)
//!   header  {"task_id": "...", "user_input": "...", "created_at": ...}
//!   node 0  preprocessor/preprocess   prev_id=None    hash=ab12...
//!   node 1  planner/plan              prev_id=node 0  prev_hash=ab12...
//!   node 2  coder/generate            prev_id=node 1  ...
//!   node 3  validator/review          prev_id=node 2  ...
//! ```
//!
//! Within a task the `prev_id` links form a linear chain in action order.
//! The `coordinates_with` field is reserved for sibling-candidate edges and
//! stays empty in the default configuration.
//!
//! # Example
//!
//! ```rust
//! use makerflow::agent::AgentRole;
//! use makerflow::melodic::{ActionKind, MelodicStore};
//!
//! # async {
//! let store = MelodicStore::in_memory();
//! store.open_task("t1", "write a csv parser").await.unwrap();
//! store
//!     .record(
//!         "t1",
//!         AgentRole::Planner,
//!         ActionKind::Plan,
//!         "normalized task",
//!         "1. tokenize 2. parse rows",
//!         "split parsing from IO so rows stream",
//!     )
//!     .await
//!     .unwrap();
//!
//! let context = store.context_for("t1", AgentRole::Coder).await;
//! assert!(context.contains("planner"));
//! # };
//! ```

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::makerflow::agent::AgentRole;
use crate::makerflow::error::OrchestratorError;

/// Character budget for a rendered chain-context block.
const CONTEXT_CHAR_BUDGET: usize = 4_000;
/// How much of each node's output summary the rendered block quotes.
const OUTPUT_PREVIEW_CHARS: usize = 160;

/// What kind of action a node records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Preprocess,
    Plan,
    Generate,
    Vote,
    Review,
}

/// One recorded agent action on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningNode {
    /// Unique within the task. Appending a duplicate id is rejected.
    pub node_id: String,
    pub task_id: String,
    pub agent: AgentRole,
    pub kind: ActionKind,
    /// Short description of what the agent was given.
    pub input_summary: String,
    /// Short description of what the agent produced.
    pub output_summary: String,
    /// The agent's reasoning text, supplied by the pipeline.
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
    /// Predecessor action of the same task, `None` for the first action.
    pub prev_id: Option<String>,
    /// Sibling-candidate links, reserved for swarm coordination. Always
    /// empty in the default configuration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coordinates_with: Vec<String>,
    /// SHA-256 hex of the predecessor node (empty for the first).
    pub prev_hash: String,
    /// SHA-256 hex of this node's canonical fields.
    pub hash: String,
}

/// Chain file header, the first line of each `.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainHeader {
    task_id: String,
    user_input: String,
    created_at: DateTime<Utc>,
}

/// The append-only reasoning chain of a single task.
pub struct MelodicLine {
    task_id: String,
    user_input: String,
    created_at: DateTime<Utc>,
    nodes: Vec<ReasoningNode>,
    file_path: Option<PathBuf>,
}

impl MelodicLine {
    /// Create an empty chain. When `file_path` is set, the header is written
    /// immediately and every appended node is flushed as one JSON line.
    pub fn create(
        task_id: &str,
        user_input: &str,
        file_path: Option<PathBuf>,
    ) -> Result<Self, OrchestratorError> {
        let line = Self {
            task_id: task_id.to_string(),
            user_input: user_input.to_string(),
            created_at: Utc::now(),
            nodes: Vec::new(),
            file_path,
        };
        if let Some(path) = &line.file_path {
            let header = ChainHeader {
                task_id: line.task_id.clone(),
                user_input: line.user_input.clone(),
                created_at: line.created_at,
            };
            let mut file = OpenOptions::new().create(true).truncate(true).write(true).open(path)?;
            writeln!(file, "{}", serde_json::to_string(&header)?)?;
        }
        Ok(line)
    }

    /// Load a persisted chain from disk.
    pub fn load(path: PathBuf) -> Result<Self, OrchestratorError> {
        let file = fs::File::open(&path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| OrchestratorError::Internal(format!("empty chain file {:?}", path)))??;
        let header: ChainHeader = serde_json::from_str(&header_line)?;

        let mut nodes = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let node: ReasoningNode = serde_json::from_str(&line)?;
            nodes.push(node);
        }

        Ok(Self {
            task_id: header.task_id,
            user_input: header.user_input,
            created_at: header.created_at,
            nodes,
            file_path: Some(path),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn user_input(&self) -> &str {
        &self.user_input
    }

    pub fn nodes(&self) -> &[ReasoningNode] {
        &self.nodes
    }

    /// Append a node with an explicit id.
    ///
    /// Rejects a duplicate `(task, node_id)` pair. The node links to the
    /// current chain tip and carries the hash chain forward.
    pub fn append_with_id(
        &mut self,
        node_id: &str,
        agent: AgentRole,
        kind: ActionKind,
        input_summary: &str,
        output_summary: &str,
        reasoning: &str,
    ) -> Result<&ReasoningNode, OrchestratorError> {
        if self.nodes.iter().any(|n| n.node_id == node_id) {
            return Err(OrchestratorError::BadRequest(format!(
                "duplicate reasoning node id '{}' for task '{}'",
                node_id, self.task_id
            )));
        }

        let prev = self.nodes.last();
        let prev_id = prev.map(|n| n.node_id.clone());
        let prev_hash = prev.map(|n| n.hash.clone()).unwrap_or_default();
        let timestamp = Utc::now();
        let hash = compute_node_hash(
            node_id,
            &self.task_id,
            agent,
            kind,
            input_summary,
            output_summary,
            reasoning,
            &timestamp,
            prev_id.as_deref(),
            &prev_hash,
        );

        let node = ReasoningNode {
            node_id: node_id.to_string(),
            task_id: self.task_id.clone(),
            agent,
            kind,
            input_summary: input_summary.to_string(),
            output_summary: output_summary.to_string(),
            reasoning: reasoning.to_string(),
            timestamp,
            prev_id,
            coordinates_with: Vec::new(),
            prev_hash,
            hash,
        };

        if let Some(path) = &self.file_path {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", serde_json::to_string(&node)?)?;
        }

        self.nodes.push(node);
        Ok(self.nodes.last().unwrap())
    }

    /// Walk the chain and verify every hash link.
    ///
    /// Returns `false` on the first node whose `prev_hash` does not match
    /// its predecessor or whose `hash` does not match the recomputed digest.
    pub fn verify_integrity(&self) -> bool {
        let mut prev_hash = String::new();
        let mut prev_id: Option<&str> = None;
        for node in &self.nodes {
            if node.prev_hash != prev_hash || node.prev_id.as_deref() != prev_id {
                return false;
            }
            let expected = compute_node_hash(
                &node.node_id,
                &node.task_id,
                node.agent,
                node.kind,
                &node.input_summary,
                &node.output_summary,
                &node.reasoning,
                &node.timestamp,
                node.prev_id.as_deref(),
                &node.prev_hash,
            );
            if node.hash != expected {
                return false;
            }
            prev_hash = node.hash.clone();
            prev_id = Some(&node.node_id);
        }
        true
    }

    /// Render the chain as a bounded context block for the next agent.
    ///
    /// One entry per prior node: the agent's reasoning plus the head of its
    /// output. When the block would exceed the character budget the oldest
    /// entries are dropped, keeping the most recent reasoning.
    pub fn context_for(&self, next_agent: AgentRole) -> String {
        if self.nodes.is_empty() {
            return String::new();
        }

        let entries: Vec<String> = self
            .nodes
            .iter()
            .map(|node| {
                format!(
                    "{}: {}\n  Output: {}",
                    node.agent.as_str(),
                    node.reasoning,
                    preview(&node.output_summary, OUTPUT_PREVIEW_CHARS)
                )
            })
            .collect();

        let header = format!("=== PRIOR REASONING (for {}) ===\n", next_agent.as_str());
        let footer = "\n=== END PRIOR REASONING ===";
        let available = CONTEXT_CHAR_BUDGET.saturating_sub(header.len() + footer.len());

        let mut kept: Vec<&String> = Vec::new();
        let mut used = 0usize;
        for entry in entries.iter().rev() {
            let cost = entry.len() + 1;
            if used + cost > available {
                break;
            }
            used += cost;
            kept.push(entry);
        }
        if kept.is_empty() {
            return String::new();
        }
        kept.reverse();

        let mut block = header;
        for entry in kept {
            block.push_str(entry);
            block.push('\n');
        }
        block.push_str(footer);
        block
    }
}

/// Canonical SHA-256 of a node's fields, pipe-joined so any change to any
/// field changes the digest.
#[allow(clippy::too_many_arguments)]
fn compute_node_hash(
    node_id: &str,
    task_id: &str,
    agent: AgentRole,
    kind: ActionKind,
    input_summary: &str,
    output_summary: &str,
    reasoning: &str,
    timestamp: &DateTime<Utc>,
    prev_id: Option<&str>,
    prev_hash: &str,
) -> String {
    let kind_tag = serde_json::to_string(&kind).unwrap_or_default();
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        node_id,
        task_id,
        agent.as_str(),
        kind_tag,
        input_summary,
        output_summary,
        reasoning,
        timestamp.to_rfc3339(),
        prev_id.unwrap_or(""),
        prev_hash
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn preview(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push('…');
    }
    out
}

/// Sanitize a task id for use as a filename.
fn chain_filename(task_id: &str) -> String {
    let safe: String = task_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.jsonl", safe)
}

/// Process-wide store of per-task reasoning chains.
///
/// Chains for different tasks are independent; writes within one task are
/// serialized by the pipeline (one agent active per task at a time), so the
/// interior lock is only contended across tasks and by introspection reads.
pub struct MelodicStore {
    dir: Option<PathBuf>,
    enabled: bool,
    chains: RwLock<HashMap<String, MelodicLine>>,
}

impl MelodicStore {
    /// Store persisting chains under `dir`. Falls back to memory-only when
    /// the directory cannot be created.
    pub fn new(dir: PathBuf, enabled: bool) -> Self {
        let dir = match fs::create_dir_all(&dir) {
            Ok(()) => Some(dir),
            Err(e) => {
                log::warn!(
                    "reasoning-chain dir {:?} not writable ({}), running in-memory only",
                    dir,
                    e
                );
                None
            }
        };
        Self {
            dir,
            enabled,
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Memory-only store (tests, or deployments without a state dir).
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            enabled: true,
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Store that records nothing; every read renders empty.
    pub fn disabled() -> Self {
        Self {
            dir: None,
            enabled: false,
            chains: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn path_for(&self, task_id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(chain_filename(task_id)))
    }

    /// Create (or reload) the chain for a task. No-op when disabled or when
    /// the chain is already open.
    pub async fn open_task(&self, task_id: &str, user_input: &str) -> Result<(), OrchestratorError> {
        if !self.enabled {
            return Ok(());
        }
        let mut chains = self.chains.write().await;
        if chains.contains_key(task_id) {
            return Ok(());
        }
        let path = self.path_for(task_id);
        let line = match &path {
            Some(p) if p.exists() => MelodicLine::load(p.clone())?,
            _ => MelodicLine::create(task_id, user_input, path)?,
        };
        chains.insert(task_id.to_string(), line);
        Ok(())
    }

    /// Append an action node. Returns the new node id, or `None` when the
    /// store is disabled or the task was never opened (both degrade
    /// gracefully rather than failing the pipeline).
    pub async fn record(
        &self,
        task_id: &str,
        agent: AgentRole,
        kind: ActionKind,
        input_summary: &str,
        output_summary: &str,
        reasoning: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        let node_id = Uuid::new_v4().to_string();
        self.record_with_id(
            task_id,
            &node_id,
            agent,
            kind,
            input_summary,
            output_summary,
            reasoning,
        )
        .await
    }

    /// Append an action node with a caller-chosen id. A duplicate
    /// `(task_id, node_id)` pair is rejected.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_with_id(
        &self,
        task_id: &str,
        node_id: &str,
        agent: AgentRole,
        kind: ActionKind,
        input_summary: &str,
        output_summary: &str,
        reasoning: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        if !self.enabled {
            return Ok(None);
        }
        let mut chains = self.chains.write().await;
        let Some(line) = chains.get_mut(task_id) else {
            log::debug!("reasoning chain for task {} not open, skipping record", task_id);
            return Ok(None);
        };
        let node = line.append_with_id(
            node_id,
            agent,
            kind,
            input_summary,
            output_summary,
            reasoning,
        )?;
        Ok(Some(node.node_id.clone()))
    }

    /// Render the chain as a bounded context block for the next agent.
    /// Empty when disabled, unopened, or when the chain has no nodes yet.
    pub async fn context_for(&self, task_id: &str, next_agent: AgentRole) -> String {
        if !self.enabled {
            return String::new();
        }
        let chains = self.chains.read().await;
        match chains.get(task_id) {
            Some(line) => line.context_for(next_agent),
            None => String::new(),
        }
    }

    /// Read-only dump of a task's chain, reloading from disk when the chain
    /// is not in memory (e.g. after a restart).
    pub async fn chain(&self, task_id: &str) -> Option<Vec<ReasoningNode>> {
        if !self.enabled {
            return None;
        }
        {
            let chains = self.chains.read().await;
            if let Some(line) = chains.get(task_id) {
                return Some(line.nodes().to_vec());
            }
        }
        let path = self.path_for(task_id)?;
        if !path.exists() {
            return None;
        }
        match MelodicLine::load(path) {
            Ok(line) => Some(line.nodes().to_vec()),
            Err(e) => {
                log::warn!("failed to reload chain for task {}: {}", task_id, e);
                None
            }
        }
    }
}
