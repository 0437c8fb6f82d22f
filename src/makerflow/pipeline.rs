//! The staged pipeline engine.
//!
//! One [`Pipeline`] instance drives every task in the process. A task moves
//! through the stage machine
//!
//! ```text
//! created -> preprocessing -> planning -> coding -> voting -> reviewing
//!                                |                              |
//!                                | (question intent)            | approved -> complete
//!                                v                              | rejected, iterations left -> coding
//!                             complete                          | otherwise -> max_iterations_exceeded
//! ```
//!
//! with the updated [`TaskState`] persisted to the KV store after every
//! transition (write, then proceed), so a crash mid-stage leaves a
//! recoverable record and [`Pipeline::resume`] replays from the last
//! completed stage.
//!
//! Progress is streamed as an ordered sequence of text chunks with stage
//! tags (`[PREPROCESSOR]`, `[PLANNER]`, `[MAKER] ...`, `[REVIEWER]`); the
//! request server forwards these verbatim to the client. A dropped receiver
//! (client disconnect) cancels the run at the next chunk boundary without
//! marking the task failed, leaving it resumable.
//!
//! Within a task, stages are strictly sequential; the only internal fan-out
//! is the MAKER round. Across tasks, pipelines run independently and share
//! only the KV store and the reasoning-chain store.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::makerflow::agent::{AgentRole, ValidatorMode};
use crate::makerflow::client::{AgentBackend, CallOptions};
use crate::makerflow::config::OrchestratorConfig;
use crate::makerflow::context::{BackendSummarizer, ConversationContext};
use crate::makerflow::error::OrchestratorError;
use crate::makerflow::melodic::{ActionKind, MelodicStore};
use crate::makerflow::prompts;
use crate::makerflow::store::{acquire_lease, load_task, release_lease, save_task, KvStore};
use crate::makerflow::task::{Intent, TaskState, TaskStatus, Verdict};
use crate::makerflow::tools::{ToolServerClient, KNOWN_TOOLS};
use crate::makerflow::voter::{self, MakerConfig};

/// Sender side of a task's progress stream.
pub type StreamSender = mpsc::Sender<String>;

/// Sentinel distinguishing a dropped client from real failures.
const DISCONNECTED: &str = "client disconnected";

/// Reviewer code excerpt bound for planner reflection.
const REFLECTION_CODE_CHARS: usize = 4_000;

/// Process-wide pipeline engine. Cheap to share behind an `Arc`.
pub struct Pipeline {
    backend: Arc<dyn AgentBackend>,
    store: Arc<dyn KvStore>,
    melodic: Arc<MelodicStore>,
    tools: Option<Arc<ToolServerClient>>,
    config: Arc<OrchestratorConfig>,
}

impl Pipeline {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        store: Arc<dyn KvStore>,
        melodic: Arc<MelodicStore>,
        tools: Option<Arc<ToolServerClient>>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            backend,
            store,
            melodic,
            tools,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn melodic(&self) -> &Arc<MelodicStore> {
        &self.melodic
    }

    pub fn config(&self) -> &Arc<OrchestratorConfig> {
        &self.config
    }

    /// Load a task for resumption.
    ///
    /// Resuming a task that already reached a terminal state is a no-op;
    /// the caller gets the terminal record back and can serve its artifact
    /// directly.
    pub async fn resume(&self, task_id: &str) -> Result<TaskState, OrchestratorError> {
        match load_task(self.store.as_ref(), task_id).await? {
            Some(task) => Ok(task),
            None => Err(OrchestratorError::TaskNotFound(task_id.to_string())),
        }
    }

    /// Drive a task to a terminal state, streaming progress chunks.
    ///
    /// Returns the final task state plus the error that terminated it, if
    /// any. Loop signals (`ValidationRejected`, `CandidateExhaustion`) are
    /// consumed internally and never surface here; `MaxIterationsExceeded`
    /// surfaces as a terminal *status* with no error. A disconnected client
    /// stops the run early with neither a terminal status nor an error.
    pub async fn run(
        &self,
        mut task: TaskState,
        tx: StreamSender,
    ) -> (TaskState, Option<OrchestratorError>) {
        let correlation_id = Uuid::new_v4();

        let lease = match acquire_lease(self.store.as_ref(), &task.task_id).await {
            Ok(owner) => owner,
            Err(err) => {
                let _ = tx.send(err.stream_tag()).await;
                log::warn!(
                    "task {} not started (correlation {}): {}",
                    task.task_id,
                    correlation_id,
                    err
                );
                return (task, Some(err));
            }
        };

        let outcome = self.drive(&mut task, &tx).await;

        let error = match outcome {
            Ok(()) => {
                if task.status == TaskStatus::MaxIterationsExceeded {
                    let _ = tx
                        .send(OrchestratorError::MaxIterationsExceeded.stream_tag())
                        .await;
                }
                log::info!(
                    "task {} finished with status {} after {} iterations ({} tokens)",
                    task.task_id,
                    task.status.as_str(),
                    task.iteration,
                    task.total_tokens
                );
                None
            }
            Err(OrchestratorError::Internal(ref msg)) if msg.as_str() == DISCONNECTED => {
                // Keep the task resumable: persist progress, no terminal state.
                let _ = self.persist(&task).await;
                log::info!(
                    "task {} paused at {} after client disconnect (correlation {})",
                    task.task_id,
                    task.status.as_str(),
                    correlation_id
                );
                None
            }
            Err(err) => {
                task.failure = Some(err.error_type().to_string());
                task.set_status(TaskStatus::Failed);
                let _ = self.persist(&task).await;
                let _ = tx.send(err.stream_tag()).await;
                log::error!(
                    "task {} failed (correlation {}): {}",
                    task.task_id,
                    correlation_id,
                    err
                );
                Some(err)
            }
        };

        let _ = release_lease(self.store.as_ref(), &task.task_id, &lease).await;
        (task, error)
    }

    async fn drive(
        &self,
        task: &mut TaskState,
        tx: &StreamSender,
    ) -> Result<(), OrchestratorError> {
        if let Err(e) = self.melodic.open_task(&task.task_id, &task.user_input).await {
            log::warn!("reasoning chain unavailable for task {}: {}", task.task_id, e);
        }

        let mut context = self.seed_context(task);
        let summarizer = BackendSummarizer::new(Arc::clone(&self.backend));

        loop {
            match task.status {
                TaskStatus::Created => {
                    task.set_status(TaskStatus::Preprocessing);
                }
                TaskStatus::Preprocessing => {
                    self.stage_preprocess(task, &mut context, tx).await?;
                    task.set_status(TaskStatus::Planning);
                }
                TaskStatus::Planning => {
                    self.stage_plan(task, &mut context, tx).await?;
                    if task.intent == Some(Intent::Question) {
                        task.set_status(TaskStatus::Complete);
                    } else {
                        task.set_status(TaskStatus::Coding);
                    }
                }
                // A task persisted mid-vote resumes from candidate
                // generation: candidates are discarded after each round, so
                // voting cannot replay on its own. That round already
                // charged its iteration before the voting transition was
                // persisted, so a mid-round resume must not charge it again
                // (nor trip the iteration cap for a legitimately started
                // final round).
                TaskStatus::Coding | TaskStatus::Voting => {
                    let mid_round_resume = task.status == TaskStatus::Voting;
                    if !mid_round_resume && task.iteration >= task.max_iterations {
                        task.set_status(TaskStatus::MaxIterationsExceeded);
                    } else {
                        if !mid_round_resume {
                            task.iteration += 1;
                        }
                        task.set_status(TaskStatus::Coding);
                        self.persist(task).await?;
                        match self.stage_code(task, &context, tx).await {
                            Ok(code) => {
                                context.append("assistant", &code);
                                task.code = Some(code);
                                task.set_status(TaskStatus::Reviewing);
                            }
                            Err(OrchestratorError::CandidateExhaustion) => {
                                self.emit(tx, "[MAKER] No usable candidate this round")
                                    .await?;
                                if task.iteration >= task.max_iterations {
                                    task.set_status(TaskStatus::MaxIterationsExceeded);
                                } else {
                                    task.set_status(TaskStatus::Coding);
                                }
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
                TaskStatus::Reviewing => {
                    match self.stage_review(task, &context, tx).await {
                        Ok(verdict) => {
                            task.verdict = Some(verdict);
                            task.set_status(TaskStatus::Complete);
                        }
                        Err(OrchestratorError::ValidationRejected(feedback)) => {
                            task.verdict = Some(Verdict {
                                approved: false,
                                feedback: feedback.clone(),
                            });
                            if task.iteration < task.max_iterations {
                                context.append("reviewer", &feedback);
                                task.set_status(TaskStatus::Coding);
                            } else {
                                task.set_status(TaskStatus::MaxIterationsExceeded);
                            }
                        }
                        Err(err) => return Err(err),
                    }
                }
                TaskStatus::Complete | TaskStatus::Failed | TaskStatus::MaxIterationsExceeded => {
                    break;
                }
            }

            self.persist(task).await?;
            if let Err(e) = context.compress_if_needed(&summarizer).await {
                log::warn!("context compression failed for task {}: {}", task.task_id, e);
            }
        }

        Ok(())
    }

    /// Rebuild the conversation context from persisted artifacts, so a
    /// resumed task sees the same history an uninterrupted run would.
    fn seed_context(&self, task: &TaskState) -> ConversationContext {
        let mut context = ConversationContext::new(self.config.max_context_tokens);
        context.append("user", &task.user_input);
        if let Some(pre) = &task.preprocessed {
            context.append("preprocessor", pre);
        }
        if let Some(plan) = &task.plan {
            context.append("planner", plan);
        }
        if let Some(code) = &task.code {
            context.append("assistant", code);
        }
        if let Some(verdict) = &task.verdict {
            if !verdict.approved && !verdict.feedback.is_empty() {
                context.append("reviewer", &verdict.feedback);
            }
        }
        context
    }

    async fn stage_preprocess(
        &self,
        task: &mut TaskState,
        context: &mut ConversationContext,
        tx: &StreamSender,
    ) -> Result<(), OrchestratorError> {
        self.emit(tx, "[PREPROCESSOR] Normalizing request…").await?;

        let options = CallOptions {
            temperature: 0.2,
            max_tokens: 1024,
            ..CallOptions::default()
        };
        let user_input = task.user_input.clone();
        let raw = self
            .call_agent(task, AgentRole::Preprocessor, &user_input, &options)
            .await?;

        let (normalized, intent) = prompts::parse_preprocess(&raw, &user_input);
        self.emit(tx, format!("[PREPROCESSOR] intent={}", intent_tag(intent)))
            .await?;

        context.append("preprocessor", &normalized);
        self.record(
            task,
            AgentRole::Preprocessor,
            ActionKind::Preprocess,
            &user_input,
            &normalized,
            &format!("normalized the request and classified it as {}", intent_tag(intent)),
        )
        .await;

        task.preprocessed = Some(normalized);
        task.intent = Some(intent);
        Ok(())
    }

    async fn stage_plan(
        &self,
        task: &mut TaskState,
        context: &mut ConversationContext,
        tx: &StreamSender,
    ) -> Result<(), OrchestratorError> {
        self.emit(tx, "[PLANNER] Planning…").await?;

        let description = task
            .preprocessed
            .clone()
            .unwrap_or_else(|| task.user_input.clone());
        let chain_context = self
            .melodic
            .context_for(&task.task_id, AgentRole::Planner)
            .await;

        let mut prompt = String::new();
        prompt.push_str("Task:\n");
        prompt.push_str(&description);
        if !chain_context.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&chain_context);
        }
        if self.tools.is_some() {
            prompt.push_str("\n\nAvailable codebase tools: ");
            prompt.push_str(&KNOWN_TOOLS.join(", "));
        }

        let options = CallOptions::default();
        let mut tool_calls = 0usize;
        let plan = loop {
            let raw = self
                .call_agent(task, AgentRole::Planner, &prompt, &options)
                .await?;

            let Some(tools) = &self.tools else {
                break raw;
            };
            let Some((name, args)) = prompts::parse_tool_call(&raw) else {
                break raw;
            };
            if tool_calls >= self.config.max_planner_tool_calls {
                log::warn!(
                    "task {}: planner hit the tool budget ({}), forcing a plan",
                    task.task_id,
                    self.config.max_planner_tool_calls
                );
                prompt.push_str(
                    "\n\nTool budget exhausted. Produce your final plan or answer now.",
                );
                break self
                    .call_agent(task, AgentRole::Planner, &prompt, &options)
                    .await?;
            }
            tool_calls += 1;

            let result_text = if !KNOWN_TOOLS.contains(&name.as_str()) {
                format!("Tool '{}' is not available.", name)
            } else {
                let result = match name.as_str() {
                    "read_file" => {
                        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
                        tools.read_file(path).await
                    }
                    "analyze_codebase" => tools.analyze_codebase().await,
                    "search_code" => {
                        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
                        tools.search_code(query).await
                    }
                    "run_tests" => {
                        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
                        tools.run_tests(path).await
                    }
                    // KNOWN_TOOLS membership was checked above; this arm
                    // only fires if the list grows without a typed wrapper.
                    _ => tools.invoke(&name, args).await,
                };
                match result {
                    Ok(value) => value.to_string(),
                    Err(err) => {
                        log::warn!("task {}: tool call failed: {}", task.task_id, err);
                        format!("Tool '{}' failed: {}", name, err)
                    }
                }
            };
            prompt.push_str(&format!("\n\nTool result ({}): {}", name, result_text));
        };

        context.append("planner", &plan);
        let reasoning = match task.intent {
            Some(Intent::Question) => "answered the question directly, no code required".to_string(),
            _ => format!("produced an ordered plan after {} tool consultations", tool_calls),
        };
        self.record(
            task,
            AgentRole::Planner,
            ActionKind::Plan,
            &description,
            &plan,
            &reasoning,
        )
        .await;

        if task.intent == Some(Intent::Question) {
            // The plan is the answer; stream it as the payload.
            self.emit(tx, plan.clone()).await?;
        } else {
            self.emit(tx, "[PLANNER] Plan ready").await?;
        }

        task.plan = Some(plan);
        Ok(())
    }

    /// One MAKER round: generate, persist the voting transition, vote.
    async fn stage_code(
        &self,
        task: &mut TaskState,
        context: &ConversationContext,
        tx: &StreamSender,
    ) -> Result<String, OrchestratorError> {
        let maker = MakerConfig {
            num_candidates: self.config.num_candidates,
            win_threshold: self.config.vote_threshold,
            ..MakerConfig::default()
        };

        self.emit(
            tx,
            format!(
                "[MAKER] Generating {} candidates… (iteration {}/{})",
                maker.num_candidates, task.iteration, task.max_iterations
            ),
        )
        .await?;

        let description = task
            .preprocessed
            .clone()
            .unwrap_or_else(|| task.user_input.clone());
        let plan = task.plan.clone().unwrap_or_default();
        let chain_context = self
            .melodic
            .context_for(&task.task_id, AgentRole::Coder)
            .await;
        let conversation = context.render(self.config.max_context_tokens);

        let mut coder_prompt = format!("Task:\n{}\n\nPlan:\n{}", description, plan);
        if !chain_context.is_empty() {
            coder_prompt.push_str("\n\n");
            coder_prompt.push_str(&chain_context);
        }
        if !conversation.is_empty() {
            coder_prompt.push_str("\n\nConversation so far:\n");
            coder_prompt.push_str(&conversation);
        }

        let survivors =
            voter::generate_candidates(Arc::clone(&self.backend), &maker, &coder_prompt).await?;

        task.set_status(TaskStatus::Voting);
        self.persist(task).await?;
        self.emit(
            tx,
            format!("[MAKER] Voting on {} candidates…", survivors.len()),
        )
        .await?;

        let outcome =
            voter::select_winner(Arc::clone(&self.backend), &maker, &description, survivors)
                .await?;

        self.record(
            task,
            AgentRole::Coder,
            ActionKind::Generate,
            &plan,
            &outcome.winner.code,
            &format!(
                "sampled {} candidates across the temperature ladder, {} survived filtering",
                maker.num_candidates, outcome.survivors
            ),
        )
        .await;
        self.record(
            task,
            AgentRole::Voter,
            ActionKind::Vote,
            "labeled candidates",
            &format!("winner {}", outcome.winner.label),
            &outcome.summary(),
        )
        .await;

        self.emit(tx, format!("[MAKER] Vote complete: {}", outcome.summary()))
            .await?;
        self.emit(tx, outcome.winner.code.clone()).await?;
        Ok(outcome.winner.code)
    }

    async fn stage_review(
        &self,
        task: &mut TaskState,
        context: &ConversationContext,
        tx: &StreamSender,
    ) -> Result<Verdict, OrchestratorError> {
        self.emit(tx, "[REVIEWER] Reviewing…").await?;

        let description = task
            .preprocessed
            .clone()
            .unwrap_or_else(|| task.user_input.clone());
        let plan = task.plan.clone().unwrap_or_default();
        let code = task.code.clone().unwrap_or_default();

        let raw = match self.config.validator_mode {
            ValidatorMode::High => {
                let prompt = format!("Task:\n{}\n\nPlan:\n{}\n\nCode:\n{}", description, plan, code);
                match self
                    .call_agent(task, AgentRole::Validator, &prompt, &CallOptions::default())
                    .await
                {
                    Ok(raw) => raw,
                    Err(OrchestratorError::AgentUnavailable(detail)) => {
                        // Reviewer down: fall back to planner reflection.
                        log::warn!(
                            "task {}: validator unavailable ({}), falling back to planner reflection",
                            task.task_id,
                            detail
                        );
                        self.reflect(task, &plan, &code, context).await?
                    }
                    Err(err) => return Err(err),
                }
            }
            ValidatorMode::Low => self.reflect(task, &plan, &code, context).await?,
        };

        let verdict = prompts::parse_verdict(&raw);
        self.record(
            task,
            AgentRole::Validator,
            ActionKind::Review,
            &code,
            if verdict.approved { "approved" } else { "failed" },
            &if verdict.approved {
                "the code satisfies the plan".to_string()
            } else {
                format!("rejected: {}", verdict.feedback)
            },
        )
        .await;

        if verdict.approved {
            self.emit(tx, "[REVIEWER] approved").await?;
            Ok(verdict)
        } else {
            self.emit(tx, format!("[REVIEWER] rejected: {}", verdict.feedback))
                .await?;
            // Rejection is the loop signal, not a fault.
            Err(OrchestratorError::ValidationRejected(verdict.feedback))
        }
    }

    /// Planner reflection: review via the planner endpoint with the
    /// reflection prompt and a bounded code excerpt.
    async fn reflect(
        &self,
        task: &mut TaskState,
        plan: &str,
        code: &str,
        context: &ConversationContext,
    ) -> Result<String, OrchestratorError> {
        let excerpt: String = code.chars().take(REFLECTION_CODE_CHARS).collect();
        let narrative = context.render(2_000);
        let prompt = format!(
            "Plan:\n{}\n\nGenerated code:\n{}\n\nContext:\n{}",
            plan, excerpt, narrative
        );
        let raw = self
            .backend
            .call_sync(
                AgentRole::Planner,
                prompts::REFLECTION_PROMPT,
                &prompt,
                &CallOptions::default(),
            )
            .await?;
        self.harvest_usage(task).await;
        Ok(raw)
    }

    /// Invoke an agent with its role prompt and harvest token usage.
    async fn call_agent(
        &self,
        task: &mut TaskState,
        role: AgentRole,
        user_prompt: &str,
        options: &CallOptions,
    ) -> Result<String, OrchestratorError> {
        let raw = self
            .backend
            .call_sync(role, role.system_prompt(), user_prompt, options)
            .await?;
        self.harvest_usage(task).await;
        Ok(raw)
    }

    async fn harvest_usage(&self, task: &mut TaskState) {
        if let Some(usage) = self.backend.last_usage().await {
            task.total_tokens += usage.total_tokens;
        }
    }

    /// Record a reasoning node, degrading gracefully on store trouble.
    async fn record(
        &self,
        task: &TaskState,
        agent: AgentRole,
        kind: ActionKind,
        input: &str,
        output: &str,
        reasoning: &str,
    ) {
        let result = self
            .melodic
            .record(
                &task.task_id,
                agent,
                kind,
                &clip(input, 240),
                &clip(output, 240),
                reasoning,
            )
            .await;
        if let Err(e) = result {
            log::warn!("task {}: reasoning record failed: {}", task.task_id, e);
        }
    }

    async fn persist(&self, task: &TaskState) -> Result<(), OrchestratorError> {
        save_task(self.store.as_ref(), task, self.config.task_ttl).await
    }

    async fn emit(
        &self,
        tx: &StreamSender,
        chunk: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        tx.send(chunk.into())
            .await
            .map_err(|_| OrchestratorError::Internal(DISCONNECTED.to_string()))
    }
}

fn intent_tag(intent: Intent) -> &'static str {
    match intent {
        Intent::Question => "question",
        Intent::SimpleCode => "simple_code",
        Intent::ComplexCode => "complex_code",
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
