//! Bounded conversation context with hierarchical compression.
//!
//! A [`ConversationContext`] holds the ordered user/assistant/reviewer turns
//! of a task plus zero or more summary records standing in for older,
//! compacted ranges. The total estimated token count never exceeds the
//! configured budget: when an append pushes the context past the trigger
//! threshold (95% of budget), the oldest contiguous run of non-summary
//! records covering at least 30% of the budget is folded into a single
//! summary record produced by the summarizer. The most recent records are
//! never compressed.
//!
//! If summarization fails the context falls back to lossy truncation,
//! dropping the oldest non-recent records until the budget is met, and logs
//! a warning.
//!
//! Token counts are estimates (one token per four characters), the same
//! approximation used for session trimming throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use makerflow::context::ConversationContext;
//!
//! let mut context = ConversationContext::new(1_000);
//! context.append("user", "Write a parser for INI files");
//! context.append("assistant", "Plan: 1. tokenize lines ...");
//!
//! let rendered = context.render(500);
//! assert!(makerflow::context::estimate_tokens(&rendered) <= 500);
//! ```

use async_trait::async_trait;
use std::sync::Arc;

use crate::makerflow::agent::AgentRole;
use crate::makerflow::client::{AgentBackend, CallOptions};
use crate::makerflow::error::OrchestratorError;
use crate::makerflow::prompts;

/// Fraction of the budget at which compression triggers.
const TRIGGER_RATIO: f64 = 0.95;
/// Minimum fraction of the budget a compacted span must cover.
const SPAN_RATIO: f64 = 0.30;
/// Number of most-recent records that are never compressed.
const KEEP_RECENT: usize = 6;

/// Estimate the number of tokens in a string: one token per 4 characters.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// One (role, content) turn, or a summary standing in for an older range.
#[derive(Debug, Clone)]
pub struct ContextRecord {
    pub role: String,
    pub content: String,
    pub token_count: usize,
    /// True when this record is a compacted summary of older records.
    pub summary: bool,
}

/// Produces a summary for a span of conversation text.
///
/// The pipeline backs this with the preprocessor agent; tests use scripted
/// implementations.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, OrchestratorError>;
}

/// Summarizer backed by the Preprocessor agent with the dedicated
/// summarization prompt.
pub struct BackendSummarizer {
    backend: Arc<dyn AgentBackend>,
}

impl BackendSummarizer {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Summarizer for BackendSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, OrchestratorError> {
        let options = CallOptions {
            temperature: 0.2,
            max_tokens: 1024,
            ..CallOptions::default()
        };
        self.backend
            .call_sync(
                AgentRole::Preprocessor,
                prompts::SUMMARIZER_PROMPT,
                text,
                &options,
            )
            .await
    }
}

/// Ordered, budget-bounded conversation context.
pub struct ConversationContext {
    records: Vec<ContextRecord>,
    budget: usize,
}

impl ConversationContext {
    /// Create an empty context with the given token budget.
    pub fn new(budget: usize) -> Self {
        Self {
            records: Vec::new(),
            budget,
        }
    }

    /// Append a turn. Token count is computed here.
    pub fn append(&mut self, role: &str, content: &str) {
        self.records.push(ContextRecord {
            role: role.to_string(),
            content: content.to_string(),
            token_count: estimate_tokens(content),
            summary: false,
        });
    }

    /// Total estimated tokens across all records.
    pub fn total_tokens(&self) -> usize {
        self.records.iter().map(|r| r.token_count).sum()
    }

    /// Whether the context is past the compression trigger.
    pub fn needs_compression(&self) -> bool {
        self.total_tokens() as f64 > self.budget as f64 * TRIGGER_RATIO
    }

    pub fn records(&self) -> &[ContextRecord] {
        &self.records
    }

    pub fn non_summary_count(&self) -> usize {
        self.records.iter().filter(|r| !r.summary).count()
    }

    /// Compress if the trigger threshold is exceeded; no-op otherwise.
    ///
    /// Selects the oldest contiguous run of non-summary records covering at
    /// least 30% of the budget (never touching the most recent
    /// [`KEEP_RECENT`] records) and replaces it in place with one summary
    /// record, so ordering is preserved. Falls back to lossy truncation when
    /// the summarizer fails.
    ///
    /// Returns `true` when records were compacted or dropped.
    pub async fn compress_if_needed(
        &mut self,
        summarizer: &dyn Summarizer,
    ) -> Result<bool, OrchestratorError> {
        if !self.needs_compression() {
            return Ok(false);
        }

        let Some((start, end)) = self.select_span() else {
            log::warn!(
                "context over budget ({} tokens) but no compressible span; truncating",
                self.total_tokens()
            );
            self.truncate_to_budget();
            return Ok(true);
        };

        let joined: String = self.records[start..end]
            .iter()
            .map(|r| format!("{}: {}\n", r.role, r.content))
            .collect();

        match summarizer.summarize(&joined).await {
            Ok(summary) => {
                let record = ContextRecord {
                    role: "summary".to_string(),
                    token_count: estimate_tokens(&summary),
                    content: summary,
                    summary: true,
                };
                self.records.splice(start..end, std::iter::once(record));
                log::debug!(
                    "context compressed records {}..{} into one summary ({} tokens total)",
                    start,
                    end,
                    self.total_tokens()
                );
            }
            Err(err) => {
                log::warn!("context summarization failed ({}), truncating instead", err);
                self.truncate_to_budget();
            }
        }
        Ok(true)
    }

    /// Oldest contiguous non-summary run covering at least 30% of the
    /// budget, clear of the protected tail. Returns `None` when no
    /// compressible records exist.
    fn select_span(&self) -> Option<(usize, usize)> {
        let protected_from = self.records.len().saturating_sub(KEEP_RECENT);
        let start = self.records[..protected_from]
            .iter()
            .position(|r| !r.summary)?;

        let want = (self.budget as f64 * SPAN_RATIO) as usize;
        let mut covered = 0usize;
        let mut end = start;
        while end < protected_from && !self.records[end].summary {
            covered += self.records[end].token_count;
            end += 1;
            if covered >= want {
                break;
            }
        }
        if end == start {
            None
        } else {
            Some((start, end))
        }
    }

    /// Drop oldest non-protected records until the budget is met.
    fn truncate_to_budget(&mut self) {
        while self.total_tokens() > self.budget && self.records.len() > KEEP_RECENT {
            self.records.remove(0);
        }
    }

    /// Render the context into at most `max_tokens` estimated tokens.
    ///
    /// The tail (most recent records, summaries included) is preserved
    /// verbatim; older records that do not fit are omitted. When even the
    /// newest record alone exceeds the budget, its tail is kept.
    pub fn render(&self, max_tokens: usize) -> String {
        let mut included: Vec<String> = Vec::new();
        let mut used = 0usize;
        for record in self.records.iter().rev() {
            let formatted = if record.summary {
                format!("[summary] {}", record.content)
            } else {
                format!("{}: {}", record.role, record.content)
            };
            // +1 token for the separator between records.
            let cost = estimate_tokens(&formatted) + 1;
            if used + cost > max_tokens {
                break;
            }
            used += cost;
            included.push(formatted);
        }

        if included.is_empty() {
            // Nothing fits whole; keep the tail of the newest record.
            if let Some(newest) = self.records.last() {
                let prefix = format!("{}: ", newest.role);
                let keep_chars = max_tokens
                    .saturating_mul(4)
                    .saturating_sub(prefix.len() + 4);
                let content = &newest.content;
                let from = content.len().saturating_sub(keep_chars);
                let from = content
                    .char_indices()
                    .map(|(i, _)| i)
                    .find(|&i| i >= from)
                    .unwrap_or(content.len());
                return format!("{}{}", prefix, &content[from..]);
            }
            return String::new();
        }

        included.reverse();
        included.join("\n\n")
    }
}
