//! MAKER voting: decorrelated candidate generation plus first-to-K consensus.
//!
//! A round launches N concurrent coder calls with the same prompt but
//! temperatures spread across `[0.3, 0.3 + 0.1*(N-1)]`, labels the outputs
//! A, B, C, ... in launch order, filters out failures and trivially short
//! outputs, and then asks up to `2K - 1` voter agents to each name the best
//! label. The first label to collect K tallies wins and the remaining voter
//! calls are aborted; if the budget runs out first, the highest tally wins
//! with ties broken by launch order.
//!
//! The procedure rests on decorrelation: with per-candidate accuracy above
//! ~50%, independent errors vote each other out.
//!
//! Cancellation propagates structurally. All generation and voter calls
//! live in a [`tokio::task::JoinSet`], which aborts every outstanding task
//! when the set is dropped, so cancelling the pipeline cancels the round.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::makerflow::agent::AgentRole;
use crate::makerflow::client::{AgentBackend, CallOptions};
use crate::makerflow::error::OrchestratorError;
use crate::makerflow::prompts;

/// Knobs for one MAKER round.
#[derive(Debug, Clone)]
pub struct MakerConfig {
    /// N: concurrent candidate generations. Range 2..=10.
    pub num_candidates: usize,
    /// K: tallies needed for an early win. Requires `N >= 2K - 1`.
    pub win_threshold: usize,
    /// Candidates shorter than this (after trimming) are discarded.
    pub min_candidate_len: usize,
}

impl Default for MakerConfig {
    fn default() -> Self {
        Self {
            num_candidates: 5,
            win_threshold: 3,
            min_candidate_len: 20,
        }
    }
}

/// One surviving code candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Stable letter assigned in launch order: A, B, C, ...
    pub label: char,
    pub code: String,
    pub temperature: f32,
    /// Launch index, 0-based. `label` is derived from it.
    pub index: usize,
}

/// Result of a completed round.
#[derive(Debug)]
pub struct VoteOutcome {
    pub winner: Candidate,
    /// Per-label tallies in label order. Only labels that received at least
    /// one vote appear.
    pub tallies: Vec<(char, usize)>,
    /// Voter replies processed (valid votes and abstentions).
    pub votes_cast: usize,
    pub abstentions: usize,
    /// Candidates that survived filtering.
    pub survivors: usize,
}

impl VoteOutcome {
    /// One-line human summary for the progress stream, e.g.
    /// `B wins (B=3, A=1; 5 candidates, 4 votes)`.
    pub fn summary(&self) -> String {
        let tally_text = if self.tallies.is_empty() {
            "no votes".to_string()
        } else {
            self.tallies
                .iter()
                .map(|(label, count)| format!("{}={}", label, count))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "{} wins ({}; {} candidates, {} votes)",
            self.winner.label, tally_text, self.survivors, self.votes_cast
        )
    }
}

/// Temperature ladder: candidate `i` samples at `0.3 + 0.1 * i`.
pub fn temperature_for(index: usize) -> f32 {
    0.3 + 0.1 * index as f32
}

/// Label for launch index `i`: A, B, C, ...
pub fn label_for(index: usize) -> char {
    (b'A' + index as u8) as char
}

/// Run one full MAKER round: generate, filter, vote, select.
///
/// `coder_prompt` is the full user prompt for the coder agent (plan plus
/// injected context); `task_description` is the short task text shown to
/// voters alongside the candidates.
///
/// # Errors
///
/// [`CandidateExhaustion`](OrchestratorError::CandidateExhaustion) when no
/// candidate survives filtering. Individual coder or voter failures never
/// fail the round on their own.
pub async fn run_maker_round(
    backend: Arc<dyn AgentBackend>,
    config: &MakerConfig,
    task_description: &str,
    coder_prompt: &str,
) -> Result<VoteOutcome, OrchestratorError> {
    let survivors = generate_candidates(Arc::clone(&backend), config, coder_prompt).await?;
    select_winner(backend, config, task_description, survivors).await
}

/// Generation phase: launch N concurrent coder calls and filter the output.
///
/// # Errors
///
/// [`CandidateExhaustion`](OrchestratorError::CandidateExhaustion) when
/// nothing survives.
pub async fn generate_candidates(
    backend: Arc<dyn AgentBackend>,
    config: &MakerConfig,
    coder_prompt: &str,
) -> Result<Vec<Candidate>, OrchestratorError> {
    let mut set: JoinSet<(usize, f32, Result<String, OrchestratorError>)> = JoinSet::new();
    for i in 0..config.num_candidates {
        let backend = Arc::clone(&backend);
        let prompt = coder_prompt.to_string();
        let temperature = temperature_for(i);
        set.spawn(async move {
            let options = CallOptions {
                temperature,
                ..CallOptions::default()
            };
            let result = backend
                .call_sync(AgentRole::Coder, prompts::CODER_PROMPT, &prompt, &options)
                .await;
            (i, temperature, result)
        });
    }

    let mut survivors = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (index, temperature, result) = joined
            .map_err(|e| OrchestratorError::Internal(format!("candidate task join: {}", e)))?;
        match result {
            Ok(code) => {
                let trimmed = code.trim();
                if trimmed.len() < config.min_candidate_len {
                    log::debug!("candidate {} discarded: {} chars", label_for(index), trimmed.len());
                    continue;
                }
                survivors.push(Candidate {
                    label: label_for(index),
                    code: trimmed.to_string(),
                    temperature,
                    index,
                });
            }
            Err(err) => {
                log::warn!("candidate {} failed: {}", label_for(index), err);
            }
        }
    }

    if survivors.is_empty() {
        return Err(OrchestratorError::CandidateExhaustion);
    }
    survivors.sort_by_key(|c| c.index);
    Ok(survivors)
}

/// Selection phase: run the vote, or short-circuit when there are too few
/// survivors for a meaningful majority (fewer than K+1), in which case the
/// longest surviving candidate wins without spending any voter calls (ties
/// broken by launch order).
pub async fn select_winner(
    backend: Arc<dyn AgentBackend>,
    config: &MakerConfig,
    task_description: &str,
    survivors: Vec<Candidate>,
) -> Result<VoteOutcome, OrchestratorError> {
    log::info!(
        "maker round: {}/{} candidates survived filtering",
        survivors.len(),
        config.num_candidates
    );
    if survivors.is_empty() {
        return Err(OrchestratorError::CandidateExhaustion);
    }
    if survivors.len() < config.win_threshold + 1 {
        let winner = survivors
            .iter()
            .max_by(|a, b| {
                a.code
                    .len()
                    .cmp(&b.code.len())
                    .then(b.index.cmp(&a.index))
            })
            .cloned()
            .expect("survivors is non-empty");
        return Ok(VoteOutcome {
            winner,
            tallies: Vec::new(),
            votes_cast: 0,
            abstentions: 0,
            survivors: survivors.len(),
        });
    }
    let labels: Vec<char> = survivors.iter().map(|c| c.label).collect();
    let ballot = ballot_prompt(task_description, &survivors);
    let voter_budget = 2 * config.win_threshold - 1;

    let mut set: JoinSet<Result<String, OrchestratorError>> = JoinSet::new();
    for _ in 0..voter_budget {
        let backend = Arc::clone(&backend);
        let ballot = ballot.clone();
        set.spawn(async move {
            let options = CallOptions {
                temperature: 0.0,
                max_tokens: 16,
                ..CallOptions::default()
            };
            backend
                .call_sync(AgentRole::Voter, prompts::VOTER_PROMPT, &ballot, &options)
                .await
        });
    }

    let mut tallies: HashMap<char, usize> = HashMap::new();
    let mut votes_cast = 0usize;
    let mut abstentions = 0usize;
    let mut early_winner: Option<char> = None;

    while let Some(joined) = set.join_next().await {
        votes_cast += 1;
        let vote = match joined {
            Ok(Ok(reply)) => prompts::parse_vote(&reply, &labels),
            Ok(Err(err)) => {
                log::warn!("voter call failed, counting as abstention: {}", err);
                None
            }
            Err(e) => {
                log::warn!("voter task join failed, counting as abstention: {}", e);
                None
            }
        };

        match vote {
            Some(label) => {
                let count = tallies.entry(label).or_insert(0);
                *count += 1;
                if *count >= config.win_threshold {
                    early_winner = Some(label);
                    set.abort_all();
                    break;
                }
            }
            None => abstentions += 1,
        }
    }

    // Budget exhausted without an early winner: highest tally wins, ties
    // broken by launch order (smallest label).
    let winning_label = early_winner.unwrap_or_else(|| {
        labels
            .iter()
            .copied()
            .max_by_key(|label| (tallies.get(label).copied().unwrap_or(0), std::cmp::Reverse(*label)))
            .expect("labels is non-empty")
    });

    let winner = survivors
        .iter()
        .find(|c| c.label == winning_label)
        .cloned()
        .expect("winning label comes from survivors");

    let mut tally_list: Vec<(char, usize)> = tallies.into_iter().collect();
    tally_list.sort_by_key(|(label, _)| *label);

    Ok(VoteOutcome {
        winner,
        tallies: tally_list,
        votes_cast,
        abstentions,
        survivors: survivors.len(),
    })
}

fn ballot_prompt(task_description: &str, candidates: &[Candidate]) -> String {
    let mut prompt = format!("Task:\n{}\n\nCandidates:\n", task_description);
    for candidate in candidates {
        prompt.push_str(&format!("\nCandidate {}:\n{}\n", candidate.label, candidate.code));
    }
    prompt.push_str("\nReply with the single letter of the best candidate.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Backend scripted per role. Coder replies are keyed by the temperature
    /// ladder (which encodes the launch index), voter replies pop a queue.
    struct MockBackend {
        coder_by_index: Vec<Result<String, OrchestratorError>>,
        voter_replies: Mutex<VecDeque<String>>,
    }

    impl MockBackend {
        fn new(coder: Vec<Result<String, OrchestratorError>>, voters: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                coder_by_index: coder,
                voter_replies: Mutex::new(voters.iter().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl AgentBackend for MockBackend {
        async fn call_sync(
            &self,
            role: AgentRole,
            _system_prompt: &str,
            _user_prompt: &str,
            options: &CallOptions,
        ) -> Result<String, OrchestratorError> {
            match role {
                AgentRole::Coder => {
                    let index = ((options.temperature - 0.3) / 0.1).round() as usize;
                    self.coder_by_index
                        .get(index)
                        .cloned()
                        .unwrap_or_else(|| Ok("missing scripted candidate reply".into()))
                }
                AgentRole::Voter => {
                    let mut replies = self.voter_replies.lock().await;
                    Ok(replies.pop_front().unwrap_or_else(|| "no opinion".into()))
                }
                other => panic!("unexpected role in voter test: {}", other),
            }
        }
    }

    fn valid_code(tag: &str) -> String {
        format!("def solution_{}():\n    return 42  # {}", tag, tag)
    }

    #[tokio::test]
    async fn test_first_to_k_declares_winner() {
        let backend = MockBackend::new(
            (0..5).map(|i| Ok(valid_code(&i.to_string()))).collect(),
            vec!["B", "B", "A", "B", "C"],
        );
        let config = MakerConfig::default();
        let outcome = run_maker_round(backend, &config, "task", "prompt").await.unwrap();

        assert_eq!(outcome.winner.label, 'B');
        let b_tally = outcome.tallies.iter().find(|(l, _)| *l == 'B').unwrap().1;
        assert_eq!(b_tally, 3);
        let total: usize = outcome.tallies.iter().map(|(_, n)| n).sum();
        assert!(total <= 2 * config.win_threshold - 1);
        assert_eq!(outcome.survivors, 5);
        assert!(outcome.winner.code.contains("solution_1"));
    }

    #[tokio::test]
    async fn test_all_abstain_falls_back_to_launch_order() {
        let backend = MockBackend::new(
            (0..5).map(|i| Ok(valid_code(&i.to_string()))).collect(),
            vec!["no idea", "cannot say", "unsure", "hmm", "pass"],
        );
        let config = MakerConfig::default();
        let outcome = run_maker_round(backend, &config, "task", "prompt").await.unwrap();

        assert_eq!(outcome.votes_cast, 5);
        assert_eq!(outcome.abstentions, 5);
        assert!(outcome.tallies.is_empty());
        // Zero tallies everywhere: earliest launch order wins.
        assert_eq!(outcome.winner.label, 'A');
    }

    #[tokio::test]
    async fn test_short_candidates_filtered_before_voting() {
        // N=2, K=1 keeps the precondition N >= 2K-1.
        let config = MakerConfig {
            num_candidates: 2,
            win_threshold: 1,
            min_candidate_len: 20,
        };
        let backend = MockBackend::new(
            vec![Ok("x".into()), Ok(valid_code("good"))],
            vec!["A"],
        );
        let outcome = run_maker_round(backend, &config, "task", "prompt").await.unwrap();

        // Only one survivor (< K+1): returned directly, no votes spent.
        assert_eq!(outcome.survivors, 1);
        assert_eq!(outcome.votes_cast, 0);
        assert!(outcome.winner.code.contains("solution_good"));
        assert_eq!(outcome.winner.label, 'B');
    }

    #[tokio::test]
    async fn test_candidate_exhaustion() {
        let config = MakerConfig {
            num_candidates: 3,
            win_threshold: 1,
            min_candidate_len: 20,
        };
        let backend = MockBackend::new(
            vec![
                Ok("short".into()),
                Err(OrchestratorError::AgentTimeout("coder".into())),
                Ok("".into()),
            ],
            vec![],
        );
        let err = run_maker_round(backend, &config, "task", "prompt").await.unwrap_err();
        assert_eq!(err, OrchestratorError::CandidateExhaustion);
    }

    #[tokio::test]
    async fn test_n2_k1_any_valid_vote_wins() {
        let config = MakerConfig {
            num_candidates: 2,
            win_threshold: 1,
            min_candidate_len: 20,
        };
        let backend = MockBackend::new(
            vec![Ok(valid_code("a")), Ok(valid_code("b"))],
            vec!["B"],
        );
        let outcome = run_maker_round(backend, &config, "task", "prompt").await.unwrap();
        assert_eq!(outcome.winner.label, 'B');
        assert_eq!(outcome.votes_cast, 1);
    }

    #[tokio::test]
    async fn test_voter_errors_count_as_abstentions() {
        struct FailingVoters {
            inner: Arc<MockBackend>,
        }

        #[async_trait]
        impl AgentBackend for FailingVoters {
            async fn call_sync(
                &self,
                role: AgentRole,
                system_prompt: &str,
                user_prompt: &str,
                options: &CallOptions,
            ) -> Result<String, OrchestratorError> {
                if role == AgentRole::Voter {
                    return Err(OrchestratorError::AgentTimeout("voter".into()));
                }
                self.inner.call_sync(role, system_prompt, user_prompt, options).await
            }
        }

        let inner = MockBackend::new(
            (0..3).map(|i| Ok(valid_code(&i.to_string()))).collect(),
            vec![],
        );
        let config = MakerConfig {
            num_candidates: 3,
            win_threshold: 2,
            min_candidate_len: 20,
        };
        let backend = Arc::new(FailingVoters { inner });
        let outcome = run_maker_round(backend, &config, "task", "prompt").await.unwrap();

        assert_eq!(outcome.abstentions, 3);
        assert_eq!(outcome.winner.label, 'A');
    }

    #[test]
    fn test_temperature_ladder_and_labels() {
        assert!((temperature_for(0) - 0.3).abs() < 1e-6);
        assert!((temperature_for(4) - 0.7).abs() < 1e-6);
        assert_eq!(label_for(0), 'A');
        assert_eq!(label_for(2), 'C');
    }

    #[test]
    fn test_summary_format() {
        let outcome = VoteOutcome {
            winner: Candidate {
                label: 'B',
                code: "code".into(),
                temperature: 0.4,
                index: 1,
            },
            tallies: vec![('A', 1), ('B', 3)],
            votes_cast: 4,
            abstentions: 0,
            survivors: 5,
        };
        assert_eq!(outcome.summary(), "B wins (A=1, B=3; 5 candidates, 4 votes)");
    }
}
