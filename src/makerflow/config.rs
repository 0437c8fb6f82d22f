//! Process configuration.
//!
//! Everything configurable is read from the environment exactly once, at
//! startup, into an immutable [`OrchestratorConfig`]. The struct is shared
//! behind an `Arc` and never mutated afterwards; per-task mutable state
//! lives in [`TaskState`](crate::makerflow::task::TaskState) and the KV
//! store, never in process globals.
//!
//! Recognized variables (all optional):
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `BIND_ADDR` | `127.0.0.1:11400` | HTTP listen address |
//! | `MAKER_MODE` | `high` | validator implementation (`high`/`low`) |
//! | `MAKER_NUM_CANDIDATES` | `5` | N, parallel candidates per round (2..=10) |
//! | `MAKER_VOTE_K` | `3` | K, first-to-K win threshold |
//! | `MAX_CONTEXT_TOKENS` | `100000` | conversation context budget |
//! | `MAX_ITERATIONS` | `3` | coding/review loop cap |
//! | `TASK_TTL_SECONDS` | `86400` | task record lifetime in the KV store |
//! | `ENABLE_REASONING_CHAIN` | `true` | record/inject the melodic line |
//! | `MAX_IN_FLIGHT_TASKS` | `32` | back-pressure cap on live pipelines |
//! | `STATE_DIR` | `makerflow_state` | on-disk store location |
//! | `TOOL_SERVER_URL` | unset | planner tool-server base URL |
//!
//! Unparseable values fall back to their defaults with a warning rather than
//! aborting startup. The MAKER precondition `N >= 2K - 1` is enforced here
//! the same way.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::makerflow::agent::ValidatorMode;

/// Immutable process-wide configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bind_addr: SocketAddr,
    pub validator_mode: ValidatorMode,
    /// N: candidates generated per MAKER round.
    pub num_candidates: usize,
    /// K: tallies needed to win a vote.
    pub vote_threshold: usize,
    pub max_context_tokens: usize,
    pub max_iterations: u32,
    pub task_ttl: Duration,
    pub enable_reasoning_chain: bool,
    pub max_in_flight: usize,
    pub state_dir: PathBuf,
    pub tool_server_url: Option<String>,
    /// How many tool-server calls the planner may make per task.
    pub max_planner_tool_calls: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:11400".parse().unwrap(),
            validator_mode: ValidatorMode::High,
            num_candidates: 5,
            vote_threshold: 3,
            max_context_tokens: 100_000,
            max_iterations: 3,
            task_ttl: Duration::from_secs(86_400),
            enable_reasoning_chain: true,
            max_in_flight: 32,
            state_dir: PathBuf::from("makerflow_state"),
            tool_server_url: None,
            max_planner_tool_calls: 5,
        }
    }
}

impl OrchestratorConfig {
    /// Load the configuration from the environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = env::var("BIND_ADDR")
            .ok()
            .and_then(|v| match v.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    log::warn!("BIND_ADDR '{}' is not a socket address, using default", v);
                    None
                }
            })
            .unwrap_or(defaults.bind_addr);

        let validator_mode = env::var("MAKER_MODE")
            .map(|v| ValidatorMode::parse(&v))
            .unwrap_or(defaults.validator_mode);

        let mut num_candidates =
            env_usize("MAKER_NUM_CANDIDATES", defaults.num_candidates).clamp(2, 10);
        let mut vote_threshold = env_usize("MAKER_VOTE_K", defaults.vote_threshold).max(1);
        if num_candidates < 2 * vote_threshold - 1 {
            log::warn!(
                "MAKER_NUM_CANDIDATES={} < 2*MAKER_VOTE_K-1={}, falling back to defaults N=5 K=3",
                num_candidates,
                2 * vote_threshold - 1
            );
            num_candidates = defaults.num_candidates;
            vote_threshold = defaults.vote_threshold;
        }

        Self {
            bind_addr,
            validator_mode,
            num_candidates,
            vote_threshold,
            max_context_tokens: env_usize("MAX_CONTEXT_TOKENS", defaults.max_context_tokens),
            max_iterations: env_usize("MAX_ITERATIONS", defaults.max_iterations as usize) as u32,
            task_ttl: Duration::from_secs(env_usize(
                "TASK_TTL_SECONDS",
                defaults.task_ttl.as_secs() as usize,
            ) as u64),
            enable_reasoning_chain: env_bool("ENABLE_REASONING_CHAIN", true),
            max_in_flight: env_usize("MAX_IN_FLIGHT_TASKS", defaults.max_in_flight).max(1),
            state_dir: env::var("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            tool_server_url: env::var("TOOL_SERVER_URL").ok().filter(|v| !v.is_empty()),
            max_planner_tool_calls: defaults.max_planner_tool_calls,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(v) => match v.trim().parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                log::warn!("{} '{}' is not a number, using default {}", key, v, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
