//! Agent roles and the process-wide role table.
//!
//! The orchestrator knows a closed set of agent roles. Rather than a class
//! hierarchy, each role is a tag in [`AgentRole`] and the process keeps one
//! immutable [`AgentRegistry`]: a lookup table from role to endpoint URL,
//! system prompt, and timeout. Stages refer to agents by tag only.
//!
//! The registry is loaded once at startup (endpoint and timeout overrides
//! come from the environment) and never mutated afterwards, so it can be
//! shared freely behind an `Arc`.
//!
//! # Example
//!
//! ```rust
//! use makerflow::agent::{AgentRegistry, AgentRole};
//!
//! let registry = AgentRegistry::from_env();
//! let coder = registry.profile(AgentRole::Coder);
//! assert!(coder.timeout_ms >= 1_000);
//! ```

use std::collections::HashMap;
use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::makerflow::prompts;

/// The closed set of agent roles driven by the pipeline.
///
/// `Validator` has two implementations selected by [`ValidatorMode`]: a
/// dedicated reviewer endpoint, or planner reflection (the planner endpoint
/// with a reflection prompt). Both are addressed through this same tag; the
/// pipeline picks the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Normalizes raw user input and classifies its intent.
    Preprocessor,
    /// Produces a plan (or, for pure questions, a direct textual answer).
    Planner,
    /// Generates candidate code. Fanned out N ways during a MAKER round.
    Coder,
    /// Emits a single candidate label during voting.
    Voter,
    /// Reviews generated code and produces an approved/failed verdict.
    Validator,
}

impl AgentRole {
    /// All roles in pipeline order.
    pub fn all() -> [AgentRole; 5] {
        [
            AgentRole::Preprocessor,
            AgentRole::Planner,
            AgentRole::Coder,
            AgentRole::Voter,
            AgentRole::Validator,
        ]
    }

    /// Stable lowercase name, used in logs, env-var keys, and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Preprocessor => "preprocessor",
            AgentRole::Planner => "planner",
            AgentRole::Coder => "coder",
            AgentRole::Voter => "voter",
            AgentRole::Validator => "validator",
        }
    }

    /// Parse a role name as it appears in URLs and env keys.
    pub fn parse(s: &str) -> Option<AgentRole> {
        match s.to_ascii_lowercase().as_str() {
            "preprocessor" => Some(AgentRole::Preprocessor),
            "planner" => Some(AgentRole::Planner),
            "coder" => Some(AgentRole::Coder),
            "voter" => Some(AgentRole::Voter),
            "validator" => Some(AgentRole::Validator),
            _ => None,
        }
    }

    /// Default per-role call deadline in milliseconds.
    ///
    /// Code generation gets the longest budget; voters answer with a single
    /// label and get the shortest.
    pub fn default_timeout_ms(&self) -> u64 {
        match self {
            AgentRole::Coder => 120_000,
            AgentRole::Voter => 30_000,
            AgentRole::Preprocessor | AgentRole::Planner | AgentRole::Validator => 60_000,
        }
    }

    /// The system prompt this role is primed with.
    pub fn system_prompt(&self) -> &'static str {
        match self {
            AgentRole::Preprocessor => prompts::PREPROCESSOR_PROMPT,
            AgentRole::Planner => prompts::PLANNER_PROMPT,
            AgentRole::Coder => prompts::CODER_PROMPT,
            AgentRole::Voter => prompts::VOTER_PROMPT,
            AgentRole::Validator => prompts::VALIDATOR_PROMPT,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which validator implementation reviews generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorMode {
    /// Call the dedicated Validator endpoint.
    High,
    /// Planner reflection: the planner endpoint with a reflection prompt.
    Low,
}

impl ValidatorMode {
    /// Parse the `MAKER_MODE` value. Anything that is not `low` means high.
    pub fn parse(s: &str) -> ValidatorMode {
        if s.trim().eq_ignore_ascii_case("low") {
            ValidatorMode::Low
        } else {
            ValidatorMode::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorMode::High => "high",
            ValidatorMode::Low => "low",
        }
    }
}

/// Connection and priming details for one agent role.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub role: AgentRole,
    /// Full chat-completions URL of the backend serving this role.
    pub endpoint: String,
    /// Immutable system prompt, loaded once at process start.
    pub system_prompt: &'static str,
    /// Per-call deadline in milliseconds.
    pub timeout_ms: u64,
    /// Model identifier forwarded in the request body. Backends that serve a
    /// single model ignore it.
    pub model: String,
}

/// Immutable role table shared process-wide.
///
/// Endpoints come from `{ROLE}_AGENT_URL` (e.g. `CODER_AGENT_URL`), timeouts
/// from `{ROLE}_AGENT_TIMEOUT_MS`, and models from `{ROLE}_AGENT_MODEL`.
/// Roles without an explicit endpoint fall back to `AGENT_BASE_URL` (default
/// `http://127.0.0.1:8000/v1/chat/completions`), which suits the common case
/// of all roles being served by one colocated backend.
pub struct AgentRegistry {
    profiles: HashMap<AgentRole, AgentProfile>,
}

impl AgentRegistry {
    /// Build the registry from the environment.
    pub fn from_env() -> Self {
        let base = env::var("AGENT_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8000/v1/chat/completions".to_string());

        let mut profiles = HashMap::new();
        for role in AgentRole::all() {
            let key = role.as_str().to_ascii_uppercase();
            let endpoint =
                env::var(format!("{}_AGENT_URL", key)).unwrap_or_else(|_| base.clone());
            let timeout_ms = env::var(format!("{}_AGENT_TIMEOUT_MS", key))
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_else(|| role.default_timeout_ms());
            let model = env::var(format!("{}_AGENT_MODEL", key))
                .unwrap_or_else(|_| "default".to_string());
            profiles.insert(
                role,
                AgentProfile {
                    role,
                    endpoint,
                    system_prompt: role.system_prompt(),
                    timeout_ms,
                    model,
                },
            );
        }
        Self { profiles }
    }

    /// Build a registry where every role points at the same endpoint.
    /// Used by tests and single-backend deployments.
    pub fn with_uniform_endpoint(endpoint: &str) -> Self {
        let mut profiles = HashMap::new();
        for role in AgentRole::all() {
            profiles.insert(
                role,
                AgentProfile {
                    role,
                    endpoint: endpoint.to_string(),
                    system_prompt: role.system_prompt(),
                    timeout_ms: role.default_timeout_ms(),
                    model: "default".to_string(),
                },
            );
        }
        Self { profiles }
    }

    /// Look up the profile for a role. Every role is always present.
    pub fn profile(&self, role: AgentRole) -> &AgentProfile {
        self.profiles
            .get(&role)
            .expect("registry contains every role")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_round_trip() {
        for role in AgentRole::all() {
            assert_eq!(AgentRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(AgentRole::parse("unknown"), None);
    }

    #[test]
    fn test_role_serde_tags() {
        let json = serde_json::to_string(&AgentRole::Preprocessor).unwrap();
        assert_eq!(json, "\"preprocessor\"");
        let back: AgentRole = serde_json::from_str("\"coder\"").unwrap();
        assert_eq!(back, AgentRole::Coder);
    }

    #[test]
    fn test_validator_mode_parse() {
        assert_eq!(ValidatorMode::parse("low"), ValidatorMode::Low);
        assert_eq!(ValidatorMode::parse("LOW"), ValidatorMode::Low);
        assert_eq!(ValidatorMode::parse("high"), ValidatorMode::High);
        assert_eq!(ValidatorMode::parse("anything"), ValidatorMode::High);
    }

    #[test]
    fn test_uniform_registry_timeouts() {
        let registry = AgentRegistry::with_uniform_endpoint("http://localhost:9/v1/chat/completions");
        assert_eq!(registry.profile(AgentRole::Coder).timeout_ms, 120_000);
        assert_eq!(registry.profile(AgentRole::Voter).timeout_ms, 30_000);
        assert_eq!(registry.profile(AgentRole::Planner).timeout_ms, 60_000);
    }
}
