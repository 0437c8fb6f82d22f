//! The orchestrator daemon.
//!
//! Loads configuration from the environment, wires the HTTP agent backend,
//! the on-disk task store, and the reasoning-chain store into one pipeline,
//! and serves the OpenAI-compatible surface until the process is stopped.
//!
//! Run with the defaults and a single colocated backend:
//!
//! ```text
//! AGENT_BASE_URL=http://127.0.0.1:8000/v1/chat/completions makerflowd
//! ```

use std::sync::Arc;

use makerflow::agent::AgentRegistry;
use makerflow::client::{AgentBackend, HttpAgentBackend};
use makerflow::config::OrchestratorConfig;
use makerflow::melodic::MelodicStore;
use makerflow::pipeline::Pipeline;
use makerflow::server::{router, AppState};
use makerflow::store::{FileKvStore, KvStore, MemoryKvStore};
use makerflow::tools::ToolServerClient;

#[tokio::main]
async fn main() {
    makerflow::init_logger();

    let config = Arc::new(OrchestratorConfig::from_env());
    let registry = Arc::new(AgentRegistry::from_env());
    let backend: Arc<dyn AgentBackend> = Arc::new(HttpAgentBackend::new(registry));

    let store: Arc<dyn KvStore> = match FileKvStore::open(config.state_dir.join("tasks")) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::warn!(
                "state dir {:?} not usable ({}), falling back to in-memory task store",
                config.state_dir,
                e
            );
            Arc::new(MemoryKvStore::new())
        }
    };

    let melodic = Arc::new(if config.enable_reasoning_chain {
        MelodicStore::new(config.state_dir.join("chains"), true)
    } else {
        MelodicStore::disabled()
    });

    let tools = config
        .tool_server_url
        .clone()
        .map(|url| Arc::new(ToolServerClient::new(url)));

    let pipeline = Arc::new(Pipeline::new(
        backend,
        store,
        melodic,
        tools,
        Arc::clone(&config),
    ));
    let state = Arc::new(AppState::new(pipeline));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .expect("failed to bind listen address");
    log::info!(
        "makerflowd listening on {} (mode={}, N={}, K={})",
        config.bind_addr,
        config.validator_mode.as_str(),
        config.num_candidates,
        config.vote_threshold
    );
    axum::serve(listener, app).await.expect("server error");
}
