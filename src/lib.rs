// src/lib.rs

// Import the top-level `makerflow` module.
pub mod makerflow;

// Re-exporting key items for easier external access.
pub use makerflow::agent;
pub use makerflow::client;
pub use makerflow::config;
pub use makerflow::context;
pub use makerflow::error;
pub use makerflow::melodic;
pub use makerflow::pipeline;
pub use makerflow::prompts;
pub use makerflow::server;
pub use makerflow::store;
pub use makerflow::task;
pub use makerflow::tools;
pub use makerflow::voter;

pub use makerflow::error::OrchestratorError;
pub use makerflow::pipeline::Pipeline;
pub use makerflow::task::{TaskState, TaskStatus};

/// Initialize env_logger once; safe to call from tests and the daemon.
pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
