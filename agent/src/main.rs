//! # Taskforge Agent
//!
//! Connects to the controller, authenticates, and executes dispatched
//! scripts until stopped.

mod client;
mod config;
mod executor;

use clap::Parser;
use config::AgentConfig;
use executor::Executor;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskforge_agent=info".into()),
        )
        .init();

    let config = Arc::new(AgentConfig::parse());
    info!(agent_id = %config.agent_id, "starting agent");

    let executor = Arc::new(Executor::new());
    client::run_agent_loop(config, executor).await;
}
