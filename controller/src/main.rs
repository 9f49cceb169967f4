//! # Taskforge Controller
//!
//! Entry point: configuration, logging, store bootstrap, reconciliation,
//! the WebSocket/REST listener, and graceful shutdown.

use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskforge_controller::{
    api,
    config::Config,
    gateway,
    manager::TaskManager,
    notifier::{NoopNotifier, Notifier, WebhookNotifier},
    ratelimit::ConnRateLimiter,
    registry::AgentRegistry,
    scheduler::Scheduler,
    state::AppState,
    store::Store,
};
use taskforge_protocol::CLOSE_NORMAL;
use tower_http::cors::CorsLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskforge_controller=info".into()),
        )
        .init();

    let config = Arc::new(Config::parse());

    // An unusable store at startup is fatal; everything else degrades.
    let store = Store::open(&config.database)
        .await
        .with_context(|| format!("failed to open database at {}", config.database))?;

    let registry = Arc::new(AgentRegistry::new());
    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    };

    let manager = TaskManager::new(store.clone(), Arc::clone(&registry), Arc::clone(&notifier));
    manager
        .reconcile()
        .await
        .context("startup reconciliation failed")?;

    let scheduler = Scheduler::new(store.clone(), Arc::clone(&manager));
    scheduler
        .start()
        .await
        .context("failed to start scheduler")?;

    let state = AppState {
        config: Arc::clone(&config),
        store: store.clone(),
        registry: Arc::clone(&registry),
        manager,
        notifier,
        conn_limiter: Arc::new(ConnRateLimiter::new(
            config.conn_rate_limit,
            Duration::from_secs(config.conn_rate_window_secs),
        )),
        shutdown: Arc::new(AtomicBool::new(false)),
    };

    let app = Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/api/agents", get(api::list_agents))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    info!(bind = %config.bind, "controller listening");
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state, scheduler))
    .await
    .context("server error")?;

    store.close().await;
    info!("controller stopped");
    Ok(())
}

/// Waits for ctrl-c, then tears the platform down in order: scheduler
/// first, one batch status update, then every connection with code 1000.
async fn shutdown_signal(state: AppState, scheduler: Arc<Scheduler>) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown requested");

    state.shutdown.store(true, Ordering::SeqCst);
    scheduler.shutdown();

    if let Err(error) = state.store.set_all_agents_offline().await {
        tracing::warn!(%error, "failed to batch-mark agents offline");
    }
    state.registry.close_all(CLOSE_NORMAL, "controller shutdown");

    // Give close frames a moment to flush before the listener stops.
    tokio::time::sleep(Duration::from_millis(200)).await;
}
