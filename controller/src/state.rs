//! # Shared Application State
//!
//! One cheap-clone handle passed to every axum handler. The registry,
//! manager, and store are process-wide singletons reachable only through
//! this struct; the shutdown flag is the single ambient signal.

use crate::config::Config;
use crate::manager::TaskManager;
use crate::notifier::Notifier;
use crate::ratelimit::ConnRateLimiter;
use crate::registry::AgentRegistry;
use crate::store::Store;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Shared state for the controller's HTTP/WebSocket surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub registry: Arc<AgentRegistry>,
    pub manager: Arc<TaskManager>,
    pub notifier: Arc<dyn Notifier>,
    pub conn_limiter: Arc<ConnRateLimiter>,
    /// Set once during graceful shutdown; connection cleanup consults it to
    /// avoid rewriting statuses the shutdown batch already wrote.
    pub shutdown: Arc<AtomicBool>,
}
