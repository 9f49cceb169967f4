//! # Persistent Store
//!
//! SQLite-backed repository for the five persistent entities. One
//! [`Store`] handle wraps the connection pool; per-entity operations live
//! in their own modules (`agents`, `tasks`, `runs`, `dependencies`,
//! `assets`) as `impl Store` blocks.
//!
//! Run-state mutations are short transactions. Transient failures (busy
//! database, dropped connection) are retried up to three times with
//! exponential backoff before surfacing.
//!
//! Task mutations are broadcast as [`TaskEvent`]s after commit; the
//! scheduler subscribes to keep its timers in sync.

mod agents;
mod assets;
mod dependencies;
pub mod models;
mod runs;
mod tasks;

pub use models::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Errors surfaced by the repository.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("task {0} already has an active run")]
    ActiveRun(i64),

    #[error("dependency from {parent} to {child} would create a cycle")]
    DependencyCycle { parent: i64, child: i64 },

    #[error("invalid JSON in stored column: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mutation event published after a task is committed.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Saved(Task),
    Deleted(i64),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id           TEXT PRIMARY KEY,
    secret       TEXT NOT NULL,
    allowed_ips  TEXT NOT NULL DEFAULT '[]',
    status       TEXT NOT NULL DEFAULT 'offline',
    last_seen_at TEXT,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    interpreter TEXT NOT NULL,
    script      TEXT NOT NULL,
    params      TEXT NOT NULL DEFAULT '{}',
    agent_id    TEXT NOT NULL REFERENCES agents(id),
    schedule    TEXT,
    enabled     INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_dependencies (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    child_id  INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    condition TEXT NOT NULL DEFAULT 'always',
    UNIQUE(parent_id, child_id)
);

CREATE TABLE IF NOT EXISTS task_runs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    agent_id    TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'pending',
    exit_code   INTEGER,
    stdout      TEXT NOT NULL DEFAULT '',
    stderr      TEXT NOT NULL DEFAULT '',
    duration_ms INTEGER,
    started_at  TEXT,
    finished_at TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_runs_task ON task_runs(task_id, id);
CREATE INDEX IF NOT EXISTS idx_task_runs_status ON task_runs(status);

CREATE TABLE IF NOT EXISTS assets (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Shared repository handle. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    task_events: broadcast::Sender<TaskEvent>,
}

impl Store {
    /// Opens (creating if missing) the database at `path` and applies the
    /// schema.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// In-memory database on a single connection. Used by tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        let (task_events, _) = broadcast::channel(64);
        Ok(Self { pool, task_events })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Subscribes to task mutation events (the scheduler's repository hook).
    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent> {
        self.task_events.subscribe()
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        // No subscribers is fine; the send result is irrelevant.
        let _ = self.task_events.send(event);
    }

    /// Closes the pool. Pending acquires fail afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ─── Retry Discipline ───────────────────────────────────────────

const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

/// Runs `op`, retrying transient database failures with 0.5 s / 1 s / 2 s
/// backoff. Non-transient errors surface immediately.
pub(crate) async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Err(StoreError::Database(err)) if attempt < RETRY_DELAYS.len() && is_transient(&err) => {
                warn!(attempt, error = %err, "transient store failure, retrying");
                tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ─── Shared Validation ──────────────────────────────────────────

/// Identifier rule shared by agent ids and task names: 3–50 chars from
/// `[A-Za-z0-9_-]`.
pub(crate) fn validate_identifier(kind: &str, value: &str) -> Result<(), StoreError> {
    let len = value.chars().count();
    if !(3..=50).contains(&len) {
        return Err(StoreError::Validation(format!(
            "{kind} must be 3-50 characters, got {len}"
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(StoreError::Validation(format!(
            "{kind} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

pub(crate) fn parse_json_map(
    text: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, StoreError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(StoreError::Validation(
            "expected a JSON object in stored column".into(),
        )),
    }
}
