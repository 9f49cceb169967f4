//! # Outcome Notifications
//!
//! Fire-and-forget events for external consumers (chat bridges, pagers).
//! Failures are logged and swallowed; a broken webhook must never affect
//! run processing.

use crate::store::{Task, TaskRun};
use async_trait::async_trait;
use serde_json::json;
use taskforge_protocol::ErrorReportPayload;
use tracing::{debug, warn};

/// Narrow contract the core emits through.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Called when a run starts and on every terminal transition.
    async fn notify_run_outcome(&self, task: &Task, run: &TaskRun);

    /// Called when an agent reports an out-of-band failure.
    async fn notify_error_report(&self, agent_id: &str, report: &ErrorReportPayload);
}

/// Notifier used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_run_outcome(&self, _task: &Task, _run: &TaskRun) {}

    async fn notify_error_report(&self, _agent_id: &str, _report: &ErrorReportPayload) {}
}

/// Posts JSON events to a single webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    async fn post(&self, body: serde_json::Value) {
        match self.client.post(&self.url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %self.url, "notification delivered");
            }
            Ok(response) => {
                warn!(url = %self.url, status = %response.status(), "notification rejected");
            }
            Err(error) => {
                warn!(url = %self.url, error = %error, "notification failed");
            }
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_run_outcome(&self, task: &Task, run: &TaskRun) {
        self.post(json!({
            "event": "run",
            "task": { "id": task.id, "name": task.name, "agentId": task.agent_id },
            "run": {
                "id": run.id,
                "status": run.status,
                "exitCode": run.exit_code,
                "durationMs": run.duration_ms,
                "stderr": run.stderr,
            },
        }))
        .await;
    }

    async fn notify_error_report(&self, agent_id: &str, report: &ErrorReportPayload) {
        self.post(json!({
            "event": "agent_error",
            "agentId": agent_id,
            "level": report.level,
            "error": report.error,
            "timestamp": report.timestamp,
        }))
        .await;
    }
}
