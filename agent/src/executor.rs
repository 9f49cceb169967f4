//! # Script Executor
//!
//! Supervises one interpreter subprocess per task:
//! - materializes the script into a uniquely-named temp file
//! - injects `PARAM_*` / `ASSET_*` environment variables
//! - captures stdout and stderr in full
//! - enforces the 15-minute wall clock (SIGTERM, exit 124)
//! - handles cancellation (SIGTERM, exit 143)
//!
//! At most one execution per task id runs concurrently; a duplicate
//! order is answered with an error result.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskforge_protocol::{ExecutePayload, ResultPayload, ResultStatus, WsMessage};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// Hard wall-clock limit for one script.
const EXEC_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Grace between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Synthetic exit code for a timed-out script.
const TIMEOUT_EXIT_CODE: i32 = 124;
/// Synthetic exit code for a cancelled script.
const CANCEL_EXIT_CODE: i32 = 143;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to materialize script: {0}")]
    TempFile(std::io::Error),

    #[error("failed to spawn {0}: {1}")]
    Spawn(&'static str, std::io::Error),

    #[error("failed to wait for child: {0}")]
    Wait(std::io::Error),
}

struct RunningScript {
    run_id: i64,
    cancelled: AtomicBool,
    cancel: Notify,
}

struct ScriptOutcome {
    success: bool,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

enum Ending {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

/// Process-wide executor; lives for the life of the agent, across
/// reconnects.
pub struct Executor {
    running: DashMap<i64, Arc<RunningScript>>,
    exec_timeout: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            running: DashMap::new(),
            exec_timeout: EXEC_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(exec_timeout: Duration) -> Self {
        Self {
            running: DashMap::new(),
            exec_timeout,
        }
    }

    /// Runs one EXECUTE_TASK order to completion and sends the `result`
    /// frame through `tx`.
    pub async fn execute(&self, payload: ExecutePayload, tx: mpsc::UnboundedSender<WsMessage>) {
        let handle = Arc::new(RunningScript {
            run_id: payload.run_id,
            cancelled: AtomicBool::new(false),
            cancel: Notify::new(),
        });

        match self.running.entry(payload.task_id) {
            Entry::Occupied(existing) => {
                warn!(
                    task_id = payload.task_id,
                    running_run_id = existing.get().run_id,
                    "duplicate execution order refused"
                );
                let result = ResultPayload {
                    task_id: payload.task_id,
                    run_id: payload.run_id,
                    name: payload.name,
                    status: ResultStatus::Error,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: "task is already running on this agent".into(),
                    duration_ms: 0,
                };
                let _ = tx.send(WsMessage::TaskResult { payload: result });
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
            }
        }

        info!(task = %payload.name, run_id = payload.run_id, "executing script");
        let started = Instant::now();
        let outcome = self.run_script(&payload, &handle).await;
        self.running.remove(&payload.task_id);
        let duration_ms = started.elapsed().as_millis() as i64;

        let result = match outcome {
            Ok(outcome) => ResultPayload {
                task_id: payload.task_id,
                run_id: payload.run_id,
                name: payload.name.clone(),
                status: if outcome.success {
                    ResultStatus::Success
                } else {
                    ResultStatus::Error
                },
                exit_code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                duration_ms,
            },
            Err(error) => {
                warn!(task = %payload.name, run_id = payload.run_id, %error, "script execution failed");
                ResultPayload {
                    task_id: payload.task_id,
                    run_id: payload.run_id,
                    name: payload.name.clone(),
                    status: ResultStatus::Error,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: error.to_string(),
                    duration_ms,
                }
            }
        };

        if tx.send(WsMessage::TaskResult { payload: result }).is_err() {
            warn!(
                run_id = payload.run_id,
                "result undeliverable, controller connection is gone"
            );
        }
    }

    async fn run_script(
        &self,
        payload: &ExecutePayload,
        handle: &RunningScript,
    ) -> Result<ScriptOutcome, ExecutorError> {
        // The temp file is removed when this handle drops, whatever the
        // outcome below.
        let script_file = tempfile::Builder::new()
            .prefix("taskforge-")
            .suffix(&format!(".{}", payload.interpreter.extension()))
            .tempfile()
            .map_err(ExecutorError::TempFile)?;
        tokio::fs::write(script_file.path(), &payload.script)
            .await
            .map_err(ExecutorError::TempFile)?;

        let mut command = Command::new(payload.interpreter.program());
        command.arg(script_file.path());
        for (key, value) in &payload.params {
            command.env(format!("PARAM_{}", key.to_uppercase()), stringify_value(value));
        }
        for (key, value) in &payload.assets {
            command.env(format!("ASSET_{}", key.to_uppercase()), value);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ExecutorError::Spawn(payload.interpreter.program(), e))?;

        let stdout_task = read_pipe(child.stdout.take());
        let stderr_task = read_pipe(child.stderr.take());

        let ending = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Ending::Exited(status.code()),
                Err(error) => return Err(ExecutorError::Wait(error)),
            },
            _ = tokio::time::sleep(self.exec_timeout) => {
                warn!(run_id = handle.run_id, "script exceeded wall-clock limit");
                terminate(&mut child).await;
                Ending::TimedOut
            }
            _ = handle.cancel.notified() => {
                info!(run_id = handle.run_id, "cancelling script");
                terminate(&mut child).await;
                Ending::Cancelled
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(match ending {
            Ending::Exited(code) => {
                // A cancel that raced the natural exit still counts as a
                // cancellation.
                if handle.cancelled.load(Ordering::SeqCst) {
                    ScriptOutcome {
                        success: false,
                        exit_code: Some(CANCEL_EXIT_CODE),
                        stdout,
                        stderr: append_reason(stderr, "cancelled by user"),
                    }
                } else {
                    ScriptOutcome {
                        success: code == Some(0),
                        exit_code: code,
                        stdout,
                        stderr,
                    }
                }
            }
            Ending::TimedOut => ScriptOutcome {
                success: false,
                exit_code: Some(TIMEOUT_EXIT_CODE),
                stdout,
                stderr: append_reason(stderr, "timed out"),
            },
            Ending::Cancelled => ScriptOutcome {
                success: false,
                exit_code: Some(CANCEL_EXIT_CODE),
                stdout,
                stderr: append_reason(stderr, "cancelled by user"),
            },
        })
    }

    /// Signals the running script for `task_id`, if any. The result frame
    /// is produced by the supervising [`execute`](Self::execute) call.
    pub fn cancel(&self, task_id: i64) -> bool {
        match self.running.get(&task_id) {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::SeqCst);
                entry.cancel.notify_one();
                true
            }
            None => false,
        }
    }
}

/// SIGTERM, then SIGKILL after a grace period.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn read_pipe<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Environment rendering: strings pass through, other primitives print
/// plainly, arrays and objects are JSON-encoded.
fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn append_reason(captured: String, reason: &str) -> String {
    if captured.is_empty() {
        reason.to_string()
    } else {
        format!("{captured}\n{reason}")
    }
}
