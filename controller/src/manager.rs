//! # Task Manager
//!
//! The authoritative run orchestrator. It owns two in-memory maps kept
//! consistent with the store:
//!
//! - `running`: run id → dispatched run (task snapshot + bound agent)
//! - `queue`: task id → run created but not yet dispatched, because its
//!   dependencies are unsatisfied or its target agent is offline
//!
//! Both live behind one mutex that is held only for map manipulation,
//! never across store calls or sends.
//!
//! ## Flow
//!
//! ```text
//! run_task ──► queue_run ──┬─► dispatch ──► registry.send(EXECUTE_TASK)
//!                          └─► queue map (gate unsatisfied / offline)
//! on_result ──► finish_run ──► complete ──► fan out edges, re-scan queue
//! ```

use crate::notifier::Notifier;
use crate::registry::AgentRegistry;
use crate::store::{
    RunStatus, Store, StoreError, Task, TaskRun, TriggerCondition,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use taskforge_protocol::{CancelPayload, ExecutePayload, ResultPayload, ResultStatus, WsMessage};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced to callers of the manager's public operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-invocation options for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Parameter overrides merged over the task's defaults (overrides win).
    pub params: Map<String, Value>,
}

#[derive(Clone)]
struct RunningEntry {
    run_id: i64,
    agent_id: String,
    task: Task,
}

#[derive(Clone)]
struct QueuedEntry {
    task: Task,
    run: TaskRun,
    options: RunOptions,
}

#[derive(Default)]
struct ManagerState {
    running: HashMap<i64, RunningEntry>,
    queue: HashMap<i64, QueuedEntry>,
}

/// Which downstream edges a terminal run may trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanOut {
    /// Every edge whose condition matches the terminal status.
    Matching,
    /// Only explicit `on:error` edges. Used for agent disconnects, where
    /// `always` edges must not fire.
    OnErrorOnly,
}

/// Process-wide run orchestrator.
pub struct TaskManager {
    store: Store,
    registry: Arc<AgentRegistry>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<ManagerState>,
}

impl TaskManager {
    pub fn new(store: Store, registry: Arc<AgentRegistry>, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            notifier,
            state: Mutex::new(ManagerState::default()),
        })
    }

    /// Startup reconciliation: runs left in flight by a previous controller
    /// life become errors. The controller intentionally drops prior
    /// in-flight work instead of re-dispatching it.
    pub async fn reconcile(&self) -> Result<u64, StoreError> {
        let swept = self.store.sweep_interrupted_runs().await?;
        if swept > 0 {
            info!(swept, "marked interrupted runs from previous controller life");
        }
        Ok(swept)
    }

    /// Creates a run for `task_id` and queues or dispatches it.
    ///
    /// Rejects when the task is unknown or already has a pending/running
    /// run. A disabled task may still be run this way; only automatic
    /// triggering requires the enabled flag.
    pub async fn run_task(&self, task_id: i64, options: RunOptions) -> Result<TaskRun, ManagerError> {
        let task = self
            .store
            .find_task(task_id)
            .await?
            .ok_or(ManagerError::TaskNotFound(task_id))?;

        let run = self.store.create_pending_run(&task).await?;
        info!(task = %task.name, run_id = run.id, "run created");
        self.queue_run(task, run.clone(), options).await;

        // The run may already have advanced past pending.
        Ok(self.store.find_run(run.id).await?.unwrap_or(run))
    }

    /// Dependency gate + online check: dispatch now or park the run.
    async fn queue_run(&self, task: Task, run: TaskRun, options: RunOptions) {
        let satisfied = match self.dependencies_satisfied(task.id).await {
            Ok(satisfied) => satisfied,
            Err(error) => {
                warn!(task = %task.name, error = %error, "dependency check failed; parking run");
                false
            }
        };

        if satisfied && self.registry.is_online(&task.agent_id) {
            self.dispatch(task, run, options).await;
        } else {
            debug!(task = %task.name, run_id = run.id, "run parked");
            let mut state = self.state.lock().unwrap();
            state.queue.insert(task.id, QueuedEntry { task, run, options });
        }
    }

    /// Transitions the run to running and sends EXECUTE_TASK to the agent.
    async fn dispatch(&self, task: Task, run: TaskRun, options: RunOptions) {
        let run = match self.store.mark_run_running(run.id).await {
            Ok(run) => run,
            Err(error) => {
                warn!(run_id = run.id, error = %error, "failed to mark run running; re-parking");
                let mut state = self.state.lock().unwrap();
                state.queue.insert(task.id, QueuedEntry { task, run, options });
                return;
            }
        };

        let assets = match self.store.asset_snapshot().await {
            Ok(assets) => assets,
            Err(error) => {
                warn!(run_id = run.id, error = %error, "failed to snapshot assets");
                self.fail_run(&task, run.id, "failed to snapshot assets", FanOut::Matching)
                    .await;
                return;
            }
        };

        let mut params = task.params.clone();
        for (key, value) in options.params {
            params.insert(key, value);
        }
        let payload = ExecutePayload {
            task_id: task.id,
            run_id: run.id,
            name: task.name.clone(),
            interpreter: task.interpreter,
            script: task.script.clone(),
            params,
            assets,
            options: Map::new(),
        };

        match self
            .registry
            .send(&run.agent_id, WsMessage::ExecuteTask { payload })
        {
            Ok(()) => {
                info!(task = %task.name, run_id = run.id, agent_id = %run.agent_id, "run dispatched");
                {
                    let mut state = self.state.lock().unwrap();
                    state.running.insert(
                        run.id,
                        RunningEntry {
                            run_id: run.id,
                            agent_id: run.agent_id.clone(),
                            task: task.clone(),
                        },
                    );
                }
                self.notifier.notify_run_outcome(&task, &run).await;
            }
            Err(error) => {
                // Delivery failure is a task error, not an agent error, so
                // downstream on:error edges still fire.
                warn!(run_id = run.id, agent_id = %run.agent_id, error = %error, "dispatch send failed");
                self.fail_run(&task, run.id, "failed to deliver task to agent", FanOut::Matching)
                    .await;
            }
        }
    }

    /// Marks a run failed outside the normal result path and completes it.
    async fn fail_run(&self, task: &Task, run_id: i64, reason: &str, fan_out: FanOut) {
        match self
            .store
            .finish_run(run_id, RunStatus::Error, None, None, Some(reason), None)
            .await
        {
            Ok(Some(run)) => Box::pin(self.complete(task.clone(), run, fan_out)).await,
            Ok(None) => {}
            Err(error) => warn!(run_id, error = %error, "failed to record run failure"),
        }
    }

    /// Handles a `result` frame from `agent_id`.
    pub async fn on_result(&self, agent_id: &str, payload: ResultPayload) {
        let entry = {
            let state = self.state.lock().unwrap();
            state
                .running
                .values()
                .filter(|e| e.task.id == payload.task_id && e.agent_id == agent_id)
                .max_by_key(|e| e.run_id)
                .cloned()
        };
        let Some(entry) = entry else {
            warn!(agent_id, task_id = payload.task_id, "result for unknown run dropped");
            return;
        };

        let status = match payload.status {
            ResultStatus::Success => RunStatus::Success,
            ResultStatus::Error => RunStatus::Error,
        };
        let duration = (payload.duration_ms > 0).then_some(payload.duration_ms);

        match self
            .store
            .finish_run(
                entry.run_id,
                status,
                payload.exit_code.map(i64::from),
                Some(&payload.stdout),
                Some(&payload.stderr),
                duration,
            )
            .await
        {
            Ok(Some(run)) => {
                info!(task = %entry.task.name, run_id = run.id, status = %run.status, "run finished");
                self.complete(entry.task, run, FanOut::Matching).await;
            }
            Ok(None) => {
                // Already terminal (a cancellation won the race); drop the entry.
                let mut state = self.state.lock().unwrap();
                state.running.remove(&entry.run_id);
            }
            Err(error) => {
                warn!(run_id = entry.run_id, error = %error, "failed to persist run result");
            }
        }
    }

    /// Terminal bookkeeping: notification, downstream fan-out, queue re-scan.
    ///
    /// Fan-out happens strictly after the terminal state is durable.
    async fn complete(&self, task: Task, run: TaskRun, fan_out: FanOut) {
        {
            let mut state = self.state.lock().unwrap();
            state.running.remove(&run.id);
        }
        self.notifier.notify_run_outcome(&task, &run).await;

        match self.store.children_of(task.id).await {
            Ok(edges) => {
                for edge in edges.into_iter().filter(|edge| {
                    edge.condition.matches(run.status)
                        && (fan_out == FanOut::Matching
                            || edge.condition == TriggerCondition::OnError)
                }) {
                    self.trigger_child(edge.child_id).await;
                }
            }
            Err(error) => {
                warn!(task = %task.name, error = %error, "failed to load downstream edges");
            }
        }

        self.rescan_queue(None).await;
    }

    /// Creates and queues a run for a dependency-triggered child.
    async fn trigger_child(&self, child_id: i64) {
        let child = match self.store.find_task(child_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(error) => {
                warn!(child_id, error = %error, "failed to load dependent task");
                return;
            }
        };
        if !child.enabled {
            debug!(task = %child.name, "skipping disabled dependent task");
            return;
        }

        match self.store.create_pending_run(&child).await {
            Ok(run) => {
                info!(task = %child.name, run_id = run.id, "dependent run created");
                Box::pin(self.queue_run(child, run, RunOptions::default())).await;
            }
            Err(StoreError::ActiveRun(_)) => {
                debug!(task = %child.name, "dependent task already has an active run");
            }
            Err(error) => {
                warn!(task = %child.name, error = %error, "failed to create dependent run");
            }
        }
    }

    /// Re-evaluates parked runs; `agent_filter` limits the scan to entries
    /// bound to one agent.
    async fn rescan_queue(&self, agent_filter: Option<&str>) {
        let candidates: Vec<QueuedEntry> = {
            let state = self.state.lock().unwrap();
            state
                .queue
                .values()
                .filter(|e| agent_filter.is_none_or(|agent| e.task.agent_id == agent))
                .cloned()
                .collect()
        };

        for candidate in candidates {
            if !self.registry.is_online(&candidate.task.agent_id) {
                continue;
            }
            match self.dependencies_satisfied(candidate.task.id).await {
                Ok(true) => {
                    // Claim the entry only if it still holds the same run.
                    let claimed = {
                        let mut state = self.state.lock().unwrap();
                        match state.queue.get(&candidate.task.id) {
                            Some(current) if current.run.id == candidate.run.id => {
                                state.queue.remove(&candidate.task.id)
                            }
                            _ => None,
                        }
                    };
                    if let Some(entry) = claimed {
                        self.dispatch(entry.task, entry.run, entry.options).await;
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(task = %candidate.task.name, error = %error, "dependency check failed during re-scan");
                }
            }
        }
    }

    /// Gateway hook: an agent finished its handshake.
    pub async fn on_agent_connect(&self, agent_id: &str) {
        debug!(agent_id, "re-scanning queue after agent connect");
        self.rescan_queue(Some(agent_id)).await;
    }

    /// Gateway hook: an agent's connection closed. Every run bound to it
    /// becomes an error. Downstream edges do not fire on this path, with
    /// one exception: explicit `on:error` edges do.
    pub async fn on_agent_disconnect(&self, agent_id: &str) {
        let victims: Vec<RunningEntry> = {
            let state = self.state.lock().unwrap();
            state
                .running
                .values()
                .filter(|e| e.agent_id == agent_id)
                .cloned()
                .collect()
        };
        for entry in victims {
            warn!(agent_id, run_id = entry.run_id, "agent disconnected with run in flight");
            self.fail_run(
                &entry.task,
                entry.run_id,
                "agent disconnected",
                FanOut::OnErrorOnly,
            )
            .await;
        }
    }

    /// Cancels the running run of `task_id`, if any. Returns whether one
    /// was found. Cancellation does not fan out to downstream edges.
    pub async fn cancel_task(&self, task_id: i64) -> Result<bool, ManagerError> {
        let entry = {
            let state = self.state.lock().unwrap();
            state
                .running
                .values()
                .find(|e| e.task.id == task_id)
                .cloned()
        };
        let Some(entry) = entry else {
            return Ok(false);
        };

        if let Err(error) = self.registry.send(
            &entry.agent_id,
            WsMessage::CancelTask {
                payload: CancelPayload {
                    task_id,
                    run_id: entry.run_id,
                },
            },
        ) {
            warn!(run_id = entry.run_id, error = %error, "cancel order undeliverable");
        }

        match self
            .store
            .finish_run(
                entry.run_id,
                RunStatus::Cancelled,
                None,
                None,
                Some("cancelled by user"),
                None,
            )
            .await?
        {
            Some(run) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.running.remove(&entry.run_id);
                }
                info!(task = %entry.task.name, run_id = run.id, "run cancelled");
                self.notifier.notify_run_outcome(&entry.task, &run).await;
                Ok(true)
            }
            None => {
                // The agent's result beat the cancellation.
                let mut state = self.state.lock().unwrap();
                state.running.remove(&entry.run_id);
                Ok(false)
            }
        }
    }

    /// The dependency gate: every parent edge must be satisfied by the
    /// parent's latest run. A parent with no runs satisfies nothing.
    async fn dependencies_satisfied(&self, task_id: i64) -> Result<bool, StoreError> {
        for edge in self.store.parents_of(task_id).await? {
            let latest = self.store.latest_run_for_task(edge.parent_id).await?;
            let satisfied = match (edge.condition, latest) {
                (_, None) => false,
                (TriggerCondition::Always, Some(run)) => run.status.is_terminal(),
                (TriggerCondition::OnSuccess, Some(run)) => run.status == RunStatus::Success,
                (TriggerCondition::OnError, Some(run)) => run.status == RunStatus::Error,
            };
            if !satisfied {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Task ids with a parked run. Test/introspection helper.
    pub fn queued_task_ids(&self) -> Vec<i64> {
        let state = self.state.lock().unwrap();
        state.queue.keys().copied().collect()
    }

    /// Run ids currently dispatched. Test/introspection helper.
    pub fn running_run_ids(&self) -> Vec<i64> {
        let state = self.state.lock().unwrap();
        state.running.keys().copied().collect()
    }
}
