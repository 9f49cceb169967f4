//! # Scheduler
//!
//! Cron-driven trigger layer. Every enabled task with a schedule gets one
//! timer task that sleeps until the next occurrence and then asks the task
//! manager for a run. Task mutations arrive over the store's broadcast
//! stream and install, replace, or drop timers.
//!
//! Invariant: at most one active timer per task id.

use crate::manager::{ManagerError, RunOptions, TaskManager};
use crate::store::{Store, StoreError, Task, TaskEvent};
use chrono::Utc;
use croner::Cron;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Checks a 5-field cron expression at mutation time.
///
/// Standard syntax: `*`, ranges `a-b`, lists `a,b,c`, steps `*/n`;
/// day-of-week `7` is Sunday, same as `0`.
pub fn validate_schedule(expr: &str) -> Result<(), String> {
    Cron::new(expr)
        .parse()
        .map(|_| ())
        .map_err(|error| format!("invalid cron expression {expr:?}: {error}"))
}

/// Cron trigger layer feeding the task manager.
pub struct Scheduler {
    store: Store,
    manager: Arc<TaskManager>,
    timers: Mutex<HashMap<i64, JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: Store, manager: Arc<TaskManager>) -> Arc<Self> {
        Arc::new(Self {
            store,
            manager,
            timers: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Installs timers for every scheduled task and starts watching task
    /// mutations.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        let tasks = self.store.list_scheduled_tasks().await?;
        info!(count = tasks.len(), "installing schedule timers");
        for task in tasks {
            self.install(task);
        }

        let events = self.store.subscribe_tasks();
        let this = Arc::clone(self);
        let handle = tokio::spawn(this.watch_mutations(events));
        *self.watcher.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Installs (or replaces) the timer for `task`.
    fn install(&self, task: Task) {
        let Some(expr) = task.schedule.clone() else {
            return;
        };
        let cron = match Cron::new(&expr).parse() {
            Ok(cron) => cron,
            Err(error) => {
                warn!(task = %task.name, %error, "invalid cron expression; timer not installed");
                return;
            }
        };

        let manager = Arc::clone(&self.manager);
        let task_id = task.id;
        let name = task.name.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = match cron.find_next_occurrence(&now, false) {
                    Ok(next) => next,
                    Err(error) => {
                        warn!(task = %name, %error, "no next cron occurrence; timer stopping");
                        break;
                    }
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                match manager.run_task(task_id, RunOptions::default()).await {
                    Ok(run) => debug!(task = %name, run_id = run.id, "scheduled run created"),
                    Err(ManagerError::Store(StoreError::ActiveRun(_))) => {
                        debug!(task = %name, "schedule fired while a run is active; skipped");
                    }
                    Err(error) => warn!(task = %name, %error, "scheduled run failed"),
                }
            }
        });

        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.insert(task_id, handle) {
            old.abort();
        }
    }

    fn remove(&self, task_id: i64) {
        if let Some(handle) = self.timers.lock().unwrap().remove(&task_id) {
            handle.abort();
        }
    }

    async fn watch_mutations(self: Arc<Self>, mut events: broadcast::Receiver<TaskEvent>) {
        loop {
            match events.recv().await {
                Ok(TaskEvent::Saved(task)) => {
                    self.remove(task.id);
                    if task.enabled && task.schedule.is_some() {
                        self.install(task);
                    }
                }
                Ok(TaskEvent::Deleted(task_id)) => self.remove(task_id),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "task event stream lagged; reloading timers");
                    if let Err(error) = self.reload().await {
                        warn!(%error, "timer reload failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Drops every timer and reinstalls from the store.
    async fn reload(&self) -> Result<(), StoreError> {
        {
            let mut timers = self.timers.lock().unwrap();
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
        for task in self.store.list_scheduled_tasks().await? {
            self.install(task);
        }
        Ok(())
    }

    /// Stops the mutation watcher and every timer.
    pub fn shutdown(&self) {
        if let Some(handle) = self.watcher.lock().unwrap().take() {
            handle.abort();
        }
        let mut timers = self.timers.lock().unwrap();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    /// Number of installed timers. Test helper.
    pub fn timer_count(&self) -> usize {
        self.timers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NoopNotifier;
    use crate::registry::AgentRegistry;
    use crate::store::TaskDraft;
    use serde_json::Map;
    use std::time::Duration;
    use taskforge_protocol::Interpreter;

    #[test]
    fn accepts_standard_five_field_syntax() {
        for expr in [
            "* * * * *",
            "*/5 * * * *",
            "0 0 * * *",
            "15 2-6 * * 1-5",
            "0 12 1,15 * *",
            "30 4 * * 7", // 7 is Sunday
        ] {
            assert!(validate_schedule(expr).is_ok(), "rejected {expr}");
        }
    }

    #[test]
    fn rejects_garbage() {
        for expr in ["", "not a cron", "* * * *", "99 * * * *"] {
            assert!(validate_schedule(expr).is_err(), "accepted {expr:?}");
        }
    }

    async fn scheduler_fixture() -> (Store, Arc<Scheduler>) {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_agent("build-01", "super-secret", &["*".to_string()])
            .await
            .unwrap();
        let registry = Arc::new(AgentRegistry::new());
        let manager = TaskManager::new(store.clone(), registry, Arc::new(NoopNotifier));
        let scheduler = Scheduler::new(store.clone(), manager);
        (store, scheduler)
    }

    fn draft(name: &str, schedule: Option<&str>, enabled: bool) -> TaskDraft {
        TaskDraft {
            name: name.into(),
            interpreter: Interpreter::Bash,
            script: "true".into(),
            params: Map::new(),
            agent_id: "build-01".into(),
            schedule: schedule.map(str::to_string),
            enabled,
        }
    }

    #[tokio::test]
    async fn installs_timers_for_scheduled_tasks_only() {
        let (store, scheduler) = scheduler_fixture().await;
        store
            .create_task(&draft("scheduled", Some("0 3 * * *"), true))
            .await
            .unwrap();
        store.create_task(&draft("manual", None, true)).await.unwrap();
        store
            .create_task(&draft("disabled", Some("0 4 * * *"), false))
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        assert_eq!(scheduler.timer_count(), 1);
        scheduler.shutdown();
        assert_eq!(scheduler.timer_count(), 0);
    }

    #[tokio::test]
    async fn reacts_to_task_mutations() {
        let (store, scheduler) = scheduler_fixture().await;
        scheduler.start().await.unwrap();
        assert_eq!(scheduler.timer_count(), 0);

        let task = store
            .create_task(&draft("late-arrival", Some("0 5 * * *"), true))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.timer_count(), 1);

        // Disabling drops the timer.
        let mut disabled = draft("late-arrival", Some("0 5 * * *"), false);
        disabled.name = "late-arrival".into();
        store.update_task(task.id, &disabled).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.timer_count(), 0);

        // Re-enabling restores it; deleting drops it again.
        store
            .update_task(task.id, &draft("late-arrival", Some("0 5 * * *"), true))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.timer_count(), 1);

        store.destroy_task(task.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.timer_count(), 0);

        scheduler.shutdown();
    }
}
