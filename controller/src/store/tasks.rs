//! Task records and their mutation events.

use super::{models::*, parse_json_map, validate_identifier, Store, StoreError, TaskEvent};
use crate::scheduler;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskforge_protocol::{Interpreter, MAX_SCRIPT_BYTES};

pub(super) fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let interpreter = row
        .try_get::<String, _>("interpreter")?
        .parse::<Interpreter>()
        .map_err(|e| StoreError::Validation(e.to_string()))?;
    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        interpreter,
        script: row.try_get("script")?,
        params: parse_json_map(&row.try_get::<String, _>("params")?)?,
        agent_id: row.try_get("agent_id")?,
        schedule: row.try_get("schedule")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    async fn validate_draft(&self, draft: &TaskDraft) -> Result<(), StoreError> {
        validate_identifier("task name", &draft.name)?;
        if draft.script.len() > MAX_SCRIPT_BYTES {
            return Err(StoreError::Validation(format!(
                "script exceeds {MAX_SCRIPT_BYTES} bytes"
            )));
        }
        if self.find_agent(&draft.agent_id).await?.is_none() {
            return Err(StoreError::NotFound("agent", draft.agent_id.clone()));
        }
        if let Some(expr) = &draft.schedule {
            scheduler::validate_schedule(expr).map_err(StoreError::Validation)?;
        }
        Ok(())
    }

    pub async fn create_task(&self, draft: &TaskDraft) -> Result<Task, StoreError> {
        self.validate_draft(draft).await?;
        if self.find_task_by_name(&draft.name).await?.is_some() {
            return Err(StoreError::Validation(format!(
                "task name {:?} already exists",
                draft.name
            )));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO tasks (name, interpreter, script, params, agent_id, schedule, enabled, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&draft.name)
        .bind(draft.interpreter.to_string())
        .bind(&draft.script)
        .bind(serde_json::to_string(&draft.params)?)
        .bind(&draft.agent_id)
        .bind(&draft.schedule)
        .bind(draft.enabled)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        let task = self
            .find_task(result.last_insert_rowid())
            .await?
            .ok_or_else(|| StoreError::NotFound("task", draft.name.clone()))?;
        self.emit(TaskEvent::Saved(task.clone()));
        Ok(task)
    }

    /// Full replacement of a task's mutable fields.
    pub async fn update_task(&self, id: i64, draft: &TaskDraft) -> Result<Task, StoreError> {
        self.validate_draft(draft).await?;
        if let Some(existing) = self.find_task_by_name(&draft.name).await? {
            if existing.id != id {
                return Err(StoreError::Validation(format!(
                    "task name {:?} already exists",
                    draft.name
                )));
            }
        }

        let result = sqlx::query(
            "UPDATE tasks SET name = ?, interpreter = ?, script = ?, params = ?, agent_id = ?, \
             schedule = ?, enabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&draft.name)
        .bind(draft.interpreter.to_string())
        .bind(&draft.script)
        .bind(serde_json::to_string(&draft.params)?)
        .bind(&draft.agent_id)
        .bind(&draft.schedule)
        .bind(draft.enabled)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("task", id.to_string()));
        }

        let task = self
            .find_task(id)
            .await?
            .ok_or_else(|| StoreError::NotFound("task", id.to_string()))?;
        self.emit(TaskEvent::Saved(task.clone()));
        Ok(task)
    }

    pub async fn destroy_task(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.emit(TaskEvent::Deleted(id));
        }
        Ok(deleted)
    }

    pub async fn find_task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn find_task_by_name(&self, name: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Enabled tasks carrying a cron expression; the scheduler's startup set.
    pub async fn list_scheduled_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM tasks WHERE enabled = 1 AND schedule IS NOT NULL ORDER BY id")
                .fetch_all(self.pool())
                .await?;
        rows.iter().map(task_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    async fn store_with_agent() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_agent("build-01", "super-secret", &["*".to_string()])
            .await
            .unwrap();
        store
    }

    fn draft(name: &str) -> TaskDraft {
        TaskDraft {
            name: name.into(),
            interpreter: Interpreter::Bash,
            script: "echo hi".into(),
            params: Map::new(),
            agent_id: "build-01".into(),
            schedule: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn create_and_fetch() {
        let store = store_with_agent().await;
        let task = store.create_task(&draft("nightly")).await.unwrap();
        assert!(task.enabled);
        assert_eq!(task.interpreter, Interpreter::Bash);

        let by_name = store.find_task_by_name("nightly").await.unwrap().unwrap();
        assert_eq!(by_name.id, task.id);
    }

    #[tokio::test]
    async fn rejects_invalid_drafts() {
        let store = store_with_agent().await;

        let mut bad = draft("x");
        bad.name = "ab".into();
        assert!(matches!(
            store.create_task(&bad).await,
            Err(StoreError::Validation(_))
        ));

        let mut huge = draft("huge-script");
        huge.script = "x".repeat(MAX_SCRIPT_BYTES + 1);
        assert!(matches!(
            store.create_task(&huge).await,
            Err(StoreError::Validation(_))
        ));

        let mut orphan = draft("orphan-task");
        orphan.agent_id = "missing".into();
        assert!(matches!(
            store.create_task(&orphan).await,
            Err(StoreError::NotFound(..))
        ));

        let mut bad_cron = draft("bad-cron");
        bad_cron.schedule = Some("not a cron".into());
        assert!(matches!(
            store.create_task(&bad_cron).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unique_name_enforced() {
        let store = store_with_agent().await;
        store.create_task(&draft("nightly")).await.unwrap();
        assert!(matches!(
            store.create_task(&draft("nightly")).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn mutation_events_reach_subscribers() {
        let store = store_with_agent().await;
        let mut events = store.subscribe_tasks();

        let task = store.create_task(&draft("nightly")).await.unwrap();
        match events.recv().await.unwrap() {
            TaskEvent::Saved(saved) => assert_eq!(saved.id, task.id),
            other => panic!("unexpected event: {other:?}"),
        }

        store.destroy_task(task.id).await.unwrap();
        match events.recv().await.unwrap() {
            TaskEvent::Deleted(id) => assert_eq!(id, task.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scheduled_listing_filters() {
        let store = store_with_agent().await;
        let mut scheduled = draft("on-schedule");
        scheduled.schedule = Some("*/5 * * * *".into());
        store.create_task(&scheduled).await.unwrap();

        let mut disabled = draft("disabled-task");
        disabled.schedule = Some("0 0 * * *".into());
        disabled.enabled = false;
        store.create_task(&disabled).await.unwrap();

        store.create_task(&draft("manual-only")).await.unwrap();

        let listed = store.list_scheduled_tasks().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "on-schedule");
    }
}
