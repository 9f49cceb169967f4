//! Run records: the one table the task manager mutates, always inside a
//! short transaction and always through the retry helper.

use super::{models::*, with_retry, Store, StoreError};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(super) fn run_from_row(row: &SqliteRow) -> Result<TaskRun, StoreError> {
    let status = row
        .try_get::<String, _>("status")?
        .parse::<RunStatus>()
        .map_err(StoreError::Validation)?;
    Ok(TaskRun {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        agent_id: row.try_get("agent_id")?,
        status,
        exit_code: row.try_get("exit_code")?,
        stdout: row.try_get("stdout")?,
        stderr: row.try_get("stderr")?,
        duration_ms: row.try_get("duration_ms")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Creates a pending run for `task`, enforcing the one-active-run-per-
    /// task invariant inside the same transaction as the insert.
    pub async fn create_pending_run(&self, task: &Task) -> Result<TaskRun, StoreError> {
        let pool = self.pool().clone();
        let task_id = task.id;
        let agent_id = task.agent_id.clone();
        with_retry(move || {
            let pool = pool.clone();
            let agent_id = agent_id.clone();
            async move {
                let mut tx = pool.begin().await?;
                let active: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM task_runs WHERE task_id = ? \
                     AND status IN ('pending', 'running')",
                )
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await?;
                if active > 0 {
                    return Err(StoreError::ActiveRun(task_id));
                }

                let result = sqlx::query(
                    "INSERT INTO task_runs (task_id, agent_id, status, created_at) \
                     VALUES (?, ?, 'pending', ?)",
                )
                .bind(task_id)
                .bind(&agent_id)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;

                let row = sqlx::query("SELECT * FROM task_runs WHERE id = ?")
                    .bind(result.last_insert_rowid())
                    .fetch_one(&mut *tx)
                    .await?;
                let run = run_from_row(&row)?;
                tx.commit().await?;
                Ok(run)
            }
        })
        .await
    }

    /// Transitions a pending run to running and stamps started-at.
    pub async fn mark_run_running(&self, id: i64) -> Result<TaskRun, StoreError> {
        let pool = self.pool().clone();
        with_retry(move || {
            let pool = pool.clone();
            async move {
                let mut tx = pool.begin().await?;
                let result = sqlx::query(
                    "UPDATE task_runs SET status = 'running', started_at = ? \
                     WHERE id = ? AND status = 'pending'",
                )
                .bind(Utc::now())
                .bind(id)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound("pending run", id.to_string()));
                }
                let row = sqlx::query("SELECT * FROM task_runs WHERE id = ?")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                let run = run_from_row(&row)?;
                tx.commit().await?;
                Ok(run)
            }
        })
        .await
    }

    /// Writes a terminal state. Returns `None` without touching the row if
    /// the run is already terminal (terminal states are final).
    ///
    /// `stdout`/`stderr` of `None` keep the stored text; `duration_ms` of
    /// `None` (or non-positive) is computed from started-at.
    pub async fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        exit_code: Option<i64>,
        stdout: Option<&str>,
        stderr: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<Option<TaskRun>, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Validation(format!(
                "finish_run called with non-terminal status {status}"
            )));
        }

        let pool = self.pool().clone();
        let stdout = stdout.map(str::to_string);
        let stderr = stderr.map(str::to_string);
        with_retry(move || {
            let pool = pool.clone();
            let stdout = stdout.clone();
            let stderr = stderr.clone();
            async move {
                let mut tx = pool.begin().await?;
                let row = sqlx::query("SELECT * FROM task_runs WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| StoreError::NotFound("run", id.to_string()))?;
                let current = run_from_row(&row)?;
                if current.status.is_terminal() {
                    return Ok(None);
                }

                let now = Utc::now();
                // Runs that never started (queued, then errored) get a
                // zero-length window so duration stays consistent with
                // the finished timestamps.
                let started_at = current.started_at.unwrap_or(now);
                let duration = duration_ms
                    .filter(|d| *d > 0)
                    .unwrap_or_else(|| (now - started_at).num_milliseconds().max(0));

                sqlx::query(
                    "UPDATE task_runs SET status = ?, exit_code = ?, stdout = ?, stderr = ?, \
                     duration_ms = ?, started_at = ?, finished_at = ? WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(exit_code)
                .bind(stdout.as_deref().unwrap_or(&current.stdout))
                .bind(stderr.as_deref().unwrap_or(&current.stderr))
                .bind(duration)
                .bind(started_at)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                let row = sqlx::query("SELECT * FROM task_runs WHERE id = ?")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                let run = run_from_row(&row)?;
                tx.commit().await?;
                Ok(Some(run))
            }
        })
        .await
    }

    /// Startup reconciliation: every run left pending or running by a
    /// previous controller life becomes an error.
    pub async fn sweep_interrupted_runs(&self) -> Result<u64, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM task_runs WHERE status IN ('pending', 'running')",
        )
        .fetch_all(self.pool())
        .await?;

        let mut swept = 0;
        for id in &ids {
            if self
                .finish_run(
                    *id,
                    RunStatus::Error,
                    None,
                    None,
                    Some("interrupted by controller restart"),
                    None,
                )
                .await?
                .is_some()
            {
                swept += 1;
            }
        }
        Ok(swept)
    }

    pub async fn find_run(&self, id: i64) -> Result<Option<TaskRun>, StoreError> {
        let row = sqlx::query("SELECT * FROM task_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Most recent run of a task, the input to dependency gating.
    pub async fn latest_run_for_task(&self, task_id: i64) -> Result<Option<TaskRun>, StoreError> {
        let row = sqlx::query("SELECT * FROM task_runs WHERE task_id = ? ORDER BY id DESC LIMIT 1")
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    pub async fn list_runs_for_task(
        &self,
        task_id: i64,
        limit: i64,
    ) -> Result<Vec<TaskRun>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM task_runs WHERE task_id = ? ORDER BY id DESC LIMIT ?")
                .bind(task_id)
                .bind(limit)
                .fetch_all(self.pool())
                .await?;
        rows.iter().map(run_from_row).collect()
    }
}
