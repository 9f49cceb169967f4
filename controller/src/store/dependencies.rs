//! Dependency edges and the acyclicity guard.

use super::{models::*, Store, StoreError};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::{HashMap, HashSet};

fn dependency_from_row(row: &SqliteRow) -> Result<TaskDependency, StoreError> {
    let condition = row
        .try_get::<String, _>("condition")?
        .parse::<TriggerCondition>()
        .map_err(StoreError::Validation)?;
    Ok(TaskDependency {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        child_id: row.try_get("child_id")?,
        condition,
    })
}

/// DFS over the in-memory edge list: would adding `parent → child` close a
/// cycle? True iff `parent` is reachable from `child` over existing edges.
fn creates_cycle(edges: &[(i64, i64)], parent: i64, child: i64) -> bool {
    if parent == child {
        return true;
    }
    let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
    for (p, c) in edges {
        adjacency.entry(*p).or_default().push(*c);
    }

    let mut stack = vec![child];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == parent {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = adjacency.get(&node) {
            stack.extend(next);
        }
    }
    false
}

impl Store {
    /// Inserts a `parent → child` edge after checking the self-edge,
    /// duplicate-pair, existence, and acyclicity invariants.
    pub async fn create_dependency(
        &self,
        parent_id: i64,
        child_id: i64,
        condition: TriggerCondition,
    ) -> Result<TaskDependency, StoreError> {
        if parent_id == child_id {
            return Err(StoreError::Validation(
                "a task cannot depend on itself".into(),
            ));
        }
        if self.find_task(parent_id).await?.is_none() {
            return Err(StoreError::NotFound("task", parent_id.to_string()));
        }
        if self.find_task(child_id).await?.is_none() {
            return Err(StoreError::NotFound("task", child_id.to_string()));
        }

        let edges: Vec<(i64, i64)> =
            sqlx::query_as("SELECT parent_id, child_id FROM task_dependencies")
                .fetch_all(self.pool())
                .await?;
        if edges.contains(&(parent_id, child_id)) {
            return Err(StoreError::Validation(format!(
                "dependency {parent_id} -> {child_id} already exists"
            )));
        }
        if creates_cycle(&edges, parent_id, child_id) {
            return Err(StoreError::DependencyCycle {
                parent: parent_id,
                child: child_id,
            });
        }

        let result = sqlx::query(
            "INSERT INTO task_dependencies (parent_id, child_id, condition) VALUES (?, ?, ?)",
        )
        .bind(parent_id)
        .bind(child_id)
        .bind(condition.as_str())
        .execute(self.pool())
        .await?;

        let row = sqlx::query("SELECT * FROM task_dependencies WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(self.pool())
            .await?;
        dependency_from_row(&row)
    }

    /// Edges whose child is `child_id`: the gate inputs for that task.
    pub async fn parents_of(&self, child_id: i64) -> Result<Vec<TaskDependency>, StoreError> {
        let rows = sqlx::query("SELECT * FROM task_dependencies WHERE child_id = ? ORDER BY id")
            .bind(child_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(dependency_from_row).collect()
    }

    /// Edges whose parent is `parent_id`: the fan-out set after a terminal.
    pub async fn children_of(&self, parent_id: i64) -> Result<Vec<TaskDependency>, StoreError> {
        let rows = sqlx::query("SELECT * FROM task_dependencies WHERE parent_id = ? ORDER BY id")
            .bind(parent_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(dependency_from_row).collect()
    }

    pub async fn list_dependencies(&self) -> Result<Vec<TaskDependency>, StoreError> {
        let rows = sqlx::query("SELECT * FROM task_dependencies ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(dependency_from_row).collect()
    }

    pub async fn destroy_dependency(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM task_dependencies WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
