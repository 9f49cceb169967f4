//! Agent records: credentials, allow-lists, and controller-derived status.

use super::{models::*, validate_identifier, with_retry, Store, StoreError};
use crate::allowlist;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

fn agent_from_row(row: &SqliteRow) -> Result<Agent, StoreError> {
    let allowed_ips: Vec<String> = serde_json::from_str(&row.try_get::<String, _>("allowed_ips")?)?;
    let status = row
        .try_get::<String, _>("status")?
        .parse::<AgentStatus>()
        .map_err(StoreError::Validation)?;
    Ok(Agent {
        id: row.try_get("id")?,
        secret: row.try_get("secret")?,
        allowed_ips,
        status,
        last_seen_at: row.try_get("last_seen_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn validate_agent_fields(
    id: &str,
    secret: &str,
    allowed_ips: &[String],
) -> Result<(), StoreError> {
    validate_identifier("agent id", id)?;
    if secret.len() < 8 {
        return Err(StoreError::Validation(
            "agent secret must be at least 8 bytes".into(),
        ));
    }
    for entry in allowed_ips {
        allowlist::validate_entry(entry).map_err(StoreError::Validation)?;
    }
    Ok(())
}

impl Store {
    /// Creates an agent record. An empty allow-list is accepted but rejects
    /// every connection until entries are added.
    pub async fn create_agent(
        &self,
        id: &str,
        secret: &str,
        allowed_ips: &[String],
    ) -> Result<Agent, StoreError> {
        validate_agent_fields(id, secret, allowed_ips)?;
        if self.find_agent(id).await?.is_some() {
            return Err(StoreError::Validation(format!(
                "agent id {id:?} already exists"
            )));
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO agents (id, secret, allowed_ips, status, created_at) \
             VALUES (?, ?, ?, 'offline', ?)",
        )
        .bind(id)
        .bind(secret)
        .bind(serde_json::to_string(allowed_ips)?)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.find_agent(id)
            .await?
            .ok_or_else(|| StoreError::NotFound("agent", id.to_string()))
    }

    pub async fn find_agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    /// Replaces the agent's secret and allow-list.
    pub async fn update_agent(
        &self,
        id: &str,
        secret: &str,
        allowed_ips: &[String],
    ) -> Result<Agent, StoreError> {
        validate_agent_fields(id, secret, allowed_ips)?;
        let result = sqlx::query("UPDATE agents SET secret = ?, allowed_ips = ? WHERE id = ?")
            .bind(secret)
            .bind(serde_json::to_string(allowed_ips)?)
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("agent", id.to_string()));
        }
        self.find_agent(id)
            .await?
            .ok_or_else(|| StoreError::NotFound("agent", id.to_string()))
    }

    pub async fn destroy_agent(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records a connectivity transition, optionally refreshing last-seen.
    pub async fn set_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let pool = self.pool().clone();
        with_retry(move || {
            let id = id.clone();
            let pool = pool.clone();
            async move {
                match last_seen {
                    Some(seen) => {
                        sqlx::query("UPDATE agents SET status = ?, last_seen_at = ? WHERE id = ?")
                            .bind(status.as_str())
                            .bind(seen)
                            .bind(&id)
                            .execute(&pool)
                            .await?;
                    }
                    None => {
                        sqlx::query("UPDATE agents SET status = ? WHERE id = ?")
                            .bind(status.as_str())
                            .bind(&id)
                            .execute(&pool)
                            .await?;
                    }
                }
                Ok(())
            }
        })
        .await
    }

    /// Single batch update used during shutdown.
    pub async fn set_all_agents_offline(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE agents SET status = 'offline'")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
