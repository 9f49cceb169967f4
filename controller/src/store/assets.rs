//! Global assets: named values injected into every script's environment.

use super::{models::Asset, Store, StoreError};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;

fn asset_from_row(row: &SqliteRow) -> Result<Asset, StoreError> {
    Ok(Asset {
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.chars().count() > 50 {
        return Err(StoreError::Validation(
            "asset key must be 1-50 characters".into(),
        ));
    }
    Ok(())
}

impl Store {
    /// Creates or replaces an asset.
    pub async fn upsert_asset(&self, key: &str, value: &str) -> Result<Asset, StoreError> {
        validate_key(key)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO assets (key, value, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        self.find_asset(key)
            .await?
            .ok_or_else(|| StoreError::NotFound("asset", key.to_string()))
    }

    pub async fn find_asset(&self, key: &str) -> Result<Option<Asset>, StoreError> {
        let row = sqlx::query("SELECT * FROM assets WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(asset_from_row).transpose()
    }

    pub async fn list_assets(&self) -> Result<Vec<Asset>, StoreError> {
        let rows = sqlx::query("SELECT * FROM assets ORDER BY key")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(asset_from_row).collect()
    }

    pub async fn destroy_asset(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM assets WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Key → value snapshot attached to every dispatch.
    pub async fn asset_snapshot(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self
            .list_assets()
            .await?
            .into_iter()
            .map(|asset| (asset.key, asset.value))
            .collect())
    }
}
