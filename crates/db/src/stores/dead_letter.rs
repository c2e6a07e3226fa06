use casebook_core::chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;

use super::StoreError;
use crate::DbPool;

/// A persisted, reprocessable record of a permanently failing action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRow {
    pub id: i64,
    pub created_at: String,
    pub rule_id: String,
    pub action_type: String,
    pub event_id: String,
    pub app_token: String,
    pub table_id: String,
    pub record_id: String,
    pub error: String,
    pub retry_count: u32,
    pub reprocessed: bool,
}

pub struct DeadLetterStore {
    pool: DbPool,
}

impl DeadLetterStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        rule_id: &str,
        action_type: &str,
        event_id: &str,
        app_token: &str,
        table_id: &str,
        record_id: &str,
        error: &str,
        retry_count: u32,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO dead_letters \
             (created_at, rule_id, action_type, event_id, app_token, table_id, record_id, \
              error, retry_count, reprocessed) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(rule_id)
        .bind(action_type)
        .bind(event_id)
        .bind(app_token)
        .bind(table_id)
        .bind(record_id)
        .bind(error)
        .bind(i64::from(retry_count))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_pending(&self, limit: u32) -> Result<Vec<DeadLetterRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, created_at, rule_id, action_type, event_id, app_token, table_id, \
                    record_id, error, retry_count, reprocessed \
             FROM dead_letters WHERE reprocessed = 0 ORDER BY id ASC LIMIT ?",
        )
        .bind(i64::from(limit.max(1).min(500)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_row).collect()
    }

    pub async fn mark_reprocessed(&self, id: i64) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE dead_letters SET reprocessed = 1 WHERE id = ? AND reprocessed = 0")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> Result<DeadLetterRow, StoreError> {
    let retry_count_raw: i64 = row.try_get("retry_count").map_err(StoreError::Database)?;
    Ok(DeadLetterRow {
        id: row.try_get("id").map_err(StoreError::Database)?,
        created_at: row.try_get("created_at").map_err(StoreError::Database)?,
        rule_id: row.try_get("rule_id").map_err(StoreError::Database)?,
        action_type: row.try_get("action_type").map_err(StoreError::Database)?,
        event_id: row.try_get("event_id").map_err(StoreError::Database)?,
        app_token: row.try_get("app_token").map_err(StoreError::Database)?,
        table_id: row.try_get("table_id").map_err(StoreError::Database)?,
        record_id: row.try_get("record_id").map_err(StoreError::Database)?,
        error: row.try_get("error").map_err(StoreError::Database)?,
        retry_count: u32::try_from(retry_count_raw)
            .map_err(|_| StoreError::Decode(format!("invalid retry_count {retry_count_raw}")))?,
        reprocessed: row.try_get::<i64, _>("reprocessed").map_err(StoreError::Database)? != 0,
    })
}
