use casebook_core::chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::StoreError;
use crate::DbPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayTaskStatus {
    Scheduled,
    Running,
    Done,
    Cancelled,
    Failed,
}

impl DelayTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Decode(format!("invalid delay task status `{other}`"))),
        }
    }
}

/// A persisted delayed sub-pipeline replay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelayTask {
    pub task_id: String,
    pub rule_id: String,
    /// Epoch milliseconds at which the task becomes due.
    pub scheduled_at: i64,
    pub payload: Value,
    pub status: DelayTaskStatus,
    pub created_at: String,
    pub executed_at: Option<String>,
    pub error_detail: Option<String>,
}

pub struct DelayTaskStore {
    pool: DbPool,
}

impl DelayTaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn schedule(
        &self,
        rule_id: &str,
        scheduled_at_ms: i64,
        payload: Value,
    ) -> Result<String, StoreError> {
        let task_id = Uuid::new_v4().to_string();
        let raw = serde_json::to_string(&payload)
            .map_err(|error| StoreError::Decode(format!("delay payload encode failed: {error}")))?;
        sqlx::query(
            "INSERT INTO delay_tasks \
             (task_id, rule_id, scheduled_at, payload_json, status, created_at) \
             VALUES (?, ?, ?, ?, 'scheduled', ?)",
        )
        .bind(&task_id)
        .bind(rule_id)
        .bind(scheduled_at_ms)
        .bind(&raw)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(task_id)
    }

    /// Claims every due scheduled task, flipping it to `running` so a second
    /// scheduler instance cannot pick it up.
    pub async fn claim_due(&self, now_ms: i64) -> Result<Vec<DelayTask>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT task_id, rule_id, scheduled_at, payload_json, status, created_at, \
                    executed_at, error_detail \
             FROM delay_tasks \
             WHERE status = 'scheduled' AND scheduled_at <= ? \
             ORDER BY scheduled_at ASC",
        )
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let task = decode_row(row)?;
            sqlx::query(
                "UPDATE delay_tasks SET status = 'running' \
                 WHERE task_id = ? AND status = 'scheduled'",
            )
            .bind(&task.task_id)
            .execute(&mut *tx)
            .await?;
            tasks.push(DelayTask { status: DelayTaskStatus::Running, ..task });
        }

        tx.commit().await?;
        Ok(tasks)
    }

    pub async fn complete(&self, task_id: &str, error: Option<&str>) -> Result<(), StoreError> {
        let status = if error.is_some() { "failed" } else { "done" };
        sqlx::query(
            "UPDATE delay_tasks SET status = ?, executed_at = ?, error_detail = ? \
             WHERE task_id = ?",
        )
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancels a task that has not started running yet.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE delay_tasks SET status = 'cancelled' \
             WHERE task_id = ? AND status = 'scheduled'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list(
        &self,
        status: Option<DelayTaskStatus>,
        limit: u32,
    ) -> Result<Vec<DelayTask>, StoreError> {
        let limit = i64::from(limit.max(1).min(500));
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT task_id, rule_id, scheduled_at, payload_json, status, created_at, \
                            executed_at, error_detail \
                     FROM delay_tasks WHERE status = ? \
                     ORDER BY scheduled_at ASC, created_at ASC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT task_id, rule_id, scheduled_at, payload_json, status, created_at, \
                            executed_at, error_detail \
                     FROM delay_tasks ORDER BY scheduled_at ASC, created_at ASC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(decode_row).collect()
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<DelayTask>, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, rule_id, scheduled_at, payload_json, status, created_at, \
                    executed_at, error_detail \
             FROM delay_tasks WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode_row).transpose()
    }
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> Result<DelayTask, StoreError> {
    let payload_raw: String = row.try_get("payload_json").map_err(StoreError::Database)?;
    let status_raw: String = row.try_get("status").map_err(StoreError::Database)?;
    Ok(DelayTask {
        task_id: row.try_get("task_id").map_err(StoreError::Database)?,
        rule_id: row.try_get("rule_id").map_err(StoreError::Database)?,
        scheduled_at: row.try_get("scheduled_at").map_err(StoreError::Database)?,
        payload: serde_json::from_str(&payload_raw)
            .map_err(|error| StoreError::Decode(format!("delay payload decode failed: {error}")))?,
        status: DelayTaskStatus::parse(&status_raw)?,
        created_at: row.try_get("created_at").map_err(StoreError::Database)?,
        executed_at: row.try_get("executed_at").map_err(StoreError::Database)?,
        error_detail: row.try_get("error_detail").map_err(StoreError::Database)?,
    })
}
