use casebook_core::chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use super::StoreError;
use crate::DbPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderPriority {
    Low,
    Medium,
    High,
}

impl ReminderPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(StoreError::Decode(format!("invalid reminder priority `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Done,
    Cancelled,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Decode(format!("invalid reminder status `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub user_id: String,
    pub content: String,
    /// Epoch milliseconds, UTC.
    pub due_at: i64,
    pub priority: ReminderPriority,
    pub case_id: Option<String>,
    pub status: ReminderStatus,
    pub chat_id: Option<String>,
    pub notified_at: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub source: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct NewReminder {
    pub user_id: String,
    pub content: String,
    pub due_at: i64,
    pub priority: ReminderPriority,
    pub case_id: Option<String>,
    pub chat_id: Option<String>,
    pub source: String,
}

/// Durable reminder CRUD plus the advisory-lock dispatch claim used by the
/// background scheduler. A claim sets `locked_by`/`locked_at`; stale locks
/// (crashed instance) expire after the lock TTL.
pub struct ReminderStore {
    pool: DbPool,
}

impl ReminderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, reminder: NewReminder) -> Result<Reminder, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO reminders \
             (id, user_id, content, due_at, priority, case_id, status, chat_id, retry_count, \
              source, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, 0, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&reminder.user_id)
        .bind(&reminder.content)
        .bind(reminder.due_at)
        .bind(reminder.priority.as_str())
        .bind(&reminder.case_id)
        .bind(&reminder.chat_id)
        .bind(&reminder.source)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&id).await?.ok_or_else(|| {
            StoreError::Decode("reminder vanished immediately after insert".to_owned())
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Reminder>, StoreError> {
        let row = sqlx::query(&select_sql("WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(decode_row).transpose()
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
        status: Option<ReminderStatus>,
        limit: u32,
    ) -> Result<Vec<Reminder>, StoreError> {
        let limit = i64::from(limit.max(1).min(200));
        let rows = match status {
            Some(status) => {
                sqlx::query(&select_sql(
                    "WHERE user_id = ? AND status = ? ORDER BY due_at ASC LIMIT ?",
                ))
                .bind(user_id)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&select_sql("WHERE user_id = ? ORDER BY due_at ASC LIMIT ?"))
                    .bind(user_id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(decode_row).collect()
    }

    pub async fn set_status(
        &self,
        id: &str,
        user_id: &str,
        status: ReminderStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE reminders SET status = ?, updated_at = ? \
             WHERE id = ? AND user_id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(&self, id: &str, user_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM reminders WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Claims due pending reminders for this scheduler instance. Rows already
    /// locked by a live instance are skipped; locks older than `lock_ttl_secs`
    /// are treated as stale and stolen.
    pub async fn claim_due(
        &self,
        instance_id: &str,
        now_ms: i64,
        lock_ttl_secs: i64,
        limit: u32,
    ) -> Result<Vec<Reminder>, StoreError> {
        let stale_before = Utc::now().timestamp() - lock_ttl_secs.max(1);
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&select_sql(
            "WHERE status = 'pending' AND due_at <= ? \
               AND (locked_by IS NULL OR locked_at < ?) \
             ORDER BY due_at ASC LIMIT ?",
        ))
        .bind(now_ms)
        .bind(stale_before)
        .bind(i64::from(limit.max(1).min(200)))
        .fetch_all(&mut *tx)
        .await?;

        let now_ts = Utc::now().timestamp();
        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let reminder = decode_row(row)?;
            let updated = sqlx::query(
                "UPDATE reminders SET locked_by = ?, locked_at = ? \
                 WHERE id = ? AND status = 'pending' \
                   AND (locked_by IS NULL OR locked_at < ?)",
            )
            .bind(instance_id)
            .bind(now_ts)
            .bind(&reminder.id)
            .bind(stale_before)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                claimed.push(reminder);
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    /// Marks a claimed reminder as delivered and releases the lock.
    pub async fn mark_notified(&self, id: &str, instance_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE reminders SET status = 'done', notified_at = ?, locked_by = NULL, \
             locked_at = NULL, updated_at = ? \
             WHERE id = ? AND locked_by = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Releases a claim after a dispatch failure; the reminder stays pending
    /// with the error recorded for the next attempt.
    pub async fn release_failed(
        &self,
        id: &str,
        instance_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE reminders SET locked_by = NULL, locked_at = NULL, \
             retry_count = retry_count + 1, last_error = ?, updated_at = ? \
             WHERE id = ? AND locked_by = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Frees a dispatch slot after a failed delivery so a retry can send.
    pub async fn remove_dispatch(
        &self,
        business_id: &str,
        target_day: &str,
        offset: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM reminder_dispatches \
             WHERE business_id = ? AND target_day = ? AND offset = ?",
        )
        .bind(business_id)
        .bind(target_day)
        .bind(offset)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Dedupe gateway: records one dispatch per `(business_id, target_day,
    /// offset)`. Returns false when that slot was already sent.
    pub async fn record_dispatch(
        &self,
        business_id: &str,
        target_day: &str,
        offset: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO reminder_dispatches (business_id, target_day, offset, sent_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(business_id)
        .bind(target_day)
        .bind(offset)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn select_sql(suffix: &str) -> String {
    format!(
        "SELECT id, user_id, content, due_at, priority, case_id, status, chat_id, notified_at, \
                retry_count, last_error, source, created_at, updated_at \
         FROM reminders {suffix}"
    )
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> Result<Reminder, StoreError> {
    let priority_raw: String = row.try_get("priority").map_err(StoreError::Database)?;
    let status_raw: String = row.try_get("status").map_err(StoreError::Database)?;
    let retry_count_raw: i64 = row.try_get("retry_count").map_err(StoreError::Database)?;
    Ok(Reminder {
        id: row.try_get("id").map_err(StoreError::Database)?,
        user_id: row.try_get("user_id").map_err(StoreError::Database)?,
        content: row.try_get("content").map_err(StoreError::Database)?,
        due_at: row.try_get("due_at").map_err(StoreError::Database)?,
        priority: ReminderPriority::parse(&priority_raw)?,
        case_id: row.try_get("case_id").map_err(StoreError::Database)?,
        status: ReminderStatus::parse(&status_raw)?,
        chat_id: row.try_get("chat_id").map_err(StoreError::Database)?,
        notified_at: row.try_get("notified_at").map_err(StoreError::Database)?,
        retry_count: u32::try_from(retry_count_raw)
            .map_err(|_| StoreError::Decode(format!("invalid retry_count {retry_count_raw}")))?,
        last_error: row.try_get("last_error").map_err(StoreError::Database)?,
        source: row.try_get("source").map_err(StoreError::Database)?,
        created_at: row.try_get("created_at").map_err(StoreError::Database)?,
        updated_at: row.try_get("updated_at").map_err(StoreError::Database)?,
    })
}
