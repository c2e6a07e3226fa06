use casebook_core::chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::StoreError;
use crate::DbPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronStatus {
    Active,
    Executing,
    Waiting,
    Paused,
    Cancelled,
}

impl CronStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Executing => "executing",
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "active" => Ok(Self::Active),
            "executing" => Ok(Self::Executing),
            "waiting" => Ok(Self::Waiting),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Decode(format!("invalid cron status `{other}`"))),
        }
    }
}

/// A recurring job. `payload` carries the same `{actions, context}` shape the
/// delay replay uses; only the schedule differs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub job_id: String,
    pub cron_expr: String,
    pub payload: Value,
    pub rule_id: String,
    pub status: CronStatus,
    /// Epoch milliseconds of the next firing.
    pub next_run_at: i64,
    pub created_at: String,
    pub updated_at: String,
    pub last_run_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub last_failure_at: Option<i64>,
    pub last_error: Option<String>,
    pub pause_reason: Option<String>,
    pub paused_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub execution_count: u32,
}

pub struct NewCronJob {
    pub cron_expr: String,
    pub payload: Value,
    pub rule_id: String,
    pub next_run_at: i64,
    pub max_consecutive_failures: u32,
}

/// Cron job queue with the active → executing → waiting cycle. A job that
/// fails `max_consecutive_failures` times in a row is paused rather than
/// rescheduled; `resume` puts it back into rotation.
pub struct CronStore {
    pool: DbPool,
}

impl CronStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn schedule(&self, job: NewCronJob) -> Result<String, StoreError> {
        let job_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&job.payload)
            .map_err(|error| StoreError::Decode(format!("cron payload encode failed: {error}")))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO cron_jobs \
             (job_id, cron_expr, payload_json, rule_id, status, next_run_at, created_at, \
              updated_at, max_consecutive_failures) \
             VALUES (?, ?, ?, ?, 'active', ?, ?, ?, ?)",
        )
        .bind(&job_id)
        .bind(&job.cron_expr)
        .bind(&payload)
        .bind(&job.rule_id)
        .bind(job.next_run_at)
        .bind(&now)
        .bind(&now)
        .bind(i64::from(job.max_consecutive_failures.max(1)))
        .execute(&self.pool)
        .await?;
        Ok(job_id)
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<CronJob>, StoreError> {
        let row = sqlx::query(&select_sql("WHERE job_id = ?"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(decode_row).transpose()
    }

    pub async fn list(
        &self,
        status: Option<CronStatus>,
        limit: u32,
    ) -> Result<Vec<CronJob>, StoreError> {
        let limit = i64::from(limit.max(1).min(500));
        let rows = match status {
            Some(status) => {
                sqlx::query(&select_sql(
                    "WHERE status = ? ORDER BY next_run_at ASC, created_at ASC LIMIT ?",
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&select_sql("ORDER BY next_run_at ASC, created_at ASC LIMIT ?"))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(decode_row).collect()
    }

    /// Moves due `waiting` jobs back to `active` so the next acquire picks
    /// them up.
    pub async fn activate_waiting(&self, now_ms: i64) -> Result<u32, StoreError> {
        let result = sqlx::query(
            "UPDATE cron_jobs SET status = 'active', updated_at = ? \
             WHERE status = 'waiting' AND next_run_at <= ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as u32)
    }

    /// Claims due active jobs, flipping them to `executing` so a second
    /// scheduler instance cannot double-fire them.
    pub async fn acquire_due(&self, now_ms: i64, limit: u32) -> Result<Vec<CronJob>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&select_sql(
            "WHERE status = 'active' AND next_run_at <= ? \
             ORDER BY next_run_at ASC, created_at ASC LIMIT ?",
        ))
        .bind(now_ms)
        .bind(i64::from(limit.max(1).min(500)))
        .fetch_all(&mut *tx)
        .await?;

        let mut acquired = Vec::with_capacity(rows.len());
        for row in rows {
            let job = decode_row(row)?;
            sqlx::query(
                "UPDATE cron_jobs SET status = 'executing', last_run_at = ?, updated_at = ? \
                 WHERE job_id = ? AND status = 'active'",
            )
            .bind(now_ms)
            .bind(Utc::now().to_rfc3339())
            .bind(&job.job_id)
            .execute(&mut *tx)
            .await?;
            acquired.push(CronJob {
                status: CronStatus::Executing,
                last_run_at: Some(now_ms),
                ..job
            });
        }
        tx.commit().await?;
        Ok(acquired)
    }

    /// Records a successful run: back to `waiting` at the next fire time with
    /// the failure streak reset.
    pub async fn mark_success(&self, job_id: &str, next_run_at: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE cron_jobs SET status = 'waiting', next_run_at = ?, last_success_at = ?, \
             last_error = NULL, pause_reason = NULL, paused_at = NULL, \
             consecutive_failures = 0, execution_count = execution_count + 1, updated_at = ? \
             WHERE job_id = ? AND status = 'executing'",
        )
        .bind(next_run_at)
        .bind(Utc::now().timestamp_millis())
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a failed run. Returns `(updated, paused)`: once the
    /// consecutive-failure streak reaches the job's threshold the job is
    /// paused instead of rescheduled.
    pub async fn mark_failure(
        &self,
        job_id: &str,
        next_run_at: i64,
        detail: &str,
    ) -> Result<(bool, bool), StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT consecutive_failures, max_consecutive_failures FROM cron_jobs \
             WHERE job_id = ? AND status = 'executing'",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok((false, false));
        };
        let failures: i64 = row.try_get("consecutive_failures").map_err(StoreError::Database)?;
        let threshold: i64 =
            row.try_get("max_consecutive_failures").map_err(StoreError::Database)?;
        let next_failures = failures + 1;
        let paused = next_failures >= threshold.max(1);
        let now_ms = Utc::now().timestamp_millis();
        let now = Utc::now().to_rfc3339();

        if paused {
            sqlx::query(
                "UPDATE cron_jobs SET status = 'paused', paused_at = ?, \
                 pause_reason = ?, last_failure_at = ?, last_error = ?, \
                 consecutive_failures = ?, execution_count = execution_count + 1, \
                 updated_at = ? \
                 WHERE job_id = ? AND status = 'executing'",
            )
            .bind(now_ms)
            .bind(format!("consecutive failures reached {}", threshold.max(1)))
            .bind(now_ms)
            .bind(detail)
            .bind(next_failures)
            .bind(&now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE cron_jobs SET status = 'waiting', next_run_at = ?, \
                 last_failure_at = ?, last_error = ?, consecutive_failures = ?, \
                 execution_count = execution_count + 1, updated_at = ? \
                 WHERE job_id = ? AND status = 'executing'",
            )
            .bind(next_run_at)
            .bind(now_ms)
            .bind(detail)
            .bind(next_failures)
            .bind(&now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((true, paused))
    }

    /// Lifts a failure pause; an overdue fire time is clamped to now.
    pub async fn resume(&self, job_id: &str, now_ms: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE cron_jobs SET status = 'active', paused_at = NULL, pause_reason = NULL, \
             consecutive_failures = 0, next_run_at = MAX(next_run_at, ?), updated_at = ? \
             WHERE job_id = ? AND status = 'paused'",
        )
        .bind(now_ms)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cancels a job that is not mid-execution.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE cron_jobs SET status = 'cancelled', cancelled_at = ?, updated_at = ? \
             WHERE job_id = ? AND status NOT IN ('cancelled', 'executing')",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn select_sql(suffix: &str) -> String {
    format!(
        "SELECT job_id, cron_expr, payload_json, rule_id, status, next_run_at, created_at, \
                updated_at, last_run_at, last_success_at, last_failure_at, last_error, \
                pause_reason, paused_at, cancelled_at, consecutive_failures, \
                max_consecutive_failures, execution_count \
         FROM cron_jobs {suffix}"
    )
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> Result<CronJob, StoreError> {
    let payload_raw: String = row.try_get("payload_json").map_err(StoreError::Database)?;
    let status_raw: String = row.try_get("status").map_err(StoreError::Database)?;
    let count = |name: &str| -> Result<u32, StoreError> {
        let raw: i64 = row.try_get(name).map_err(StoreError::Database)?;
        u32::try_from(raw).map_err(|_| StoreError::Decode(format!("invalid {name} {raw}")))
    };

    Ok(CronJob {
        job_id: row.try_get("job_id").map_err(StoreError::Database)?,
        cron_expr: row.try_get("cron_expr").map_err(StoreError::Database)?,
        payload: serde_json::from_str(&payload_raw)
            .map_err(|error| StoreError::Decode(format!("cron payload decode failed: {error}")))?,
        rule_id: row.try_get("rule_id").map_err(StoreError::Database)?,
        status: CronStatus::parse(&status_raw)?,
        next_run_at: row.try_get("next_run_at").map_err(StoreError::Database)?,
        created_at: row.try_get("created_at").map_err(StoreError::Database)?,
        updated_at: row.try_get("updated_at").map_err(StoreError::Database)?,
        last_run_at: row.try_get("last_run_at").map_err(StoreError::Database)?,
        last_success_at: row.try_get("last_success_at").map_err(StoreError::Database)?,
        last_failure_at: row.try_get("last_failure_at").map_err(StoreError::Database)?,
        last_error: row.try_get("last_error").map_err(StoreError::Database)?,
        pause_reason: row.try_get("pause_reason").map_err(StoreError::Database)?,
        paused_at: row.try_get("paused_at").map_err(StoreError::Database)?,
        cancelled_at: row.try_get("cancelled_at").map_err(StoreError::Database)?,
        consecutive_failures: count("consecutive_failures")?,
        max_consecutive_failures: count("max_consecutive_failures")?,
        execution_count: count("execution_count")?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CronStatus, CronStore, NewCronJob};
    use crate::migrations::run_pending;

    async fn store() -> CronStore {
        let pool = crate::connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        CronStore::new(pool)
    }

    fn job(next_run_at: i64, max_failures: u32) -> NewCronJob {
        NewCronJob {
            cron_expr: "0 9 * * *".to_owned(),
            payload: json!({"actions": [{"type": "log.write", "template": "tick"}], "context": {}}),
            rule_id: "R001".to_owned(),
            next_run_at,
            max_consecutive_failures: max_failures,
        }
    }

    #[tokio::test]
    async fn acquire_flips_due_jobs_to_executing_exactly_once() {
        let store = store().await;
        let due = store.schedule(job(1_000, 3)).await.expect("schedule");
        store.schedule(job(99_000, 3)).await.expect("schedule future");

        let acquired = store.acquire_due(5_000, 10).await.expect("acquire");
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].job_id, due);
        assert_eq!(acquired[0].status, CronStatus::Executing);
        assert_eq!(acquired[0].last_run_at, Some(5_000));

        assert!(store.acquire_due(5_000, 10).await.expect("acquire").is_empty());
    }

    #[tokio::test]
    async fn success_cycles_through_waiting_and_reactivates() {
        let store = store().await;
        let job_id = store.schedule(job(1_000, 3)).await.expect("schedule");
        store.acquire_due(5_000, 10).await.expect("acquire");

        assert!(store.mark_success(&job_id, 60_000).await.expect("success"));
        let reloaded = store.get(&job_id).await.expect("get").expect("present");
        assert_eq!(reloaded.status, CronStatus::Waiting);
        assert_eq!(reloaded.next_run_at, 60_000);
        assert_eq!(reloaded.execution_count, 1);
        assert_eq!(reloaded.consecutive_failures, 0);

        // Not yet due: stays waiting.
        assert_eq!(store.activate_waiting(30_000).await.expect("activate"), 0);
        // Due again: back in rotation.
        assert_eq!(store.activate_waiting(70_000).await.expect("activate"), 1);
        let reactivated = store.acquire_due(70_000, 10).await.expect("acquire");
        assert_eq!(reactivated.len(), 1);
    }

    #[tokio::test]
    async fn repeated_failures_pause_at_the_threshold() {
        let store = store().await;
        let job_id = store.schedule(job(1_000, 2)).await.expect("schedule");

        store.acquire_due(5_000, 10).await.expect("acquire");
        let (updated, paused) =
            store.mark_failure(&job_id, 60_000, "boom 1").await.expect("failure");
        assert!(updated);
        assert!(!paused, "first failure reschedules");

        store.activate_waiting(70_000).await.expect("activate");
        store.acquire_due(70_000, 10).await.expect("acquire");
        let (updated, paused) =
            store.mark_failure(&job_id, 120_000, "boom 2").await.expect("failure");
        assert!(updated);
        assert!(paused, "threshold reached");

        let reloaded = store.get(&job_id).await.expect("get").expect("present");
        assert_eq!(reloaded.status, CronStatus::Paused);
        assert_eq!(reloaded.consecutive_failures, 2);
        assert_eq!(reloaded.last_error.as_deref(), Some("boom 2"));
        assert!(reloaded.pause_reason.expect("reason").contains("2"));
    }

    #[tokio::test]
    async fn resume_clears_the_pause_and_clamps_overdue_fire_times() {
        let store = store().await;
        let job_id = store.schedule(job(1_000, 1)).await.expect("schedule");
        store.acquire_due(5_000, 10).await.expect("acquire");
        store.mark_failure(&job_id, 6_000, "boom").await.expect("failure");

        assert!(store.resume(&job_id, 50_000).await.expect("resume"));
        let reloaded = store.get(&job_id).await.expect("get").expect("present");
        assert_eq!(reloaded.status, CronStatus::Active);
        assert_eq!(reloaded.consecutive_failures, 0);
        assert!(reloaded.next_run_at >= 50_000, "overdue fire time clamped to now");

        assert!(!store.resume(&job_id, 50_000).await.expect("resume again is a no-op"));
    }

    #[tokio::test]
    async fn cancel_skips_executing_jobs() {
        let store = store().await;
        let job_id = store.schedule(job(1_000, 3)).await.expect("schedule");
        store.acquire_due(5_000, 10).await.expect("acquire");

        assert!(!store.cancel(&job_id).await.expect("executing job is not cancellable"));
        store.mark_success(&job_id, 60_000).await.expect("success");
        assert!(store.cancel(&job_id).await.expect("cancel"));
        assert_eq!(
            store.get(&job_id).await.expect("get").expect("present").status,
            CronStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = store().await;
        store.schedule(job(1_000, 3)).await.expect("schedule");
        store.schedule(job(2_000, 3)).await.expect("schedule");
        store.acquire_due(1_500, 10).await.expect("acquire");

        let active = store.list(Some(CronStatus::Active), 10).await.expect("list");
        assert_eq!(active.len(), 1);
        let executing = store.list(Some(CronStatus::Executing), 10).await.expect("list");
        assert_eq!(executing.len(), 1);
        assert_eq!(store.list(None, 10).await.expect("list").len(), 2);
    }
}
