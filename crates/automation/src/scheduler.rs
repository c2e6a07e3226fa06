use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use casebook_core::chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::processor::AutomationEngine;

/// Replays persisted delay tasks when they fall due, and drives the optional
/// polling compensation and periodic schema refresh loops.
pub struct DelayScheduler {
    engine: Arc<AutomationEngine>,
}

impl DelayScheduler {
    pub fn new(engine: Arc<AutomationEngine>) -> Self {
        Self { engine }
    }

    /// Claims and executes every due task once. Returns how many ran.
    pub async fn run_once(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let due = match self.engine.executors_delay_store().claim_due(now_ms).await {
            Ok(due) => due,
            Err(error) => {
                warn!(
                    event_name = "automation.delay.claim_failed",
                    error = %error,
                    "delay store unavailable"
                );
                return 0;
            }
        };

        let mut executed = 0;
        for task in due {
            let result = self.engine.execute_delayed(&task.rule_id, &task.payload).await;
            let error = result.as_ref().err().map(|error| error.to_owned());
            if let Err(store_error) = self
                .engine
                .executors_delay_store()
                .complete(&task.task_id, error.as_deref())
                .await
            {
                warn!(
                    event_name = "automation.delay.complete_failed",
                    task_id = %task.task_id,
                    error = %store_error,
                    "delay task completion could not be recorded"
                );
            }
            match error {
                None => {
                    executed += 1;
                    info!(
                        event_name = "automation.delay.executed",
                        task_id = %task.task_id,
                        rule_id = %task.rule_id,
                        "delayed pipeline replayed"
                    );
                }
                Some(error) => {
                    warn!(
                        event_name = "automation.delay.failed",
                        task_id = %task.task_id,
                        rule_id = %task.rule_id,
                        error = %error,
                        "delayed pipeline failed"
                    );
                }
            }
        }
        executed
    }

    /// Background loop; ticks every second so short delays stay accurate.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

/// Next firing of a cron expression after `now_ms`, in epoch milliseconds.
/// Five-field crontab expressions get a seconds column prefixed; six- and
/// seven-field forms pass through.
pub fn next_cron_run_ms(cron_expr: &str, now_ms: i64) -> Result<i64, String> {
    let trimmed = cron_expr.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_owned(),
        fields => {
            return Err(format!(
                "invalid cron expression `{trimmed}`: expected 5-7 fields, got {fields}"
            ))
        }
    };
    let schedule = Schedule::from_str(&normalized)
        .map_err(|error| format!("invalid cron expression `{trimmed}`: {error}"))?;
    let now = DateTime::<Utc>::from_timestamp_millis(now_ms)
        .ok_or_else(|| format!("timestamp {now_ms} out of range"))?;
    schedule
        .after(&now)
        .next()
        .map(|next| next.timestamp_millis())
        .ok_or_else(|| format!("cron expression `{trimmed}` has no future firing"))
}

/// Drives recurring cron jobs: reactivates waiting jobs, claims due ones,
/// replays their `{actions, context}` payload, and advances the job state
/// machine. Repeated failures pause a job at its threshold; `resume` on the
/// management surface puts it back.
pub struct CronScheduler {
    engine: Arc<AutomationEngine>,
}

impl CronScheduler {
    pub fn new(engine: Arc<AutomationEngine>) -> Self {
        Self { engine }
    }

    /// One poll cycle; returns how many jobs ran successfully.
    pub async fn run_once(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let store = &self.engine.cron_jobs;

        if let Err(error) = store.activate_waiting(now_ms).await {
            warn!(
                event_name = "automation.cron.activate_failed",
                error = %error,
                "cron store unavailable"
            );
            return 0;
        }
        let due = match store.acquire_due(now_ms, 100).await {
            Ok(due) => due,
            Err(error) => {
                warn!(
                    event_name = "automation.cron.claim_failed",
                    error = %error,
                    "cron store unavailable"
                );
                return 0;
            }
        };

        let mut executed = 0;
        for job in due {
            let next_run_at = match next_cron_run_ms(&job.cron_expr, now_ms) {
                Ok(next_run_at) => next_run_at,
                Err(parse_error) => {
                    // An unparsable expression can never fire again; push the
                    // failure through the state machine so it pauses at the
                    // threshold instead of spinning.
                    warn!(
                        event_name = "automation.cron.bad_expression",
                        job_id = %job.job_id,
                        error = %parse_error,
                        "cron expression rejected"
                    );
                    if let Err(store_error) =
                        store.mark_failure(&job.job_id, now_ms + 60_000, &parse_error).await
                    {
                        warn!(
                            event_name = "automation.cron.mark_failed",
                            job_id = %job.job_id,
                            error = %store_error,
                            "cron failure could not be recorded"
                        );
                    }
                    continue;
                }
            };

            match self.engine.execute_delayed(&job.rule_id, &job.payload).await {
                Ok(()) => {
                    if let Err(store_error) =
                        store.mark_success(&job.job_id, next_run_at).await
                    {
                        warn!(
                            event_name = "automation.cron.mark_failed",
                            job_id = %job.job_id,
                            error = %store_error,
                            "cron success could not be recorded"
                        );
                    }
                    executed += 1;
                    info!(
                        event_name = "automation.cron.executed",
                        job_id = %job.job_id,
                        rule_id = %job.rule_id,
                        next_run_at,
                        "cron job fired"
                    );
                }
                Err(error) => {
                    match store.mark_failure(&job.job_id, next_run_at, &error).await {
                        Ok((_, paused)) => warn!(
                            event_name = "automation.cron.failed",
                            job_id = %job.job_id,
                            rule_id = %job.rule_id,
                            paused,
                            error = %error,
                            "cron job failed"
                        ),
                        Err(store_error) => warn!(
                            event_name = "automation.cron.mark_failed",
                            job_id = %job.job_id,
                            error = %store_error,
                            "cron failure could not be recorded"
                        ),
                    }
                }
            }
        }
        executed
    }

    /// Background loop; only runs when `AUTOMATION_CRON_ENABLED` is set.
    pub fn spawn(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.engine.config.cron_enabled {
            return None;
        }
        let interval =
            Duration::from_secs(self.engine.config.cron_interval_secs.clamp(5, 3600));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        }))
    }
}

/// Polling compensation: periodically scans every rule table using the
/// checkpoint cursor. Only runs when `AUTOMATION_POLLER_ENABLED` is set.
pub fn spawn_poller(engine: Arc<AutomationEngine>) -> Option<JoinHandle<()>> {
    if !engine.config.poller_enabled {
        return None;
    }
    let interval = Duration::from_secs(engine.config.poller_interval_secs.max(30));
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for (app_token, table_id) in engine.poll_targets() {
                match engine.scan_table(&app_token, &table_id, false, false).await {
                    Ok(report) => info!(
                        event_name = "automation.poller.scan",
                        table_id = %table_id.0,
                        scanned = report.counters.scanned,
                        changed = report.counters.changed,
                        "poller scan finished"
                    ),
                    Err(error) => warn!(
                        event_name = "automation.poller.scan_failed",
                        table_id = %table_id.0,
                        error = %error,
                        "poller scan failed"
                    ),
                }
            }
        }
    }))
}

/// Periodic schema refresh across all rule tables.
pub fn spawn_schema_refresher(
    engine: Arc<AutomationEngine>,
    watcher: Arc<crate::schema_watcher::SchemaWatcher>,
) -> Option<JoinHandle<()>> {
    if !engine.config.schema_sync_enabled || engine.config.schema_sync_interval_secs == 0 {
        return None;
    }
    let interval = Duration::from_secs(engine.config.schema_sync_interval_secs.max(60));
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for (app_token, table_id) in engine.poll_targets() {
                if let Err(error) = watcher.refresh_table(&app_token, &table_id, "poll").await {
                    warn!(
                        event_name = "automation.schema.poll_failed",
                        table_id = %table_id.0,
                        error = %error,
                        "periodic schema refresh failed"
                    );
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use casebook_core::rules::RuleRegistry;
    use casebook_db::DelayTaskStatus;
    use serde_json::json;

    use casebook_db::{CronStatus, NewCronJob};

    use crate::executors::test_support::ScriptedBitable;
    use crate::executors::ExecutorSet;
    use crate::http_guard::OutboundHostGuard;
    use crate::processor::AutomationEngine;

    use super::{next_cron_run_ms, CronScheduler, DelayScheduler};

    async fn engine() -> Arc<AutomationEngine> {
        let pool =
            casebook_db::connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        casebook_db::migrations::run_pending(&pool).await.expect("migrations");

        let mut config = casebook_core::config::AppConfig::default().automation;
        config.enabled = true;

        let api = Arc::new(ScriptedBitable::default());
        let delays = Arc::new(casebook_db::DelayTaskStore::new(pool.clone()));
        let executors = ExecutorSet::new(
            api.clone(),
            delays,
            OutboundHostGuard::new(&[]),
            3,
            0,
            5,
            false,
        );

        Arc::new(AutomationEngine::new(
            config,
            casebook_core::config::AppConfig::default().bitable,
            api,
            Arc::new(RuleRegistry::from_yaml("rules: []").expect("rules")),
            casebook_db::SnapshotStore::new(pool.clone()),
            casebook_db::IdempotencyStore::new(pool.clone(), 3600),
            casebook_db::CheckpointStore::new(pool.clone()),
            casebook_db::RunLogStore::new(pool.clone()),
            casebook_db::DeadLetterStore::new(pool.clone()),
            Arc::new(casebook_db::CronStore::new(pool.clone())),
            executors,
        ))
    }

    #[tokio::test]
    async fn due_tasks_execute_and_complete() {
        let engine = engine().await;
        let store = engine.executors_delay_store();
        let task_id = store
            .schedule(
                "R001",
                0,
                json!({
                    "actions": [{"type": "log.write", "template": "后续 {record_id}"}],
                    "context": {
                        "app_token": "appA",
                        "table_id": "tblCases",
                        "record_id": "recX",
                        "event_id": "evt-1",
                        "fields": {}
                    }
                }),
            )
            .await
            .expect("schedule");

        let scheduler = DelayScheduler::new(engine);
        assert_eq!(scheduler.run_once().await, 1);

        let task = store.get(&task_id).await.expect("get").expect("present");
        assert_eq!(task.status, DelayTaskStatus::Done);
    }

    #[tokio::test]
    async fn future_tasks_are_left_alone() {
        let engine = engine().await;
        let store = engine.executors_delay_store();
        let task_id = store
            .schedule("R001", i64::MAX, json!({"actions": [], "context": {}}))
            .await
            .expect("schedule");

        let scheduler = DelayScheduler::new(engine);
        assert_eq!(scheduler.run_once().await, 0);
        let task = store.get(&task_id).await.expect("get").expect("present");
        assert_eq!(task.status, DelayTaskStatus::Scheduled);
    }

    #[tokio::test]
    async fn malformed_payloads_mark_the_task_failed() {
        let engine = engine().await;
        let store = engine.executors_delay_store();
        let task_id = store
            .schedule("R001", 0, json!({"actions": [{"type": "not.a.action"}], "context": {}}))
            .await
            .expect("schedule");

        let scheduler = DelayScheduler::new(engine);
        assert_eq!(scheduler.run_once().await, 0);
        let task = store.get(&task_id).await.expect("get").expect("present");
        assert_eq!(task.status, DelayTaskStatus::Failed);
        assert!(task.error_detail.is_some());
    }

    #[test]
    fn cron_expressions_accept_crontab_and_seconds_forms() {
        // 5-field crontab form gets a seconds column prefixed.
        let next = next_cron_run_ms("0 9 * * *", 1_770_393_600_000).expect("parses");
        assert!(next > 1_770_393_600_000);

        // Explicit 6-field form passes through.
        assert!(next_cron_run_ms("0 0 9 * * *", 1_770_393_600_000).is_ok());

        assert!(next_cron_run_ms("not a cron", 0).is_err());
        assert!(next_cron_run_ms("* *", 0).is_err());
    }

    fn cron_payload(action_type: &str) -> serde_json::Value {
        json!({
            "actions": [{"type": action_type, "template": "tick {record_id}"}],
            "context": {
                "app_token": "appA",
                "table_id": "tblCases",
                "record_id": "recX",
                "event_id": "cron",
                "fields": {}
            }
        })
    }

    #[tokio::test]
    async fn due_cron_jobs_fire_and_return_to_waiting() {
        let engine = engine().await;
        let job_id = engine
            .cron_jobs
            .schedule(NewCronJob {
                cron_expr: "* * * * *".to_owned(),
                payload: cron_payload("log.write"),
                rule_id: "R001".to_owned(),
                next_run_at: 0,
                max_consecutive_failures: 3,
            })
            .await
            .expect("schedule");

        let scheduler = CronScheduler::new(engine.clone());
        assert_eq!(scheduler.run_once().await, 1);

        let job = engine.cron_jobs.get(&job_id).await.expect("get").expect("present");
        assert_eq!(job.status, CronStatus::Waiting);
        assert_eq!(job.execution_count, 1);
        assert!(
            job.next_run_at > casebook_core::chrono::Utc::now().timestamp_millis() - 1_000,
            "next firing is in the future"
        );

        // Not due again yet: a second sweep is a no-op.
        assert_eq!(scheduler.run_once().await, 0);
    }

    #[tokio::test]
    async fn failing_cron_jobs_pause_at_their_threshold() {
        let engine = engine().await;
        let job_id = engine
            .cron_jobs
            .schedule(NewCronJob {
                cron_expr: "* * * * *".to_owned(),
                payload: cron_payload("not.a.action"),
                rule_id: "R001".to_owned(),
                next_run_at: 0,
                max_consecutive_failures: 1,
            })
            .await
            .expect("schedule");

        let scheduler = CronScheduler::new(engine.clone());
        assert_eq!(scheduler.run_once().await, 0);

        let job = engine.cron_jobs.get(&job_id).await.expect("get").expect("present");
        assert_eq!(job.status, CronStatus::Paused, "single-failure threshold pauses");
        assert!(job.last_error.is_some());

        // Resume puts it back into rotation; the next sweep pauses it again.
        assert!(engine.cron_jobs.resume(&job_id, 0).await.expect("resume"));
        assert_eq!(scheduler.run_once().await, 0);
        let job = engine.cron_jobs.get(&job_id).await.expect("get").expect("present");
        assert_eq!(job.status, CronStatus::Paused);
    }

    #[tokio::test]
    async fn unparsable_expressions_fail_through_the_state_machine() {
        let engine = engine().await;
        let job_id = engine
            .cron_jobs
            .schedule(NewCronJob {
                cron_expr: "not a cron".to_owned(),
                payload: cron_payload("log.write"),
                rule_id: "R001".to_owned(),
                next_run_at: 0,
                max_consecutive_failures: 1,
            })
            .await
            .expect("schedule");

        let scheduler = CronScheduler::new(engine.clone());
        assert_eq!(scheduler.run_once().await, 0);
        let job = engine.cron_jobs.get(&job_id).await.expect("get").expect("present");
        assert_eq!(job.status, CronStatus::Paused);
        assert!(job.last_error.expect("error").contains("invalid cron expression"));
    }
}
