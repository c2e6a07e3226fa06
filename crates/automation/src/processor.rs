use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use casebook_core::business::business_key;
use casebook_core::chrono::Utc;
use casebook_core::config::{AutomationConfig, BitableConfig};
use casebook_core::matching::{matched_trigger_change, MatchEngine};
use casebook_core::rules::{Action, Rule, RuleRegistry};
use casebook_core::{
    AppToken, AutomationError, ChangeSet, EventKind, FieldMap, RecordId, TableId,
};
use casebook_db::{
    ActionDetail, ChangedPair, CheckpointStore, CronStore, DeadLetterStore, IdempotencyStore,
    RunLogRow, RunLogStore, RunResult, SnapshotStore,
};
use casebook_feishu::BitableApi;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::executors::{ActionContext, ExecutorSet, PipelineOutcome};

/// How a record reached the processor; gates first-observation behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOrigin {
    Event,
    Scan,
    Init,
}

/// Per-record processing summary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessKind {
    Initialized,
    InitializedTriggered,
    NoChange,
    Changed,
}

#[derive(Clone, Debug)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub matched: bool,
    pub skipped_business_duplicate: bool,
    pub result: Option<RunResult>,
}

#[derive(Clone, Debug)]
pub struct ProcessReport {
    pub kind: ProcessKind,
    pub event_id: String,
    pub changed_fields: Vec<String>,
    pub evaluations: Vec<RuleEvaluation>,
}

/// Counters reported by scan and sync sweeps.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanCounters {
    pub scanned: u32,
    pub initialized: u32,
    pub initialized_triggered: u32,
    pub no_change: u32,
    pub changed: u32,
    pub failed: u32,
    pub deleted_synced: u32,
    pub delete_failed: u32,
}

#[derive(Clone, Debug)]
pub struct ScanReport {
    pub table_id: TableId,
    pub from_cursor: i64,
    pub to_cursor: i64,
    pub pages: u32,
    pub truncated: bool,
    pub counters: ScanCounters,
}

/// Bounds concurrent record processing; per-record keyed mutexes serialize
/// work on the same record while different records proceed in parallel.
struct RecordGate {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pool: Semaphore,
}

const MAX_CONCURRENT_RECORDS: usize = 8;

impl RecordGate {
    fn new() -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
            pool: Semaphore::new(MAX_CONCURRENT_RECORDS),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

/// The automation engine: fetch → diff → match → execute → persist for one
/// record at a time, with idempotency and run-log accounting.
pub struct AutomationEngine {
    pub config: AutomationConfig,
    pub defaults: BitableConfig,
    pub api: Arc<dyn BitableApi>,
    pub rules: Arc<RuleRegistry>,
    pub snapshots: SnapshotStore,
    pub idempotency: IdempotencyStore,
    pub checkpoints: CheckpointStore,
    pub run_logs: RunLogStore,
    pub dead_letters: DeadLetterStore,
    pub cron_jobs: Arc<CronStore>,
    pub executors: ExecutorSet,
    match_engine: MatchEngine,
    gate: RecordGate,
}

impl AutomationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AutomationConfig,
        defaults: BitableConfig,
        api: Arc<dyn BitableApi>,
        rules: Arc<RuleRegistry>,
        snapshots: SnapshotStore,
        idempotency: IdempotencyStore,
        checkpoints: CheckpointStore,
        run_logs: RunLogStore,
        dead_letters: DeadLetterStore,
        cron_jobs: Arc<CronStore>,
        executors: ExecutorSet,
    ) -> Self {
        Self {
            config,
            defaults,
            api,
            rules,
            snapshots,
            idempotency,
            checkpoints,
            run_logs,
            dead_letters,
            cron_jobs,
            executors,
            match_engine: MatchEngine,
            gate: RecordGate::new(),
        }
    }

    pub fn executors_delay_store(&self) -> Arc<casebook_db::DelayTaskStore> {
        self.executors.delay_store()
    }

    pub fn ensure_enabled(&self) -> Result<(), AutomationError> {
        if !self.config.enabled {
            return Err(AutomationError::Disabled);
        }
        Ok(())
    }

    /// Processes one record change end to end. Per-record processing is
    /// strictly serialized; different records run in parallel up to the
    /// worker-pool bound.
    pub async fn process_record(
        &self,
        event_id: &str,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
        origin: ProcessOrigin,
        prefetched: Option<FieldMap>,
    ) -> Result<ProcessReport, AutomationError> {
        let _slot = self.gate.pool.acquire().await.map_err(|_| {
            AutomationError::Store("worker pool closed during shutdown".to_owned())
        })?;
        let key = format!("{}:{}:{}", app_token.0, table_id.0, record_id.0);
        let record_lock = self.gate.lock_for(&key);
        let _guard = record_lock.lock().await;

        let watch_plan = self.rules.watch_plan(app_token, table_id);
        let field_names = watch_plan.field_names();

        let current = match prefetched {
            Some(fields) => fields,
            None => self
                .api
                .get_record(app_token, table_id, record_id, field_names.as_deref())
                .await?
                .ok_or_else(|| {
                    AutomationError::Validation(format!(
                        "record `{}` not found upstream",
                        record_id.0
                    ))
                })?,
        };
        let current = filter_by_watch(current, field_names.as_deref());

        let snapshot = self
            .snapshots
            .load(app_token, table_id, record_id)
            .await
            .map_err(store_error)?;

        let (old, event_kind) = match snapshot {
            None => {
                let trigger_new = match origin {
                    ProcessOrigin::Init => false,
                    ProcessOrigin::Event => self.config.trigger_on_new_record_event,
                    ProcessOrigin::Scan => self.allow_new_record_scan_trigger(app_token, table_id).await,
                };
                if !trigger_new {
                    self.snapshots
                        .save(app_token, table_id, record_id, &current)
                        .await
                        .map_err(store_error)?;
                    return Ok(ProcessReport {
                        kind: ProcessKind::Initialized,
                        event_id: event_id.to_owned(),
                        changed_fields: Vec::new(),
                        evaluations: Vec::new(),
                    });
                }
                (FieldMap::new(), EventKind::Created)
            }
            Some(old) => (old, EventKind::Updated),
        };

        let changes = ChangeSet::diff(&old, &current);
        if changes.is_empty() {
            self.snapshots
                .save(app_token, table_id, record_id, &current)
                .await
                .map_err(store_error)?;
            let kind = if event_kind == EventKind::Created {
                ProcessKind::Initialized
            } else {
                ProcessKind::NoChange
            };
            return Ok(ProcessReport {
                kind,
                event_id: event_id.to_owned(),
                changed_fields: Vec::new(),
                evaluations: Vec::new(),
            });
        }

        let evaluations = self
            .evaluate_rules(event_id, app_token, table_id, record_id, event_kind, &old, &current, &changes)
            .await;

        self.snapshots
            .save(app_token, table_id, record_id, &current)
            .await
            .map_err(store_error)?;

        Ok(ProcessReport {
            kind: if event_kind == EventKind::Created {
                ProcessKind::InitializedTriggered
            } else {
                ProcessKind::Changed
            },
            event_id: event_id.to_owned(),
            changed_fields: changes.changed_fields().iter().map(|field| (*field).to_owned()).collect(),
            evaluations,
        })
    }

    async fn allow_new_record_scan_trigger(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
    ) -> bool {
        if !self.config.trigger_on_new_record_scan {
            return false;
        }
        if !self.config.trigger_on_new_record_scan_requires_checkpoint {
            return true;
        }
        self.checkpoints.get(app_token, table_id).await.map(|cursor| cursor > 0).unwrap_or(false)
    }

    /// Evaluates all enabled rules for the table and runs matched pipelines.
    /// One run-log row is written per evaluated rule.
    #[allow(clippy::too_many_arguments)]
    async fn evaluate_rules(
        &self,
        event_id: &str,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
        event_kind: EventKind,
        old: &FieldMap,
        current: &FieldMap,
        changes: &ChangeSet,
    ) -> Vec<RuleEvaluation> {
        let rules = self.rules.enabled_for_table(app_token, table_id);
        let candidates: Vec<&Rule> = rules
            .iter()
            .filter(|rule| rule.trigger.on.iter().any(|on| on.matches(event_kind)))
            .collect();

        let rules_evaluated: Vec<String> =
            candidates.iter().map(|rule| rule.id.clone()).collect();
        let mut matches = Vec::with_capacity(candidates.len());
        for rule in &candidates {
            let outcome = self.match_engine.evaluate(rule, event_kind, old, current, changes);
            matches.push(outcome.matched);
        }
        let rules_matched: Vec<String> = candidates
            .iter()
            .zip(&matches)
            .filter(|(_, matched)| **matched)
            .map(|(rule, _)| rule.id.clone())
            .collect();

        let mut evaluations = Vec::with_capacity(candidates.len());
        for (rule, matched) in candidates.iter().zip(matches) {
            let evaluation = self
                .run_rule(
                    rule,
                    matched,
                    event_id,
                    app_token,
                    table_id,
                    record_id,
                    current,
                    changes,
                    &rules_evaluated,
                    &rules_matched,
                )
                .await;
            evaluations.push(evaluation);
        }
        evaluations
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_rule(
        &self,
        rule: &Rule,
        matched: bool,
        event_id: &str,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
        current: &FieldMap,
        changes: &ChangeSet,
        rules_evaluated: &[String],
        rules_matched: &[String],
    ) -> RuleEvaluation {
        let started = Instant::now();
        let changed_pair = matched_trigger_change(&rule.trigger, changes).map(|(_, old, new)| {
            ChangedPair { old: old.clone(), new: new.clone() }
        });
        let trigger_field = rule.trigger.field.clone();

        if !matched {
            self.append_run_log(RunLogRow {
                timestamp: Utc::now().to_rfc3339(),
                event_id: event_id.to_owned(),
                rule_id: rule.id.clone(),
                app_token: app_token.0.clone(),
                table_id: table_id.0.clone(),
                record_id: record_id.0.clone(),
                rules_evaluated: rules_evaluated.to_vec(),
                rules_matched: rules_matched.to_vec(),
                trigger_field,
                changed: changed_pair,
                actions_executed: Vec::new(),
                actions_detail: Vec::new(),
                result: RunResult::NoMatch,
                error: None,
                retry_count: 0,
                sent_to_dead_letter: false,
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;
            return RuleEvaluation {
                rule_id: rule.id.clone(),
                matched: false,
                skipped_business_duplicate: false,
                result: Some(RunResult::NoMatch),
            };
        }

        let key = business_key(&rule.id, &table_id.0, &record_id.0, changes);
        match self.idempotency.is_business_duplicate(&key).await {
            Ok(true) => {
                info!(
                    event_name = "automation.rule.business_duplicate",
                    rule_id = %rule.id,
                    record_id = %record_id.0,
                    "change already handled, skipping pipeline"
                );
                return RuleEvaluation {
                    rule_id: rule.id.clone(),
                    matched: true,
                    skipped_business_duplicate: true,
                    result: None,
                };
            }
            Ok(false) => {}
            Err(error) => {
                warn!(
                    event_name = "automation.rule.idempotency_check_failed",
                    rule_id = %rule.id,
                    error = %error,
                    "idempotency store unavailable, refusing to run the pipeline"
                );
                return RuleEvaluation {
                    rule_id: rule.id.clone(),
                    matched: true,
                    skipped_business_duplicate: false,
                    result: Some(RunResult::Failed),
                };
            }
        }

        let context = ActionContext {
            app_token: app_token.clone(),
            table_id: table_id.clone(),
            record_id: record_id.clone(),
            event_id: event_id.to_owned(),
            rule_id: rule.id.clone(),
            fields: current.clone(),
        };
        let outcome = self.executors.run_pipeline(&rule.pipeline, &context).await;

        let sent_to_dead_letter = outcome.result != RunResult::Success;
        if sent_to_dead_letter {
            self.record_dead_letter(rule, event_id, app_token, table_id, record_id, &outcome).await;
        } else {
            if let Err(error) = self.idempotency.mark_business(&key).await {
                warn!(
                    event_name = "automation.rule.idempotency_mark_failed",
                    rule_id = %rule.id,
                    error = %error,
                    "pipeline succeeded but the business key could not be recorded"
                );
            }
        }

        self.append_run_log(RunLogRow {
            timestamp: Utc::now().to_rfc3339(),
            event_id: event_id.to_owned(),
            rule_id: rule.id.clone(),
            app_token: app_token.0.clone(),
            table_id: table_id.0.clone(),
            record_id: record_id.0.clone(),
            rules_evaluated: rules_evaluated.to_vec(),
            rules_matched: rules_matched.to_vec(),
            trigger_field,
            changed: changed_pair,
            actions_executed: outcome
                .runs
                .iter()
                .filter(|run| run.ok && !run.skipped)
                .map(|run| run.action_type.clone())
                .collect(),
            actions_detail: outcome
                .runs
                .iter()
                .map(|run| ActionDetail {
                    action_type: run.action_type.clone(),
                    retry_count: run.retry_count,
                    duration_ms: run.duration_ms,
                })
                .collect(),
            result: outcome.result,
            error: outcome.error.clone(),
            retry_count: outcome.total_retries,
            sent_to_dead_letter,
            duration_ms: started.elapsed().as_millis() as u64,
        })
        .await;

        RuleEvaluation {
            rule_id: rule.id.clone(),
            matched: true,
            skipped_business_duplicate: false,
            result: Some(outcome.result),
        }
    }

    async fn record_dead_letter(
        &self,
        rule: &Rule,
        event_id: &str,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
        outcome: &PipelineOutcome,
    ) {
        let failed = outcome.runs.iter().find(|run| !run.ok);
        let (action_type, retry_count) = failed
            .map(|run| (run.action_type.as_str(), run.retry_count))
            .unwrap_or(("pipeline", 0));
        let error = outcome.error.as_deref().unwrap_or("pipeline failed");

        if let Err(store_error) = self
            .dead_letters
            .append(
                &rule.id,
                action_type,
                event_id,
                &app_token.0,
                &table_id.0,
                &record_id.0,
                error,
                retry_count,
            )
            .await
        {
            warn!(
                event_name = "automation.dead_letter.write_failed",
                rule_id = %rule.id,
                error = %store_error,
                "dead letter row could not be persisted"
            );
        }
    }

    async fn append_run_log(&self, row: RunLogRow) {
        if let Err(error) = self.run_logs.append(row).await {
            warn!(
                event_name = "automation.run_log.write_failed",
                error = %error,
                "run log row could not be persisted"
            );
        }
    }

    /// Fires one rule from an authenticated external webhook. The payload may
    /// carry `old_fields`/`fields` to synthesize a change set; `force` skips
    /// trigger matching entirely.
    pub async fn trigger_rule_webhook(
        &self,
        rule_id: &str,
        payload: &Value,
        force: bool,
    ) -> Result<ProcessReport, AutomationError> {
        self.ensure_enabled()?;

        let rule = self.rules.find_enabled(rule_id).ok_or_else(|| {
            AutomationError::Validation(format!("rule not found or disabled: {rule_id}"))
        })?;

        let app_token = AppToken(
            payload
                .get("app_token")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| rule.table.app_token.clone())
                .unwrap_or_else(|| self.defaults.default_app_token.clone()),
        );
        let table_id = TableId(rule.table.table_id.clone());
        let now_ms = Utc::now().timestamp_millis();
        let event_id = payload
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("manual_webhook:{rule_id}:{now_ms}"));
        let record_id = RecordId(
            payload
                .get("record_id")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("manual:{now_ms}")),
        );

        let old: FieldMap =
            serde_json::from_value(payload.get("old_fields").cloned().unwrap_or(json!({})))
                .unwrap_or_default();
        let current: FieldMap = payload
            .get("fields")
            .cloned()
            .and_then(|fields| serde_json::from_value(fields).ok())
            .unwrap_or_default();
        let changes = ChangeSet::diff(&old, &current);

        let event_kind = if old.is_empty() { EventKind::Created } else { EventKind::Updated };
        let matched = force
            || self
                .match_engine
                .evaluate(&rule, event_kind, &old, &current, &changes)
                .matched;

        let rules_evaluated = vec![rule.id.clone()];
        let rules_matched: Vec<String> =
            if matched { vec![rule.id.clone()] } else { Vec::new() };
        let evaluation = self
            .run_rule(
                &rule,
                matched,
                &event_id,
                &app_token,
                &table_id,
                &record_id,
                &current,
                &changes,
                &rules_evaluated,
                &rules_matched,
            )
            .await;

        Ok(ProcessReport {
            kind: ProcessKind::Changed,
            event_id,
            changed_fields: changes
                .changed_fields()
                .iter()
                .map(|field| (*field).to_owned())
                .collect(),
            evaluations: vec![evaluation],
        })
    }

    /// Replays a persisted delayed sub-pipeline.
    pub async fn execute_delayed(&self, rule_id: &str, payload: &Value) -> Result<(), String> {
        let actions: Vec<Action> = serde_json::from_value(
            payload.get("actions").cloned().unwrap_or(Value::Array(Vec::new())),
        )
        .map_err(|error| format!("delay payload actions invalid: {error}"))?;

        let context = payload.get("context").cloned().unwrap_or_default();
        let fields: FieldMap =
            serde_json::from_value(context.get("fields").cloned().unwrap_or(json!({})))
                .unwrap_or_default();

        let action_context = ActionContext {
            app_token: AppToken(string_at(&context, "app_token")),
            table_id: TableId(string_at(&context, "table_id")),
            record_id: RecordId(string_at(&context, "record_id")),
            event_id: string_at(&context, "event_id"),
            rule_id: rule_id.to_owned(),
            fields,
        };

        let outcome = self.executors.run_pipeline(&actions, &action_context).await;
        if outcome.result == RunResult::Success {
            Ok(())
        } else {
            Err(outcome.error.unwrap_or_else(|| "delayed pipeline failed".to_owned()))
        }
    }

    // -----------------------------------------------------------------------
    // scan / sync / init
    // -----------------------------------------------------------------------

    /// Establishes the snapshot baseline for a table. No rules fire.
    pub async fn init_snapshot(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
    ) -> Result<(usize, i64), AutomationError> {
        self.ensure_enabled()?;

        let watch_plan = self.rules.watch_plan(app_token, table_id);
        let field_names = watch_plan.field_names();
        let mut records = Vec::new();
        let mut max_cursor = 0i64;
        let mut page_token: Option<String> = None;

        for _ in 0..self.config.max_scan_pages.max(1) {
            let page = self
                .api
                .search_records(
                    app_token,
                    table_id,
                    None,
                    page_token.as_deref(),
                    self.config.scan_page_size,
                    field_names.as_deref(),
                )
                .await?;

            for record in &page.items {
                max_cursor = max_cursor.max(record.last_modified_ms);
                records.push((
                    record.record_id.clone(),
                    filter_by_watch(record.fields.clone(), field_names.as_deref()),
                ));
            }

            if !page.has_more {
                page_token = None;
                break;
            }
            page_token = page.page_token;
            if page_token.is_none() {
                break;
            }
        }

        let count = self
            .snapshots
            .init_full_snapshot(app_token, table_id, &records)
            .await
            .map_err(store_error)?;
        if max_cursor > 0 {
            self.checkpoints.set(app_token, table_id, max_cursor).await.map_err(store_error)?;
        }
        info!(
            event_name = "automation.init.baseline",
            table_id = %table_id.0,
            records = count,
            cursor = max_cursor,
            "snapshot baseline established"
        );
        Ok((count, max_cursor))
    }

    /// Compensation scan: processes records modified after the checkpoint.
    /// `force_full` rescans from zero; with `reconcile_deletions` it also
    /// removes upsert mirrors whose source disappeared.
    pub async fn scan_table(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        force_full: bool,
        reconcile_deletions: bool,
    ) -> Result<ScanReport, AutomationError> {
        self.ensure_enabled()?;

        let watch_plan = self.rules.watch_plan(app_token, table_id);
        let field_names = watch_plan.field_names();
        let cursor = if force_full {
            0
        } else {
            self.checkpoints.get(app_token, table_id).await.map_err(store_error)?
        };

        let mut counters = ScanCounters::default();
        let mut max_seen = cursor;
        let mut page_token: Option<String> = None;
        let mut pages = 0;
        let mut truncated = false;
        let mut source_record_ids: BTreeSet<String> = BTreeSet::new();
        let mut new_record_triggers = 0u32;
        let max_new_triggers = self.config.new_record_scan_max_trigger_per_run;

        loop {
            if pages >= self.config.max_scan_pages.max(1) {
                truncated = page_token.is_some();
                break;
            }
            let page = self
                .api
                .search_records(
                    app_token,
                    table_id,
                    None,
                    page_token.as_deref(),
                    self.config.scan_page_size,
                    field_names.as_deref(),
                )
                .await?;
            pages += 1;

            for record in &page.items {
                counters.scanned += 1;
                if force_full {
                    source_record_ids.insert(record.record_id.0.clone());
                }
                if record.last_modified_ms > 0 && record.last_modified_ms <= cursor {
                    continue;
                }
                max_seen = max_seen.max(record.last_modified_ms);

                let synthetic_event_id = format!(
                    "scan:{}:{}:{}",
                    table_id.0, record.record_id.0, record.last_modified_ms
                );
                let capped = max_new_triggers > 0 && new_record_triggers >= max_new_triggers;
                let origin =
                    if capped { ProcessOrigin::Init } else { ProcessOrigin::Scan };

                match self
                    .process_record(
                        &synthetic_event_id,
                        app_token,
                        table_id,
                        &record.record_id,
                        origin,
                        Some(record.fields.clone()),
                    )
                    .await
                {
                    Ok(report) => match report.kind {
                        ProcessKind::Initialized => counters.initialized += 1,
                        ProcessKind::InitializedTriggered => {
                            counters.initialized_triggered += 1;
                            new_record_triggers += 1;
                        }
                        ProcessKind::NoChange => counters.no_change += 1,
                        ProcessKind::Changed => counters.changed += 1,
                    },
                    Err(error) => {
                        counters.failed += 1;
                        warn!(
                            event_name = "automation.scan.record_failed",
                            table_id = %table_id.0,
                            record_id = %record.record_id.0,
                            error = %error,
                            "scan record processing failed"
                        );
                    }
                }
            }

            if !page.has_more {
                break;
            }
            page_token = page.page_token;
            if page_token.is_none() {
                break;
            }
        }

        if max_seen > cursor {
            self.checkpoints.set(app_token, table_id, max_seen).await.map_err(store_error)?;
        }

        // A complete full scan also reconciles the local snapshot mirror:
        // records deleted upstream lose their snapshot entry.
        if force_full && !truncated {
            if let Ok(known) = self.snapshots.record_ids(app_token, table_id).await {
                for record_id in known {
                    if !source_record_ids.contains(&record_id.0) {
                        if let Err(error) =
                            self.snapshots.remove(app_token, table_id, &record_id).await
                        {
                            warn!(
                                event_name = "automation.sync.snapshot_prune_failed",
                                record_id = %record_id.0,
                                error = %error,
                                "stale snapshot could not be removed"
                            );
                        }
                    }
                }
            }
        }

        if force_full && reconcile_deletions {
            let (deleted, failed) = self
                .reconcile_deletions(app_token, table_id, &source_record_ids, truncated)
                .await;
            counters.deleted_synced = deleted;
            counters.delete_failed = failed;
        }

        Ok(ScanReport {
            table_id: table_id.clone(),
            from_cursor: cursor,
            to_cursor: max_seen,
            pages,
            truncated,
            counters,
        })
    }

    /// Full sweep: create + update compensation plus deletion reconciliation.
    pub async fn sync_table(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
    ) -> Result<ScanReport, AutomationError> {
        self.scan_table(app_token, table_id, true, true).await
    }

    /// Tables that have enabled rules; the poller's work list.
    pub fn poll_targets(&self) -> Vec<(AppToken, TableId)> {
        self.rules
            .rule_tables()
            .into_iter()
            .map(|(app_token, table_id)| {
                (
                    AppToken(app_token.unwrap_or_else(|| self.defaults.default_app_token.clone())),
                    TableId(table_id),
                )
            })
            .filter(|(app_token, table_id)| !app_token.0.is_empty() && !table_id.0.is_empty())
            .collect()
    }

    /// Removes upsert mirror rows whose source record no longer exists,
    /// bounded by `sync_deletions_max_per_run`. Skipped entirely when the
    /// source scan was truncated: an incomplete live set would delete rows
    /// whose sources were simply not seen.
    async fn reconcile_deletions(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        source_record_ids: &BTreeSet<String>,
        scan_truncated: bool,
    ) -> (u32, u32) {
        if !self.config.sync_deletions_enabled || scan_truncated {
            return (0, 0);
        }

        let targets = upsert_mirror_targets(&self.rules.enabled_for_table(app_token, table_id));
        if targets.is_empty() {
            return (0, 0);
        }

        let max_deletes = self.config.sync_deletions_max_per_run;
        let mut deleted = 0u32;
        let mut failed = 0u32;

        'targets: for (target_app, target_table, anchor_field) in targets {
            let target_app = target_app.map(AppToken).unwrap_or_else(|| app_token.clone());
            let target_table = TableId(target_table);
            let mut page_token: Option<String> = None;

            for _ in 0..self.config.max_scan_pages.max(1) {
                let page = match self
                    .api
                    .search_records(
                        &target_app,
                        &target_table,
                        None,
                        page_token.as_deref(),
                        self.config.scan_page_size,
                        Some(&[anchor_field.clone()]),
                    )
                    .await
                {
                    Ok(page) => page,
                    Err(error) => {
                        warn!(
                            event_name = "automation.sync.mirror_scan_failed",
                            table_id = %target_table.0,
                            error = %error,
                            "mirror table scan failed"
                        );
                        failed += 1;
                        continue 'targets;
                    }
                };

                for record in &page.items {
                    if deleted >= max_deletes {
                        info!(
                            event_name = "automation.sync.delete_limit_hit",
                            limit = max_deletes,
                            "deletion reconciliation reached the per-run bound"
                        );
                        break 'targets;
                    }
                    let anchor_value = record
                        .fields
                        .get(&anchor_field)
                        .map(casebook_core::FieldValue::as_text)
                        .unwrap_or_default();
                    if anchor_value.is_empty() || source_record_ids.contains(&anchor_value) {
                        continue;
                    }

                    match self
                        .api
                        .delete_record(&target_app, &target_table, &record.record_id)
                        .await
                    {
                        Ok(_) => deleted += 1,
                        Err(error) => {
                            failed += 1;
                            warn!(
                                event_name = "automation.sync.mirror_delete_failed",
                                record_id = %record.record_id.0,
                                error = %error,
                                "mirror row deletion failed"
                            );
                        }
                    }
                }

                if !page.has_more {
                    break;
                }
                page_token = page.page_token;
                if page_token.is_none() {
                    break;
                }
            }
        }

        (deleted, failed)
    }
}

/// Upsert targets whose anchor field mirrors the source record id:
/// `(app_token, table_id, anchor_field)` per distinct target.
fn upsert_mirror_targets(rules: &[Rule]) -> Vec<(Option<String>, String, String)> {
    let mut seen = BTreeSet::new();
    let mut targets = Vec::new();
    for rule in rules {
        for action in &rule.pipeline {
            if let Action::BitableUpsert { target, anchor_field, fields } = action {
                let mirrors_record_id = fields
                    .get(anchor_field)
                    .map(|template| template.trim() == "{record_id}")
                    .unwrap_or(false);
                if !mirrors_record_id {
                    continue;
                }
                let key =
                    (target.app_token.clone(), target.table_id.clone(), anchor_field.clone());
                if seen.insert(key.clone()) {
                    targets.push(key);
                }
            }
        }
    }
    targets
}

fn filter_by_watch(fields: FieldMap, watch: Option<&[String]>) -> FieldMap {
    match watch {
        None => fields,
        Some(watched) if watched.is_empty() => fields,
        Some(watched) => fields
            .into_iter()
            .filter(|(name, _)| watched.iter().any(|field| field == name))
            .collect(),
    }
}

fn store_error(error: casebook_db::StoreError) -> AutomationError {
    AutomationError::Store(error.to_string())
}

fn string_at(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).unwrap_or_default().to_owned()
}
