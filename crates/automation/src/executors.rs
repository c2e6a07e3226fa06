use std::sync::Arc;
use std::time::{Duration, Instant};

use casebook_core::chrono::Utc;
use casebook_core::rules::{Action, ActionTarget};
use casebook_core::template::{render, TemplateContext};
use casebook_core::{AppToken, FieldMap, FieldValue, RecordId, TableId, UpstreamError};
use casebook_db::{DelayTaskStore, RunResult};
use casebook_feishu::{BitableApi, CalendarEventInput, SearchFilter};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::http_guard::OutboundHostGuard;

/// Everything an executor needs to render templates and reach the source
/// record.
#[derive(Clone, Debug)]
pub struct ActionContext {
    pub app_token: AppToken,
    pub table_id: TableId,
    pub record_id: RecordId,
    pub event_id: String,
    pub rule_id: String,
    pub fields: FieldMap,
}

impl ActionContext {
    fn template_context(&self) -> TemplateContext<'_> {
        TemplateContext {
            record_id: &self.record_id.0,
            table_id: &self.table_id.0,
            app_token: &self.app_token.0,
            event_id: &self.event_id,
            rule_id: &self.rule_id,
            fields: Some(&self.fields),
        }
    }

    fn resolve_target(&self, target: &ActionTarget) -> (AppToken, TableId) {
        let app_token = target
            .app_token
            .clone()
            .map(AppToken)
            .unwrap_or_else(|| self.app_token.clone());
        (app_token, TableId(target.table_id.clone()))
    }
}

/// Outcome of one action, with the retry count the wrapper spent on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionRun {
    pub action_type: String,
    pub ok: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub retry_count: u32,
    pub duration_ms: u64,
}

/// Outcome of a whole pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub runs: Vec<ActionRun>,
    pub result: RunResult,
    pub error: Option<String>,
    pub total_retries: u32,
}

enum StepResult {
    Done,
    /// Cleanly skipped (empty calendar fields, gated status write).
    Skipped(&'static str),
}

enum StepError {
    Transient(String),
    Terminal(String),
}

impl From<UpstreamError> for StepError {
    fn from(error: UpstreamError) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Terminal(error.to_string())
        }
    }
}

/// Runs action pipelines with bounded retries, exponential backoff with
/// jitter, and clean classification of transient vs terminal failures.
pub struct ExecutorSet {
    api: Arc<dyn BitableApi>,
    http: reqwest::Client,
    host_guard: OutboundHostGuard,
    delays: Arc<DelayTaskStore>,
    max_retries: u32,
    retry_delay: Duration,
    http_timeout: Duration,
    status_write_enabled: bool,
}

impl ExecutorSet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn BitableApi>,
        delays: Arc<DelayTaskStore>,
        host_guard: OutboundHostGuard,
        max_retries: u32,
        retry_delay_secs: u64,
        http_timeout_secs: u64,
        status_write_enabled: bool,
    ) -> Self {
        let http_timeout = Duration::from_secs(http_timeout_secs.clamp(1, 10));
        Self {
            api,
            http: reqwest::Client::builder()
                .timeout(http_timeout)
                .build()
                .unwrap_or_default(),
            host_guard,
            delays,
            max_retries: max_retries.max(1),
            retry_delay: Duration::from_secs(retry_delay_secs),
            http_timeout,
            status_write_enabled,
        }
    }

    pub fn delay_store(&self) -> Arc<DelayTaskStore> {
        self.delays.clone()
    }

    /// Executes the pipeline sequentially, aborting the remainder on the
    /// first action that exhausts its retries.
    pub async fn run_pipeline(&self, actions: &[Action], context: &ActionContext) -> PipelineOutcome {
        let mut runs = Vec::with_capacity(actions.len());
        let mut total_retries = 0;
        let mut error = None;

        for action in actions {
            let run = self.run_with_retry(action, context).await;
            total_retries += run.retry_count;
            let failed = !run.ok;
            if failed {
                error = run.error.clone();
            }
            runs.push(run);
            if failed {
                break;
            }
        }

        let succeeded = runs.iter().filter(|run| run.ok).count();
        let result = if error.is_none() {
            RunResult::Success
        } else if succeeded > 0 {
            RunResult::Partial
        } else {
            RunResult::Failed
        };

        PipelineOutcome { runs, result, error, total_retries }
    }

    async fn run_with_retry(&self, action: &Action, context: &ActionContext) -> ActionRun {
        let action_type = action.type_name().to_owned();
        let started = Instant::now();
        let mut retry_count = 0;

        loop {
            match self.execute_once(action, context).await {
                Ok(StepResult::Done) => {
                    return ActionRun {
                        action_type,
                        ok: true,
                        skipped: false,
                        error: None,
                        retry_count,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Ok(StepResult::Skipped(reason)) => {
                    info!(
                        event_name = "automation.action.skipped",
                        rule_id = %context.rule_id,
                        action_type = %action_type,
                        reason,
                        "action skipped cleanly"
                    );
                    return ActionRun {
                        action_type,
                        ok: true,
                        skipped: true,
                        error: None,
                        retry_count,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(StepError::Transient(message)) if retry_count + 1 < self.max_retries => {
                    retry_count += 1;
                    let backoff = self.retry_delay.saturating_mul(1 << (retry_count - 1).min(6));
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    warn!(
                        event_name = "automation.action.retry",
                        rule_id = %context.rule_id,
                        action_type = %action_type,
                        attempt = retry_count,
                        backoff_ms = (backoff + jitter).as_millis() as u64,
                        error = %message,
                        "transient action failure, backing off"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                }
                Err(StepError::Transient(message)) | Err(StepError::Terminal(message)) => {
                    warn!(
                        event_name = "automation.action.failed",
                        rule_id = %context.rule_id,
                        action_type = %action_type,
                        retry_count,
                        error = %message,
                        "action failed permanently"
                    );
                    return ActionRun {
                        action_type,
                        ok: false,
                        skipped: false,
                        error: Some(message),
                        retry_count,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
            }
        }
    }

    async fn execute_once(
        &self,
        action: &Action,
        context: &ActionContext,
    ) -> Result<StepResult, StepError> {
        match action {
            Action::LogWrite { template } => {
                let message = render(template, &context.template_context());
                info!(
                    event_name = "automation.action.log_write",
                    rule_id = %context.rule_id,
                    record_id = %context.record_id.0,
                    message = %message,
                    "rule log"
                );
                Ok(StepResult::Done)
            }
            Action::BitableUpdate { target, fields } => {
                let (app_token, table_id) = context.resolve_target(target);
                if table_id == context.table_id && !self.status_write_enabled {
                    return Ok(StepResult::Skipped("status_write_disabled"));
                }
                let rendered = self.render_fields(fields, context);
                self.api
                    .update_record(&app_token, &table_id, &context.record_id, &rendered)
                    .await
                    .map_err(StepError::from)?;
                Ok(StepResult::Done)
            }
            Action::BitableUpsert { target, anchor_field, fields } => {
                let (app_token, table_id) = context.resolve_target(target);
                if table_id == context.table_id && !self.status_write_enabled {
                    return Ok(StepResult::Skipped("status_write_disabled"));
                }
                let rendered = self.render_fields(fields, context);
                let anchor_value = rendered
                    .get(anchor_field)
                    .map(FieldValue::as_text)
                    .unwrap_or_default();
                if anchor_value.is_empty() {
                    return Err(StepError::Terminal(format!(
                        "upsert anchor field `{anchor_field}` rendered empty"
                    )));
                }

                let page = self
                    .api
                    .search_records(
                        &app_token,
                        &table_id,
                        Some(&SearchFilter::Exact {
                            field: anchor_field.clone(),
                            value: anchor_value,
                        }),
                        None,
                        1,
                        None,
                    )
                    .await
                    .map_err(StepError::from)?;

                match page.items.first() {
                    Some(existing) => {
                        self.api
                            .update_record(&app_token, &table_id, &existing.record_id, &rendered)
                            .await
                            .map_err(StepError::from)?;
                    }
                    None => {
                        self.api
                            .create_record(&app_token, &table_id, &rendered)
                            .await
                            .map_err(StepError::from)?;
                    }
                }
                Ok(StepResult::Done)
            }
            Action::CalendarCreate { title, start_field, end_field } => {
                let start = date_field_ms(&context.fields, start_field);
                let end = date_field_ms(&context.fields, end_field);
                let (Some(start_ms), Some(end_ms)) = (start, end) else {
                    return Ok(StepResult::Skipped("calendar_fields_empty"));
                };
                let rendered_title = render(title, &context.template_context());
                self.api
                    .create_calendar_event(&CalendarEventInput {
                        title: rendered_title,
                        start_ms,
                        end_ms: end_ms.max(start_ms),
                    })
                    .await
                    .map_err(StepError::from)?;
                Ok(StepResult::Done)
            }
            Action::HttpRequest { method, url, headers, body } => {
                if !method.eq_ignore_ascii_case("post") {
                    return Err(StepError::Terminal(format!(
                        "http.request only supports POST, got `{method}`"
                    )));
                }
                self.host_guard
                    .validate(url)
                    .map_err(|violation| StepError::Terminal(violation.to_string()))?;

                let rendered_body = match body {
                    Some(body) => render_json(body, context),
                    None => json!({
                        "event_id": context.event_id,
                        "rule_id": context.rule_id,
                        "table_id": context.table_id.0,
                        "record_id": context.record_id.0,
                    }),
                };

                let mut request =
                    self.http.post(url).timeout(self.http_timeout).json(&rendered_body);
                for (name, value) in headers {
                    request = request.header(name, render(value, &context.template_context()));
                }

                let response = request.send().await.map_err(|error| {
                    if error.is_timeout() {
                        StepError::Transient(format!("http.request timeout: {error}"))
                    } else {
                        StepError::Transient(format!("http.request network failure: {error}"))
                    }
                })?;

                let status = response.status().as_u16();
                // The response body is intentionally not read into logs.
                if status == 429 || status >= 500 {
                    return Err(StepError::Transient(format!("http.request returned {status}")));
                }
                if status >= 400 {
                    return Err(StepError::Terminal(format!("http.request returned {status}")));
                }
                info!(
                    event_name = "automation.action.http_request",
                    rule_id = %context.rule_id,
                    status,
                    "webhook delivered"
                );
                Ok(StepResult::Done)
            }
            Action::Delay { seconds, pipeline } => {
                let scheduled_at = Utc::now().timestamp_millis() + (*seconds as i64) * 1000;
                let payload = json!({
                    "actions": pipeline,
                    "context": {
                        "app_token": context.app_token.0,
                        "table_id": context.table_id.0,
                        "record_id": context.record_id.0,
                        "event_id": context.event_id,
                        "rule_id": context.rule_id,
                        "fields": context.fields,
                    },
                });
                self.delays
                    .schedule(&context.rule_id, scheduled_at, payload)
                    .await
                    .map_err(|error| StepError::Terminal(error.to_string()))?;
                Ok(StepResult::Done)
            }
        }
    }

    fn render_fields(
        &self,
        fields: &std::collections::BTreeMap<String, String>,
        context: &ActionContext,
    ) -> FieldMap {
        fields
            .iter()
            .map(|(name, template)| {
                (name.clone(), FieldValue::Text(render(template, &context.template_context())))
            })
            .collect()
    }
}

fn render_json(value: &Value, context: &ActionContext) -> Value {
    match value {
        Value::String(template) => Value::String(render(template, &context.template_context())),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| render_json(item, context)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter().map(|(key, item)| (key.clone(), render_json(item, context))).collect(),
        ),
        other => other.clone(),
    }
}

fn date_field_ms(fields: &FieldMap, field: &str) -> Option<i64> {
    match fields.get(field)? {
        FieldValue::DateMs(ms) => Some(*ms),
        FieldValue::Number(value) => Some(*value as i64),
        FieldValue::Text(text) => text.parse().ok(),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use casebook_core::rules::{Action, ActionTarget};
    use casebook_core::{AppToken, FieldValue, RecordId, TableId, UpstreamError};
    use casebook_db::RunResult;

    use crate::http_guard::OutboundHostGuard;

    use super::test_support::{delay_store, fields_of, ScriptedBitable};
    use super::{ActionContext, ExecutorSet};

    async fn executor_set(api: Arc<ScriptedBitable>, status_write: bool) -> ExecutorSet {
        ExecutorSet::new(
            api,
            delay_store().await,
            OutboundHostGuard::new(&["hooks.example.com".to_owned()]),
            3,
            0,
            5,
            status_write,
        )
    }

    fn context() -> ActionContext {
        ActionContext {
            app_token: AppToken("appA".into()),
            table_id: TableId("tblCases".into()),
            record_id: RecordId("recX".into()),
            event_id: "evt-1".into(),
            rule_id: "R001".into(),
            fields: fields_of(&[
                ("案号", FieldValue::Text("(2026)沪01民终1号".into())),
                ("开庭日", FieldValue::DateMs(1_770_000_000_000)),
            ]),
        }
    }

    #[tokio::test]
    async fn log_write_always_succeeds() {
        let api = Arc::new(ScriptedBitable::default());
        let set = executor_set(api, false).await;
        let outcome = set
            .run_pipeline(
                &[Action::LogWrite { template: "案件 {案号} 命中 {rule_id}".into() }],
                &context(),
            )
            .await;
        assert_eq!(outcome.result, RunResult::Success);
        assert_eq!(outcome.runs[0].retry_count, 0);
    }

    #[tokio::test]
    async fn transient_update_failures_are_retried_to_success() {
        let api = Arc::new(ScriptedBitable::default());
        api.seed("tblAudit", "recA", fields_of(&[])).await;
        api.push_update_error(UpstreamError::Status { status: 503, message: "busy".into() }).await;

        let set = executor_set(api.clone(), true).await;
        // Target record recX lives in tblAudit for this test.
        api.seed("tblAudit", "recX", fields_of(&[])).await;
        let outcome = set
            .run_pipeline(
                &[Action::BitableUpdate {
                    target: ActionTarget { app_token: None, table_id: "tblAudit".into() },
                    fields: [("摘要".to_owned(), "{案号}".to_owned())].into_iter().collect(),
                }],
                &context(),
            )
            .await;

        assert_eq!(outcome.result, RunResult::Success);
        assert_eq!(outcome.runs[0].retry_count, 1, "one transient failure, then success");
    }

    #[tokio::test]
    async fn terminal_failures_do_not_retry_and_abort_the_pipeline() {
        let api = Arc::new(ScriptedBitable::default());
        api.seed("tblAudit", "recX", fields_of(&[])).await;
        api.push_update_error(UpstreamError::Status { status: 400, message: "bad".into() }).await;

        let set = executor_set(api.clone(), true).await;
        let outcome = set
            .run_pipeline(
                &[
                    Action::LogWrite { template: "first".into() },
                    Action::BitableUpdate {
                        target: ActionTarget { app_token: None, table_id: "tblAudit".into() },
                        fields: [("摘要".to_owned(), "x".to_owned())].into_iter().collect(),
                    },
                    Action::LogWrite { template: "never runs".into() },
                ],
                &context(),
            )
            .await;

        assert_eq!(outcome.result, RunResult::Partial);
        assert_eq!(outcome.runs.len(), 2, "pipeline aborts after the failed action");
        assert_eq!(outcome.runs[1].retry_count, 0, "4xx is terminal");
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn source_table_writes_are_gated_by_status_write_flag() {
        let api = Arc::new(ScriptedBitable::default());
        api.seed("tblCases", "recX", fields_of(&[])).await;

        let set = executor_set(api.clone(), false).await;
        let outcome = set
            .run_pipeline(
                &[Action::BitableUpdate {
                    target: ActionTarget { app_token: None, table_id: "tblCases".into() },
                    fields: [("状态".to_owned(), "done".to_owned())].into_iter().collect(),
                }],
                &context(),
            )
            .await;

        assert_eq!(outcome.result, RunResult::Success);
        assert!(outcome.runs[0].skipped);
        assert_eq!(*api.update_calls.lock().await, 0, "no write reaches the source table");
    }

    #[tokio::test]
    async fn upsert_updates_existing_anchor_or_creates() {
        let api = Arc::new(ScriptedBitable::default());
        api.seed(
            "tblMirror",
            "recM",
            fields_of(&[("源记录".into(), FieldValue::Text("recX".into()))]),
        )
        .await;

        let set = executor_set(api.clone(), true).await;
        let action = Action::BitableUpsert {
            target: ActionTarget { app_token: None, table_id: "tblMirror".into() },
            anchor_field: "源记录".into(),
            fields: [
                ("源记录".to_owned(), "{record_id}".to_owned()),
                ("案号".to_owned(), "{案号}".to_owned()),
            ]
            .into_iter()
            .collect(),
        };

        let outcome = set.run_pipeline(std::slice::from_ref(&action), &context()).await;
        assert_eq!(outcome.result, RunResult::Success);
        assert_eq!(api.tables.lock().await["tblMirror"].len(), 1, "anchor matched: update");

        let mut other = context();
        other.record_id = RecordId("recY".into());
        let outcome = set.run_pipeline(std::slice::from_ref(&action), &other).await;
        assert_eq!(outcome.result, RunResult::Success);
        assert_eq!(api.tables.lock().await["tblMirror"].len(), 2, "no anchor: create");
    }

    #[tokio::test]
    async fn calendar_create_skips_cleanly_when_fields_are_empty() {
        let api = Arc::new(ScriptedBitable::default());
        let set = executor_set(api.clone(), false).await;

        let mut context = context();
        context.fields.remove("开庭日");
        let outcome = set
            .run_pipeline(
                &[Action::CalendarCreate {
                    title: "开庭 {案号}".into(),
                    start_field: "开庭日".into(),
                    end_field: "开庭日".into(),
                }],
                &context,
            )
            .await;

        assert_eq!(outcome.result, RunResult::Success);
        assert!(outcome.runs[0].skipped);
        assert!(api.calendar_events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn calendar_create_uses_date_fields() {
        let api = Arc::new(ScriptedBitable::default());
        let set = executor_set(api.clone(), false).await;
        let outcome = set
            .run_pipeline(
                &[Action::CalendarCreate {
                    title: "开庭 {案号}".into(),
                    start_field: "开庭日".into(),
                    end_field: "开庭日".into(),
                }],
                &context(),
            )
            .await;

        assert_eq!(outcome.result, RunResult::Success);
        let events = api.calendar_events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].start_ms, 1_770_000_000_000);
        assert!(events[0].title.contains("(2026)沪01民终1号"));
    }

    #[tokio::test]
    async fn http_request_to_blocked_host_fails_without_retry() {
        let api = Arc::new(ScriptedBitable::default());
        let set = executor_set(api, false).await;
        let outcome = set
            .run_pipeline(
                &[Action::HttpRequest {
                    method: "POST".into(),
                    url: "http://127.0.0.1/steal".into(),
                    headers: Default::default(),
                    body: None,
                }],
                &context(),
            )
            .await;

        assert_eq!(outcome.result, RunResult::Failed);
        assert_eq!(outcome.runs[0].retry_count, 0, "guard violations are terminal");
        assert!(outcome.error.expect("error").contains("blocked"));
    }

    #[tokio::test]
    async fn delay_action_enqueues_a_task_with_the_sub_pipeline() {
        let api = Arc::new(ScriptedBitable::default());
        let delays = delay_store().await;
        let set = ExecutorSet::new(
            api,
            delays.clone(),
            OutboundHostGuard::new(&[]),
            3,
            0,
            5,
            false,
        );

        let outcome = set
            .run_pipeline(
                &[Action::Delay {
                    seconds: 60,
                    pipeline: vec![Action::LogWrite { template: "后续 {record_id}".into() }],
                }],
                &context(),
            )
            .await;

        assert_eq!(outcome.result, RunResult::Success);
        let tasks = delays.list(None, 10).await.expect("list");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].rule_id, "R001");
        assert_eq!(tasks[0].payload["context"]["record_id"], "recX");
        assert_eq!(tasks[0].payload["actions"][0]["type"], "log.write");
    }
}
