use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use casebook_core::chrono::Utc;
use casebook_core::{AppToken, AutomationError, TableId};
use casebook_db::{CronStatus, DelayTaskStatus, NewCronJob};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::{verify_shared_auth, AuthHeaders, HEADER_API_KEY, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use crate::dispatcher::{Dispatcher, EventOutcome};
use crate::processor::ScanReport;

#[derive(Clone)]
pub struct AutomationSurface {
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/feishu/events", post(events))
        .route("/automation/init", post(init_snapshot))
        .route("/automation/scan", post(scan))
        .route("/automation/sync", post(sync))
        .route("/automation/schema/refresh", post(schema_refresh))
        .route("/automation/webhook/:rule_id", post(rule_webhook))
        .route("/automation/delay/tasks", get(list_delay_tasks))
        .route("/automation/delay/:task_id/cancel", post(cancel_delay_task))
        .route("/automation/cron", post(create_cron_job))
        .route("/automation/cron/jobs", get(list_cron_jobs))
        .route("/automation/cron/:job_id/cancel", post(cancel_cron_job))
        .route("/automation/cron/:job_id/resume", post(resume_cron_job))
        .route("/automation/auth/health", get(auth_health))
        .with_state(AutomationSurface { dispatcher })
}

pub async fn serve(
    bind_address: &str,
    port: u16,
    dispatcher: Arc<Dispatcher>,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(
        event_name = "automation.server.started",
        bind_address = %address,
        "automation worker listening"
    );
    axum::serve(listener, router(dispatcher))
        .await
        .map_err(|error| std::io::Error::other(error.to_string()))
}

fn auth_headers(headers: &HeaderMap) -> AuthHeaders {
    let read = |name: &str| {
        headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_owned)
    };
    AuthHeaders {
        api_key: read(HEADER_API_KEY),
        timestamp: read(HEADER_TIMESTAMP),
        signature: read(HEADER_SIGNATURE),
    }
}

/// Management routes share the webhook auth. Failures are logged and answered
/// with a bare 401.
fn check_auth(
    surface: &AutomationSurface,
    headers: &HeaderMap,
    raw_body: &[u8],
) -> Result<(), (StatusCode, Json<Value>)> {
    let config = &surface.dispatcher.engine().config;
    verify_shared_auth(config, &auth_headers(headers), raw_body).map_err(|error| {
        warn!(
            event_name = "automation.auth.denied",
            error = %error,
            "management request rejected"
        );
        (StatusCode::UNAUTHORIZED, Json(json!({"status": "unauthorized"})))
    })
}

/// Channel event callback. Replies inside the channel's 1 s budget by
/// answering the handshake inline and deferring record processing to a
/// background task.
async fn events(
    State(surface): State<AutomationSurface>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let is_handshake = payload.get("type").and_then(Value::as_str) == Some("url_verification")
        || payload.get("encrypt").is_some();

    if is_handshake {
        return match surface.dispatcher.handle_event(payload).await {
            Ok(EventOutcome::Challenge(challenge)) => {
                (StatusCode::OK, Json(json!({"challenge": challenge})))
            }
            Ok(outcome) => (StatusCode::OK, Json(outcome_body(outcome))),
            Err(error) => drop_event(error),
        };
    }

    let dispatcher = surface.dispatcher.clone();
    tokio::spawn(async move {
        if let Err(error) = dispatcher.handle_event(payload).await {
            warn!(
                event_name = "automation.event.background_failed",
                error = %error,
                "deferred event processing failed"
            );
        }
    });
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// Signature/token failures drop the request with a log entry; the caller
/// learns nothing beyond a 200.
fn drop_event(error: AutomationError) -> (StatusCode, Json<Value>) {
    warn!(
        event_name = "automation.event.dropped",
        error = %error,
        "event rejected"
    );
    match error {
        AutomationError::AuthFailed(_) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        _ => (StatusCode::OK, Json(json!({"status": "ignored"}))),
    }
}

fn outcome_body(outcome: EventOutcome) -> Value {
    match outcome {
        EventOutcome::Challenge(challenge) => json!({"challenge": challenge}),
        EventOutcome::Ignored { event_id, reason } => {
            json!({"status": "ignored", "event_id": event_id, "reason": reason})
        }
        EventOutcome::Duplicate { event_id } => {
            json!({"status": "duplicate", "event_id": event_id})
        }
        EventOutcome::SchemaRefreshed { event_id, outcome } => {
            json!({"status": "schema_refreshed", "event_id": event_id, "schema": outcome})
        }
        EventOutcome::Processed(report) => json!({
            "status": "ok",
            "event_id": report.event_id,
            "kind": format!("{:?}", report.kind),
            "changed_fields": report.changed_fields,
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
struct TableBody {
    app_token: Option<String>,
    table_id: Option<String>,
}

fn resolve_table(
    surface: &AutomationSurface,
    body: &TableBody,
) -> Result<(AppToken, TableId), (StatusCode, Json<Value>)> {
    let defaults = &surface.dispatcher.engine().defaults;
    let app_token = body
        .app_token
        .clone()
        .filter(|token| !token.trim().is_empty())
        .unwrap_or_else(|| defaults.default_app_token.clone());
    let table_id = body
        .table_id
        .clone()
        .filter(|table| !table.trim().is_empty())
        .unwrap_or_else(|| defaults.default_table_id.clone());
    if app_token.is_empty() || table_id.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": "table_id/app_token required"})),
        ));
    }
    Ok((AppToken(app_token), TableId(table_id)))
}

async fn init_snapshot(
    State(surface): State<AutomationSurface>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, &body) {
        return denied;
    }
    let parsed: TableBody = serde_json::from_slice(&body).unwrap_or_default();
    let (app_token, table_id) = match resolve_table(&surface, &parsed) {
        Ok(resolved) => resolved,
        Err(denied) => return denied,
    };

    match surface.dispatcher.engine().init_snapshot(&app_token, &table_id).await {
        Ok((records, cursor)) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "mode": "initialized",
                "table_id": table_id.0,
                "records": records,
                "cursor": cursor,
            })),
        ),
        Err(error) => automation_error(error),
    }
}

async fn scan(
    State(surface): State<AutomationSurface>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, &body) {
        return denied;
    }
    let parsed: TableBody = serde_json::from_slice(&body).unwrap_or_default();
    let (app_token, table_id) = match resolve_table(&surface, &parsed) {
        Ok(resolved) => resolved,
        Err(denied) => return denied,
    };

    match surface.dispatcher.engine().scan_table(&app_token, &table_id, false, false).await {
        Ok(report) => (StatusCode::OK, Json(scan_body(&report, "scan"))),
        Err(error) => automation_error(error),
    }
}

async fn sync(
    State(surface): State<AutomationSurface>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, &body) {
        return denied;
    }
    let parsed: TableBody = serde_json::from_slice(&body).unwrap_or_default();
    let (app_token, table_id) = match resolve_table(&surface, &parsed) {
        Ok(resolved) => resolved,
        Err(denied) => return denied,
    };

    match surface.dispatcher.engine().sync_table(&app_token, &table_id).await {
        Ok(report) => (StatusCode::OK, Json(scan_body(&report, "sync_scan"))),
        Err(error) => automation_error(error),
    }
}

fn scan_body(report: &ScanReport, mode: &str) -> Value {
    json!({
        "status": "ok",
        "mode": mode,
        "table_id": report.table_id.0,
        "from_cursor": report.from_cursor,
        "to_cursor": report.to_cursor,
        "pages": report.pages,
        "scan_truncated": report.truncated,
        "counters": {
            "scanned": report.counters.scanned,
            "initialized": report.counters.initialized,
            "initialized_triggered": report.counters.initialized_triggered,
            "no_change": report.counters.no_change,
            "changed": report.counters.changed,
            "failed": report.counters.failed,
            "deleted_synced": report.counters.deleted_synced,
            "delete_failed": report.counters.delete_failed,
        },
    })
}

#[derive(Debug, Default, Deserialize)]
struct SchemaRefreshQuery {
    #[serde(default)]
    drill: bool,
    table_id: Option<String>,
    app_token: Option<String>,
}

async fn schema_refresh(
    State(surface): State<AutomationSurface>,
    Query(query): Query<SchemaRefreshQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, &body) {
        return denied;
    }
    let engine = surface.dispatcher.engine();
    let watcher = surface.dispatcher.schema_watcher();

    if query.drill {
        let Some(table_id) = query.table_id.clone().filter(|table| !table.is_empty()) else {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": "drill requires table_id"})),
            );
        };
        let app_token = query
            .app_token
            .clone()
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| engine.defaults.default_app_token.clone());
        return match watcher
            .send_risk_drill(&AppToken(app_token), &TableId(table_id.clone()))
            .await
        {
            Ok(sent) => (
                StatusCode::OK,
                Json(json!({
                    "status": if sent { "ok" } else { "disabled" },
                    "drill": true,
                    "table_id": table_id,
                })),
            ),
            Err(error) => automation_error(AutomationError::Upstream(error)),
        };
    }

    let targets = match (&query.table_id, &query.app_token) {
        (Some(table_id), app_token) if !table_id.is_empty() => vec![(
            AppToken(
                app_token
                    .clone()
                    .filter(|token| !token.is_empty())
                    .unwrap_or_else(|| engine.defaults.default_app_token.clone()),
            ),
            TableId(table_id.clone()),
        )],
        _ => engine.poll_targets(),
    };

    let mut results = Vec::with_capacity(targets.len());
    for (app_token, table_id) in targets {
        match watcher.refresh_table(&app_token, &table_id, "manual").await {
            Ok(outcome) => results.push(json!({
                "table_id": table_id.0,
                "outcome": outcome,
            })),
            Err(error) => results.push(json!({
                "table_id": table_id.0,
                "outcome": {"status": "failed", "error": error.to_string()},
            })),
        }
    }
    (StatusCode::OK, Json(json!({"status": "ok", "mode": "schema_refresh", "results": results})))
}

#[derive(Debug, Default, Deserialize)]
struct WebhookQuery {
    #[serde(default)]
    force: bool,
}

async fn rule_webhook(
    State(surface): State<AutomationSurface>,
    Path(rule_id): Path<String>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, &body) {
        return denied;
    }
    let payload: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    if !payload.is_object() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": "webhook payload must be an object"})),
        );
    }

    match surface
        .dispatcher
        .engine()
        .trigger_rule_webhook(&rule_id, &payload, query.force)
        .await
    {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "kind": "webhook_rule_triggered",
                "rule_id": rule_id,
                "event_id": report.event_id,
                "force": query.force,
                "evaluations": report
                    .evaluations
                    .iter()
                    .map(|eval| json!({
                        "rule_id": eval.rule_id,
                        "matched": eval.matched,
                        "skipped_business_duplicate": eval.skipped_business_duplicate,
                    }))
                    .collect::<Vec<_>>(),
            })),
        ),
        Err(error) => automation_error(error),
    }
}

#[derive(Debug, Default, Deserialize)]
struct DelayListQuery {
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_delay_tasks(
    State(surface): State<AutomationSurface>,
    Query(query): Query<DelayListQuery>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, b"") {
        return denied;
    }
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some("scheduled") => Some(DelayTaskStatus::Scheduled),
        Some("running") => Some(DelayTaskStatus::Running),
        Some("done") => Some(DelayTaskStatus::Done),
        Some("cancelled") => Some(DelayTaskStatus::Cancelled),
        Some("failed") => Some(DelayTaskStatus::Failed),
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": format!("invalid status `{other}`")})),
            )
        }
    };

    let store = surface.dispatcher.engine().executors_delay_store();
    match store.list(status, query.limit.unwrap_or(100)).await {
        Ok(tasks) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "tasks": tasks
                    .iter()
                    .map(|task| json!({
                        "task_id": task.task_id,
                        "rule_id": task.rule_id,
                        "status": task.status.as_str(),
                        "scheduled_at": task.scheduled_at,
                        "created_at": task.created_at,
                        "executed_at": task.executed_at,
                        "error_detail": task.error_detail,
                    }))
                    .collect::<Vec<_>>(),
            })),
        ),
        Err(error) => automation_error(AutomationError::Store(error.to_string())),
    }
}

async fn cancel_delay_task(
    State(surface): State<AutomationSurface>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, &body) {
        return denied;
    }
    let store = surface.dispatcher.engine().executors_delay_store();
    match store.cancel(&task_id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "cancelled", "task_id": task_id}))),
        Ok(false) => match store.get(&task_id).await {
            Ok(Some(task)) => (
                StatusCode::CONFLICT,
                Json(json!({
                    "status": "not_cancellable",
                    "task_id": task_id,
                    "current_status": task.status.as_str(),
                })),
            ),
            Ok(None) => (
                StatusCode::NOT_FOUND,
                Json(json!({"status": "not_found", "task_id": task_id})),
            ),
            Err(error) => automation_error(AutomationError::Store(error.to_string())),
        },
        Err(error) => automation_error(AutomationError::Store(error.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct CreateCronBody {
    cron_expr: String,
    actions: Value,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    rule_id: Option<String>,
    #[serde(default)]
    max_consecutive_failures: Option<u32>,
}

async fn create_cron_job(
    State(surface): State<AutomationSurface>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, &body) {
        return denied;
    }
    let engine = surface.dispatcher.engine();
    if let Err(error) = engine.ensure_enabled() {
        return automation_error(error);
    }

    let parsed: CreateCronBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": format!("invalid body: {error}")})),
            )
        }
    };
    if !parsed.actions.is_array() || parsed.actions.as_array().map(Vec::is_empty).unwrap_or(true)
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": "actions must be a non-empty array"})),
        );
    }

    let now_ms = Utc::now().timestamp_millis();
    let next_run_at = match crate::scheduler::next_cron_run_ms(&parsed.cron_expr, now_ms) {
        Ok(next_run_at) => next_run_at,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": error})),
            )
        }
    };

    let payload = json!({
        "actions": parsed.actions,
        "context": parsed.context.unwrap_or_else(|| json!({})),
    });
    let job = NewCronJob {
        cron_expr: parsed.cron_expr.trim().to_owned(),
        payload,
        rule_id: parsed.rule_id.unwrap_or_default(),
        next_run_at,
        max_consecutive_failures: parsed
            .max_consecutive_failures
            .unwrap_or(engine.config.cron_max_consecutive_failures)
            .max(1),
    };

    match engine.cron_jobs.schedule(job).await {
        Ok(job_id) => (
            StatusCode::OK,
            Json(json!({
                "status": "scheduled",
                "job_id": job_id,
                "next_run_at": next_run_at,
            })),
        ),
        Err(error) => automation_error(AutomationError::Store(error.to_string())),
    }
}

#[derive(Debug, Default, Deserialize)]
struct CronListQuery {
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_cron_jobs(
    State(surface): State<AutomationSurface>,
    Query(query): Query<CronListQuery>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, b"") {
        return denied;
    }
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match CronStatus::parse(raw) {
            Ok(status) => Some(status),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"status": "error", "message": format!("invalid status `{raw}`")})),
                )
            }
        },
    };

    match surface
        .dispatcher
        .engine()
        .cron_jobs
        .list(status, query.limit.unwrap_or(100))
        .await
    {
        Ok(jobs) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "jobs": jobs
                    .iter()
                    .map(|job| json!({
                        "job_id": job.job_id,
                        "rule_id": job.rule_id,
                        "status": job.status.as_str(),
                        "cron_expr": job.cron_expr,
                        "next_run_at": job.next_run_at,
                        "last_run_at": job.last_run_at,
                        "last_error": job.last_error,
                        "pause_reason": job.pause_reason,
                        "consecutive_failures": job.consecutive_failures,
                        "max_consecutive_failures": job.max_consecutive_failures,
                        "execution_count": job.execution_count,
                    }))
                    .collect::<Vec<_>>(),
            })),
        ),
        Err(error) => automation_error(AutomationError::Store(error.to_string())),
    }
}

async fn cancel_cron_job(
    State(surface): State<AutomationSurface>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, &body) {
        return denied;
    }
    let store = &surface.dispatcher.engine().cron_jobs;
    match store.cancel(&job_id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "cancelled", "job_id": job_id}))),
        Ok(false) => match store.get(&job_id).await {
            Ok(Some(job)) => (
                StatusCode::CONFLICT,
                Json(json!({
                    "status": "not_cancellable",
                    "job_id": job_id,
                    "current_status": job.status.as_str(),
                })),
            ),
            Ok(None) => {
                (StatusCode::NOT_FOUND, Json(json!({"status": "not_found", "job_id": job_id})))
            }
            Err(error) => automation_error(AutomationError::Store(error.to_string())),
        },
        Err(error) => automation_error(AutomationError::Store(error.to_string())),
    }
}

async fn resume_cron_job(
    State(surface): State<AutomationSurface>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = check_auth(&surface, &headers, &body) {
        return denied;
    }
    let store = &surface.dispatcher.engine().cron_jobs;
    match store.resume(&job_id, Utc::now().timestamp_millis()).await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "resumed", "job_id": job_id}))),
        Ok(false) => match store.get(&job_id).await {
            Ok(Some(job)) => (
                StatusCode::CONFLICT,
                Json(json!({
                    "status": "not_resumable",
                    "job_id": job_id,
                    "current_status": job.status.as_str(),
                })),
            ),
            Ok(None) => {
                (StatusCode::NOT_FOUND, Json(json!({"status": "not_found", "job_id": job_id})))
            }
            Err(error) => automation_error(AutomationError::Store(error.to_string())),
        },
        Err(error) => automation_error(AutomationError::Store(error.to_string())),
    }
}

/// Probes token acquisition and upstream connectivity.
async fn auth_health(State(surface): State<AutomationSurface>) -> (StatusCode, Json<Value>) {
    let engine = surface.dispatcher.engine();
    let app_token = AppToken(engine.defaults.default_app_token.clone());
    match engine.api.list_tables(&app_token).await {
        Ok(tables) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "upstream": "reachable", "tables": tables.len()})),
        ),
        Err(error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "detail": error.to_string()})),
        ),
    }
}

fn automation_error(error: AutomationError) -> (StatusCode, Json<Value>) {
    let status = match &error {
        AutomationError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
        AutomationError::Validation(_) => StatusCode::BAD_REQUEST,
        AutomationError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"status": "error", "code": error.code().as_str(), "message": error.to_string()})),
    )
}
