use std::sync::Arc;

use casebook_core::{AppToken, AutomationError, RecordId, TableId};
use casebook_feishu::crypto::decrypt_event;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{info, warn};

use crate::processor::{AutomationEngine, ProcessOrigin, ProcessReport};
use crate::schema_watcher::{RefreshOutcome, SchemaWatcher};

/// What the `/events` endpoint should reply with.
#[derive(Clone, Debug)]
pub enum EventOutcome {
    /// URL-verification handshake; echo the challenge.
    Challenge(String),
    /// Dropped with a 200 and a no-op log.
    Ignored { event_id: String, reason: &'static str },
    /// Event id already seen inside the TTL window.
    Duplicate { event_id: String },
    /// `field_changed` routed to the schema watcher.
    SchemaRefreshed { event_id: String, outcome: RefreshOutcome },
    /// Record change processed by the engine.
    Processed(ProcessReport),
}

/// Central entry for change-event callbacks. Verifies the channel token,
/// deduplicates event ids, normalizes payloads, and fans out to the
/// processor or the schema watcher.
pub struct Dispatcher {
    engine: Arc<AutomationEngine>,
    schema_watcher: Arc<SchemaWatcher>,
    verification_token: SecretString,
    encrypt_key: Option<SecretString>,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<AutomationEngine>,
        schema_watcher: Arc<SchemaWatcher>,
        verification_token: SecretString,
        encrypt_key: Option<SecretString>,
    ) -> Self {
        Self { engine, schema_watcher, verification_token, encrypt_key }
    }

    pub fn engine(&self) -> &Arc<AutomationEngine> {
        &self.engine
    }

    pub fn schema_watcher(&self) -> &Arc<SchemaWatcher> {
        &self.schema_watcher
    }

    pub async fn handle_event(&self, payload: Value) -> Result<EventOutcome, AutomationError> {
        self.engine.ensure_enabled()?;

        let payload = match payload.get("encrypt").and_then(Value::as_str) {
            Some(encrypted) => {
                let key = self.encrypt_key.as_ref().ok_or_else(|| {
                    AutomationError::Validation(
                        "encrypted payload received but encrypt_key is empty".into(),
                    )
                })?;
                decrypt_event(encrypted, key.expose_secret())
                    .map_err(|error| AutomationError::Validation(error.to_string()))?
            }
            None => payload,
        };

        if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
            self.verify_token(payload.get("token"))?;
            let challenge = payload
                .get("challenge")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AutomationError::Validation("url_verification missing challenge".into())
                })?;
            return Ok(EventOutcome::Challenge(challenge.to_owned()));
        }

        let header = payload.get("header").and_then(Value::as_object).ok_or_else(|| {
            AutomationError::Validation("event envelope missing header".into())
        })?;
        self.verify_token(header.get("token").or_else(|| payload.get("token")))?;

        let event_id = header
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AutomationError::Validation("missing header.event_id".into()))?;
        let event_type =
            header.get("event_type").and_then(Value::as_str).unwrap_or_default().to_owned();

        if self
            .engine
            .idempotency
            .is_event_duplicate(&event_id)
            .await
            .map_err(|error| AutomationError::Store(error.to_string()))?
        {
            info!(event_name = "automation.event.duplicate", event_id = %event_id, "event replayed");
            return Ok(EventOutcome::Duplicate { event_id });
        }

        let event = payload.get("event").and_then(Value::as_object).ok_or_else(|| {
            AutomationError::Validation("event envelope missing event body".into())
        })?;
        let app_token = event
            .get("app_token")
            .or_else(|| event.get("appToken"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let table_id = event
            .get("table_id")
            .or_else(|| event.get("tableId"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        if event_type.contains("field_changed") {
            self.engine
                .idempotency
                .mark_event(&event_id)
                .await
                .map_err(|error| AutomationError::Store(error.to_string()))?;

            if app_token.is_empty() || table_id.is_empty() {
                return Ok(EventOutcome::Ignored {
                    event_id,
                    reason: "field_changed_missing_app_or_table",
                });
            }
            if !self.engine.config.schema_sync_event_driven {
                return Ok(EventOutcome::Ignored {
                    event_id,
                    reason: "schema_sync_event_driven_disabled",
                });
            }

            let outcome = self
                .schema_watcher
                .refresh_table(&AppToken(app_token), &TableId(table_id), "event")
                .await?;
            return Ok(EventOutcome::SchemaRefreshed { event_id, outcome });
        }

        if !event_type.contains("record_changed") && !event_type.contains("record_created") {
            self.engine
                .idempotency
                .mark_event(&event_id)
                .await
                .map_err(|error| AutomationError::Store(error.to_string()))?;
            info!(
                event_name = "automation.event.ignored",
                event_id = %event_id,
                event_type = %event_type,
                "unsupported event type"
            );
            return Ok(EventOutcome::Ignored { event_id, reason: "unsupported_event_type" });
        }

        let record_id = event
            .get("record_id")
            .or_else(|| event.get("recordId"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if app_token.is_empty() || table_id.is_empty() || record_id.is_empty() {
            return Err(AutomationError::Validation(
                "record event missing app_token/table_id/record_id".into(),
            ));
        }

        let report = self
            .engine
            .process_record(
                &event_id,
                &AppToken(app_token),
                &TableId(table_id),
                &RecordId(record_id),
                ProcessOrigin::Event,
                None,
            )
            .await;

        match report {
            Ok(report) => {
                self.engine
                    .idempotency
                    .mark_event(&event_id)
                    .await
                    .map_err(|error| AutomationError::Store(error.to_string()))?;
                info!(
                    event_name = "automation.event.processed",
                    event_id = %event_id,
                    kind = ?report.kind,
                    "event processed"
                );
                Ok(EventOutcome::Processed(report))
            }
            Err(error) => {
                warn!(
                    event_name = "automation.event.failed",
                    event_id = %event_id,
                    error = %error,
                    "event processing failed"
                );
                Err(error)
            }
        }
    }

    fn verify_token(&self, token: Option<&Value>) -> Result<(), AutomationError> {
        let expected = self.verification_token.expose_secret();
        if expected.is_empty() {
            return Ok(());
        }
        match token.and_then(Value::as_str) {
            Some(token) if token == expected => Ok(()),
            _ => Err(AutomationError::AuthFailed("invalid verification token".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use casebook_core::rules::RuleRegistry;
    use casebook_core::{AutomationError, FieldValue};
    use casebook_db::RunLogQuery;
    use serde_json::json;

    use crate::executors::test_support::{fields_of, ScriptedBitable};
    use crate::executors::ExecutorSet;
    use crate::http_guard::OutboundHostGuard;
    use crate::processor::AutomationEngine;
    use crate::schema_watcher::SchemaWatcher;

    use super::{Dispatcher, EventOutcome};

    const RULES: &str = r#"
rules:
  - id: R001
    table: { table_id: tblCases }
    trigger:
      on: [updated]
      field: 案件分类
      condition: { kind: equals, value: 劳动争议 }
    pipeline:
      - { type: log.write, template: "案件 {record_id} 转为劳动争议" }
"#;

    async fn dispatcher(api: Arc<ScriptedBitable>) -> Dispatcher {
        let pool =
            casebook_db::connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        casebook_db::migrations::run_pending(&pool).await.expect("migrations");

        let mut config = casebook_core::config::AppConfig::default().automation;
        config.enabled = true;
        config.trigger_on_new_record_event = false;

        let rules = Arc::new(RuleRegistry::from_yaml(RULES).expect("rules"));
        let executors = ExecutorSet::new(
            api.clone(),
            Arc::new(casebook_db::DelayTaskStore::new(pool.clone())),
            OutboundHostGuard::new(&[]),
            3,
            0,
            5,
            false,
        );
        let engine = Arc::new(AutomationEngine::new(
            config.clone(),
            casebook_core::config::AppConfig::default().bitable,
            api.clone(),
            rules.clone(),
            casebook_db::SnapshotStore::new(pool.clone()),
            casebook_db::IdempotencyStore::new(pool.clone(), 3600),
            casebook_db::CheckpointStore::new(pool.clone()),
            casebook_db::RunLogStore::new(pool.clone()),
            casebook_db::DeadLetterStore::new(pool.clone()),
            Arc::new(casebook_db::CronStore::new(pool.clone())),
            executors,
        ));
        let schema_watcher = Arc::new(SchemaWatcher::new(config, api, rules));
        Dispatcher::new(engine, schema_watcher, "tok".to_owned().into(), None)
    }

    fn record_event(event_id: &str) -> serde_json::Value {
        json!({
            "header": {
                "event_id": event_id,
                "event_type": "drive.bitable.record_changed_v1",
                "token": "tok"
            },
            "event": {
                "app_token": "appA",
                "table_id": "tblCases",
                "record_id": "recX"
            }
        })
    }

    #[tokio::test]
    async fn challenge_handshake_echoes_back() {
        let dispatcher = dispatcher(Arc::new(ScriptedBitable::default())).await;
        let outcome = dispatcher
            .handle_event(json!({"type": "url_verification", "token": "tok", "challenge": "c-1"}))
            .await
            .expect("handle");
        assert!(matches!(outcome, EventOutcome::Challenge(challenge) if challenge == "c-1"));
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let dispatcher = dispatcher(Arc::new(ScriptedBitable::default())).await;
        let mut payload = record_event("evt-1");
        payload["header"]["token"] = "wrong".into();
        let result = dispatcher.handle_event(payload).await;
        assert!(matches!(result, Err(AutomationError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn duplicate_event_id_yields_exactly_one_run_log_row() {
        let api = Arc::new(ScriptedBitable::default());
        api.seed(
            "tblCases",
            "recX",
            fields_of(&[("案件分类", FieldValue::SingleSelect("劳动争议".into()))]),
        )
        .await;
        let dispatcher = dispatcher(api.clone()).await;

        // Seed the snapshot through a first pass (initialization, no rules).
        dispatcher.handle_event(record_event("evt-0")).await.expect("init pass");
        // Flip the upstream value so evt-1 observes a change.
        {
            let mut tables = api.tables.lock().await;
            let record = tables
                .get_mut("tblCases")
                .and_then(|records| records.first_mut())
                .expect("seeded record");
            record
                .fields
                .insert("案件分类".into(), FieldValue::SingleSelect("劳动争议2".into()));
        }

        let first = dispatcher.handle_event(record_event("evt-1")).await.expect("first");
        assert!(matches!(first, EventOutcome::Processed(_)));

        let second = dispatcher.handle_event(record_event("evt-1")).await.expect("second");
        assert!(matches!(second, EventOutcome::Duplicate { .. }));

        let rows = dispatcher
            .engine()
            .run_logs
            .query(RunLogQuery { event_id: Some("evt-1".into()), ..Default::default() })
            .await
            .expect("query");
        assert_eq!(rows.len(), 1, "same event_id twice must produce one row");
    }

    #[tokio::test]
    async fn unsupported_event_types_are_ignored_politely() {
        let dispatcher = dispatcher(Arc::new(ScriptedBitable::default())).await;
        let payload = json!({
            "header": {"event_id": "evt-x", "event_type": "im.message.receive_v1", "token": "tok"},
            "event": {}
        });
        let outcome = dispatcher.handle_event(payload).await.expect("handle");
        assert!(matches!(
            outcome,
            EventOutcome::Ignored { reason: "unsupported_event_type", .. }
        ));
    }

    #[tokio::test]
    async fn field_changed_routes_to_schema_watcher() {
        let api = Arc::new(ScriptedBitable::default());
        api.schemas.lock().await.insert(
            "tblCases".into(),
            casebook_core::TableSchema::from_fields(vec![casebook_core::FieldDescriptor {
                field_id: "fld1".into(),
                name: "案件分类".into(),
                field_type: 3,
            }]),
        );
        let dispatcher = dispatcher(api).await;

        let payload = json!({
            "header": {
                "event_id": "evt-s",
                "event_type": "drive.bitable.field_changed_v1",
                "token": "tok"
            },
            "event": {"app_token": "appA", "table_id": "tblCases"}
        });
        let outcome = dispatcher.handle_event(payload).await.expect("handle");
        assert!(matches!(outcome, EventOutcome::SchemaRefreshed { .. }));
    }
}
