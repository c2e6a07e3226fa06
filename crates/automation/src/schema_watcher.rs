use std::collections::HashMap;
use std::sync::Arc;

use casebook_core::chrono::Utc;
use casebook_core::config::AutomationConfig;
use casebook_core::rules::{trigger_fields, RuleRegistry};
use casebook_core::{AppToken, SchemaDiff, TableId, TableSchema, UpstreamError};
use casebook_feishu::BitableApi;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::auth::sign_payload;

/// Outcome of one schema refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RefreshOutcome {
    /// First observation of this table; cached without a risk notification.
    Bootstrap { field_count: usize },
    /// Schema unchanged since the last observation.
    Noop,
    /// Schema drifted; lists the applied runtime policy.
    Changed { diff: SchemaDiff, disabled_rules: Vec<DisabledRule>, re_enabled_rules: Vec<String>, webhook_sent: bool },
    Disabled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DisabledRule {
    pub rule_id: String,
    pub missing_field: String,
}

/// Maintains the last-known field schema per table and applies the runtime
/// policy when a rule's trigger field disappears. The rules file itself is
/// never modified.
pub struct SchemaWatcher {
    config: AutomationConfig,
    api: Arc<dyn BitableApi>,
    rules: Arc<RuleRegistry>,
    http: reqwest::Client,
    cache: RwLock<HashMap<(String, String), TableSchema>>,
}

impl SchemaWatcher {
    pub fn new(config: AutomationConfig, api: Arc<dyn BitableApi>, rules: Arc<RuleRegistry>) -> Self {
        Self {
            config,
            api,
            rules,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn cached_schema(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
    ) -> Option<TableSchema> {
        self.cache.read().await.get(&(app_token.0.clone(), table_id.0.clone())).cloned()
    }

    /// Refreshes one table's schema, applying the runtime rule policy on
    /// drift.
    pub async fn refresh_table(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        triggered_by: &str,
    ) -> Result<RefreshOutcome, UpstreamError> {
        if !self.config.schema_sync_enabled {
            return Ok(RefreshOutcome::Disabled);
        }

        let latest = self.api.list_fields(app_token, table_id).await?;
        let key = (app_token.0.clone(), table_id.0.clone());

        let previous = {
            let mut cache = self.cache.write().await;
            cache.insert(key, latest.clone())
        };

        let Some(previous) = previous else {
            info!(
                event_name = "schema_bootstrap",
                table_id = %table_id.0,
                triggered_by,
                fields = latest.fields.len(),
                "schema cached for the first time"
            );
            // Bootstrap still lifts stale runtime disables, e.g. after a
            // process restart with the field already restored.
            self.apply_policy(table_id, &latest);
            return Ok(RefreshOutcome::Bootstrap { field_count: latest.fields.len() });
        };

        let diff = previous.diff(&latest);
        if diff.is_empty() {
            info!(
                event_name = "schema_refresh_noop",
                table_id = %table_id.0,
                triggered_by,
                "schema unchanged"
            );
            return Ok(RefreshOutcome::Noop);
        }

        info!(
            event_name = "schema_changed",
            table_id = %table_id.0,
            triggered_by,
            added = diff.added.len(),
            removed = diff.removed.len(),
            retyped = diff.retyped.len(),
            "schema drift observed"
        );

        let (disabled_rules, re_enabled_rules) = self.apply_policy(table_id, &latest);
        info!(
            event_name = "schema_policy_applied",
            table_id = %table_id.0,
            disabled = disabled_rules.len(),
            re_enabled = re_enabled_rules.len(),
            "runtime rule policy applied"
        );

        let webhook_sent = if !disabled_rules.is_empty() {
            self.send_risk_webhook(app_token, table_id, &diff, &disabled_rules, false).await
        } else {
            false
        };

        Ok(RefreshOutcome::Changed { diff, disabled_rules, re_enabled_rules, webhook_sent })
    }

    /// Runtime-disables rules whose trigger fields are gone and re-enables
    /// rules whose fields reappeared.
    fn apply_policy(
        &self,
        table_id: &TableId,
        latest: &TableSchema,
    ) -> (Vec<DisabledRule>, Vec<String>) {
        let mut disabled = Vec::new();
        for rule in self.rules.all() {
            if !rule.enabled || rule.table.table_id != table_id.0 {
                continue;
            }
            for field in trigger_fields(&rule) {
                if !latest.has_field(&field) {
                    warn!(
                        event_name = "automation.rule.runtime_disabled",
                        rule_id = %rule.id,
                        field = %field,
                        "trigger field missing from schema"
                    );
                    self.rules.runtime_disable(&rule.id, field.clone());
                    disabled.push(DisabledRule { rule_id: rule.id.clone(), missing_field: field });
                    break;
                }
            }
        }

        let mut re_enabled = Vec::new();
        for (rule_id, missing_field) in self.rules.runtime_disabled_rules() {
            let still_disabled = disabled.iter().any(|entry| entry.rule_id == rule_id);
            if !still_disabled && latest.has_field(&missing_field) {
                info!(
                    event_name = "automation.rule.runtime_enabled",
                    rule_id = %rule_id,
                    field = %missing_field,
                    "trigger field restored"
                );
                self.rules.runtime_enable(&rule_id);
                re_enabled.push(rule_id);
            }
        }

        (disabled, re_enabled)
    }

    /// Posts the risk notification; failures are logged, never propagated.
    async fn send_risk_webhook(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        diff: &SchemaDiff,
        disabled_rules: &[DisabledRule],
        drill: bool,
    ) -> bool {
        let Some(url) = self.config.schema_webhook_url.as_deref() else {
            return false;
        };

        let payload = json!({
            "kind": "schema_risk",
            "app_token": app_token.0,
            "table_id": table_id.0,
            "removed_fields": diff.removed,
            "retyped_fields": diff.retyped,
            "disabled_rules": disabled_rules,
            "drill": drill,
        });
        let raw = payload.to_string();

        let mut request = self.http.post(url).header("content-type", "application/json");
        if let Some(secret) = &self.config.schema_webhook_secret {
            let timestamp = Utc::now().timestamp();
            let signature = sign_payload(secret.expose_secret(), timestamp, raw.as_bytes());
            request = request
                .header(crate::auth::HEADER_TIMESTAMP, timestamp.to_string())
                .header(crate::auth::HEADER_SIGNATURE, format!("sha256={signature}"));
        }

        match request.body(raw).send().await {
            Ok(response) if response.status().is_success() => {
                info!(
                    event_name = "automation.schema.risk_webhook_sent",
                    table_id = %table_id.0,
                    drill,
                    "risk webhook delivered"
                );
                true
            }
            Ok(response) => {
                warn!(
                    event_name = "automation.schema.risk_webhook_failed",
                    status = response.status().as_u16(),
                    "risk webhook rejected"
                );
                false
            }
            Err(error) => {
                warn!(
                    event_name = "automation.schema.risk_webhook_failed",
                    error = %error,
                    "risk webhook unreachable"
                );
                false
            }
        }
    }

    /// Exercises the risk webhook path on demand. Requires the drill flag and
    /// an explicit table.
    pub async fn send_risk_drill(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
    ) -> Result<bool, UpstreamError> {
        if !self.config.schema_webhook_drill_enabled {
            return Ok(false);
        }
        let diff = SchemaDiff {
            added: Vec::new(),
            removed: vec!["__drill__".to_owned()],
            retyped: Vec::new(),
        };
        Ok(self.send_risk_webhook(app_token, table_id, &diff, &[], true).await)
    }
}
