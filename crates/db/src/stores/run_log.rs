use casebook_core::chrono::Utc;
use casebook_core::FieldValue;
use serde::{Deserialize, Serialize};
use sqlx::Row;

use super::StoreError;
use crate::DbPool;

/// Fixed-shape, append-only record of one rule evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunLogRow {
    pub timestamp: String,
    pub event_id: String,
    pub rule_id: String,
    pub app_token: String,
    pub table_id: String,
    pub record_id: String,
    pub rules_evaluated: Vec<String>,
    pub rules_matched: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<ChangedPair>,
    pub actions_executed: Vec<String>,
    pub actions_detail: Vec<ActionDetail>,
    pub result: RunResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub sent_to_dead_letter: bool,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangedPair {
    pub old: Option<FieldValue>,
    pub new: Option<FieldValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionDetail {
    #[serde(rename = "type")]
    pub action_type: String,
    pub retry_count: u32,
    pub duration_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Success,
    Partial,
    Failed,
    NoMatch,
}

impl RunResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::NoMatch => "no_match",
        }
    }
}

/// Filter for run-log reads (operations and tests).
#[derive(Clone, Debug, Default)]
pub struct RunLogQuery {
    pub event_id: Option<String>,
    pub table_id: Option<String>,
    pub record_id: Option<String>,
    pub limit: u32,
}

pub struct RunLogStore {
    pool: DbPool,
}

impl RunLogStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, mut row: RunLogRow) -> Result<(), StoreError> {
        if row.timestamp.is_empty() {
            row.timestamp = Utc::now().to_rfc3339();
        }
        let payload = serde_json::to_string(&row)
            .map_err(|error| StoreError::Decode(format!("run log encode failed: {error}")))?;

        sqlx::query(
            "INSERT INTO run_logs \
             (timestamp, event_id, rule_id, app_token, table_id, record_id, result, payload_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.timestamp)
        .bind(&row.event_id)
        .bind(&row.rule_id)
        .bind(&row.app_token)
        .bind(&row.table_id)
        .bind(&row.record_id)
        .bind(row.result.as_str())
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn query(&self, query: RunLogQuery) -> Result<Vec<RunLogRow>, StoreError> {
        let limit = if query.limit == 0 { 100 } else { query.limit.min(500) };
        let mut sql = String::from("SELECT payload_json FROM run_logs WHERE 1 = 1");
        if query.event_id.is_some() {
            sql.push_str(" AND event_id = ?");
        }
        if query.table_id.is_some() {
            sql.push_str(" AND table_id = ?");
        }
        if query.record_id.is_some() {
            sql.push_str(" AND record_id = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut statement = sqlx::query(&sql);
        if let Some(event_id) = &query.event_id {
            statement = statement.bind(event_id);
        }
        if let Some(table_id) = &query.table_id {
            statement = statement.bind(table_id);
        }
        if let Some(record_id) = &query.record_id {
            statement = statement.bind(record_id);
        }
        statement = statement.bind(i64::from(limit));

        let rows = statement.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get("payload_json").map_err(StoreError::Database)?;
                serde_json::from_str(&raw)
                    .map_err(|error| StoreError::Decode(format!("run log decode failed: {error}")))
            })
            .collect()
    }
}

#[cfg(test)]
pub fn sample_row(event_id: &str, rule_id: &str, result: RunResult) -> RunLogRow {
    RunLogRow {
        timestamp: String::new(),
        event_id: event_id.to_owned(),
        rule_id: rule_id.to_owned(),
        app_token: "appA".to_owned(),
        table_id: "tblCases".to_owned(),
        record_id: "recX".to_owned(),
        rules_evaluated: vec![rule_id.to_owned()],
        rules_matched: if matches!(result, RunResult::NoMatch) {
            Vec::new()
        } else {
            vec![rule_id.to_owned()]
        },
        trigger_field: Some("案件分类".to_owned()),
        changed: Some(ChangedPair {
            old: Some(FieldValue::SingleSelect("民事".to_owned())),
            new: Some(FieldValue::SingleSelect("劳动争议".to_owned())),
        }),
        actions_executed: vec!["log.write".to_owned()],
        actions_detail: vec![ActionDetail {
            action_type: "log.write".to_owned(),
            retry_count: 0,
            duration_ms: 3,
        }],
        result,
        error: None,
        retry_count: 0,
        sent_to_dead_letter: false,
        duration_ms: 12,
    }
}
