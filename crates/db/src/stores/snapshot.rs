use casebook_core::chrono::Utc;
use casebook_core::{AppToken, FieldMap, RecordId, TableId};
use sqlx::Row;

use super::StoreError;
use crate::DbPool;

/// Per-record field snapshots: the last state the engine successfully
/// processed for each `(app_token, table_id, record_id)`.
pub struct SnapshotStore {
    pool: DbPool,
}

impl SnapshotStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn load(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
    ) -> Result<Option<FieldMap>, StoreError> {
        let row = sqlx::query(
            "SELECT fields_json FROM snapshots \
             WHERE app_token = ? AND table_id = ? AND record_id = ?",
        )
        .bind(&app_token.0)
        .bind(&table_id.0)
        .bind(&record_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("fields_json").map_err(StoreError::Database)?;
                let fields = serde_json::from_str::<FieldMap>(&raw).map_err(|error| {
                    StoreError::Decode(format!(
                        "invalid snapshot for {}/{}: {error}",
                        table_id.0, record_id.0
                    ))
                })?;
                Ok(Some(fields))
            }
            None => Ok(None),
        }
    }

    pub async fn save(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(fields)
            .map_err(|error| StoreError::Decode(format!("snapshot encode failed: {error}")))?;
        sqlx::query(
            "INSERT INTO snapshots (app_token, table_id, record_id, fields_json, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(app_token, table_id, record_id) DO UPDATE SET \
                 fields_json = excluded.fields_json, \
                 updated_at = excluded.updated_at",
        )
        .bind(&app_token.0)
        .bind(&table_id.0)
        .bind(&record_id.0)
        .bind(&raw)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM snapshots WHERE app_token = ? AND table_id = ? AND record_id = ?",
        )
        .bind(&app_token.0)
        .bind(&table_id.0)
        .bind(&record_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replaces every snapshot of a table in one transaction; used by
    /// `/automation/init` to establish the baseline.
    pub async fn init_full_snapshot(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        records: &[(RecordId, FieldMap)],
    ) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM snapshots WHERE app_token = ? AND table_id = ?")
            .bind(&app_token.0)
            .bind(&table_id.0)
            .execute(&mut *tx)
            .await?;

        for (record_id, fields) in records {
            let raw = serde_json::to_string(fields)
                .map_err(|error| StoreError::Decode(format!("snapshot encode failed: {error}")))?;
            sqlx::query(
                "INSERT INTO snapshots (app_token, table_id, record_id, fields_json, updated_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&app_token.0)
            .bind(&table_id.0)
            .bind(&record_id.0)
            .bind(&raw)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(records.len())
    }

    pub async fn record_ids(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
    ) -> Result<Vec<RecordId>, StoreError> {
        let rows = sqlx::query(
            "SELECT record_id FROM snapshots WHERE app_token = ? AND table_id = ? \
             ORDER BY record_id",
        )
        .bind(&app_token.0)
        .bind(&table_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("record_id")
                    .map(RecordId)
                    .map_err(StoreError::Database)
            })
            .collect()
    }
}
