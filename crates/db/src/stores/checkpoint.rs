use casebook_core::chrono::Utc;
use casebook_core::{AppToken, TableId};
use sqlx::Row;

use super::StoreError;
use crate::DbPool;

/// Per-table scan cursor. All records with modification time ≤ the cursor
/// have been considered at least once.
pub struct CheckpointStore {
    pool: DbPool,
}

impl CheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, app_token: &AppToken, table_id: &TableId) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT last_cursor FROM checkpoints WHERE app_token = ? AND table_id = ?",
        )
        .bind(&app_token.0)
        .bind(&table_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_get("last_cursor").map_err(StoreError::Database),
            None => Ok(0),
        }
    }

    pub async fn set(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        cursor: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO checkpoints (app_token, table_id, last_cursor, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(app_token, table_id) DO UPDATE SET \
                 last_cursor = excluded.last_cursor, \
                 updated_at = excluded.updated_at",
        )
        .bind(&app_token.0)
        .bind(&table_id.0)
        .bind(cursor)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
