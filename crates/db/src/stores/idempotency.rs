use casebook_core::chrono::Utc;
use sqlx::Row;

use super::StoreError;
use crate::DbPool;

const EVENT_BUCKET: &str = "events";
const BUSINESS_BUCKET: &str = "business";
const MAX_KEYS_PER_BUCKET: i64 = 50_000;

/// Two deduplication keyspaces: event-level (by event id, TTL-bounded) and
/// business-level (rule + record + change-set hash, marked on success only).
pub struct IdempotencyStore {
    pool: DbPool,
    event_ttl_secs: i64,
    business_ttl_secs: i64,
}

impl IdempotencyStore {
    pub fn new(pool: DbPool, event_ttl_secs: u64) -> Self {
        Self {
            pool,
            event_ttl_secs: event_ttl_secs.max(1) as i64,
            business_ttl_secs: (event_ttl_secs.max(1) as i64) * 7,
        }
    }

    pub async fn is_event_duplicate(&self, event_id: &str) -> Result<bool, StoreError> {
        self.is_duplicate(EVENT_BUCKET, event_id, self.event_ttl_secs).await
    }

    pub async fn mark_event(&self, event_id: &str) -> Result<(), StoreError> {
        self.mark(EVENT_BUCKET, event_id).await
    }

    pub async fn is_business_duplicate(&self, business_key: &str) -> Result<bool, StoreError> {
        self.is_duplicate(BUSINESS_BUCKET, business_key, self.business_ttl_secs).await
    }

    pub async fn mark_business(&self, business_key: &str) -> Result<(), StoreError> {
        self.mark(BUSINESS_BUCKET, business_key).await
    }

    /// Drops expired keys and trims each bucket to its capacity bound.
    pub async fn cleanup(&self) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        for (bucket, ttl) in
            [(EVENT_BUCKET, self.event_ttl_secs), (BUSINESS_BUCKET, self.business_ttl_secs)]
        {
            sqlx::query("DELETE FROM idempotency_keys WHERE bucket = ? AND ts < ?")
                .bind(bucket)
                .bind(now - ttl)
                .execute(&self.pool)
                .await?;
            sqlx::query(
                "DELETE FROM idempotency_keys \
                 WHERE bucket = ? AND key IN ( \
                     SELECT key FROM idempotency_keys WHERE bucket = ? \
                     ORDER BY ts DESC LIMIT -1 OFFSET ?)",
            )
            .bind(bucket)
            .bind(bucket)
            .bind(MAX_KEYS_PER_BUCKET)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn is_duplicate(&self, bucket: &str, key: &str, ttl: i64) -> Result<bool, StoreError> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(false);
        }
        let cutoff = Utc::now().timestamp() - ttl;
        let row = sqlx::query(
            "SELECT 1 AS hit FROM idempotency_keys \
             WHERE bucket = ? AND key = ? AND ts >= ? LIMIT 1",
        )
        .bind(bucket)
        .bind(key)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.try_get::<i64, _>("hit").is_ok()).unwrap_or(false))
    }

    async fn mark(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT OR REPLACE INTO idempotency_keys (bucket, key, ts) VALUES (?, ?, ?)",
        )
        .bind(bucket)
        .bind(key)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::IdempotencyStore;
    use crate::migrations::run_pending;

    async fn store(ttl: u64) -> IdempotencyStore {
        let pool = crate::connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        IdempotencyStore::new(pool, ttl)
    }

    #[tokio::test]
    async fn event_keys_deduplicate_within_ttl() {
        let store = store(3600).await;

        assert!(!store.is_event_duplicate("evt-1").await.expect("check"));
        store.mark_event("evt-1").await.expect("mark");
        assert!(store.is_event_duplicate("evt-1").await.expect("check"));
        assert!(!store.is_event_duplicate("evt-2").await.expect("check"));
    }

    #[tokio::test]
    async fn business_and_event_buckets_are_independent() {
        let store = store(3600).await;

        store.mark_event("shared-key").await.expect("mark");
        assert!(!store.is_business_duplicate("shared-key").await.expect("check"));

        store.mark_business("shared-key").await.expect("mark");
        assert!(store.is_business_duplicate("shared-key").await.expect("check"));
    }

    #[tokio::test]
    async fn blank_keys_never_match() {
        let store = store(3600).await;
        store.mark_event("  ").await.expect("mark is a no-op");
        assert!(!store.is_event_duplicate("").await.expect("check"));
        assert!(!store.is_event_duplicate("   ").await.expect("check"));
    }

    #[tokio::test]
    async fn cleanup_keeps_fresh_keys() {
        let store = store(3600).await;
        store.mark_event("evt-fresh").await.expect("mark");
        store.cleanup().await.expect("cleanup");
        assert!(store.is_event_duplicate("evt-fresh").await.expect("check"));
    }
}
