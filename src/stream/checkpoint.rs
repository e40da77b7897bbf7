//! Shard checkpoints
//!
//! Per-shard progress markers. The consumer persists the last processed
//! sequence after each batch; on restart, records since the checkpoint are
//! re-delivered, which is why projection handlers are idempotent.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;

use super::StreamError;

/// Durable store for per-shard stream positions.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last persisted sequence for a shard, if any.
    async fn load(&self, shard_id: &str) -> Result<Option<i64>, StreamError>;

    /// Persist the last processed sequence for a shard.
    async fn save(&self, shard_id: &str, sequence: i64) -> Result<(), StreamError>;
}

/// Checkpoints in a Postgres table, one row per shard.
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, shard_id: &str) -> Result<Option<i64>, StreamError> {
        let sequence: Option<i64> = sqlx::query_scalar(
            "SELECT last_sequence FROM stream_checkpoints WHERE shard_id = $1",
        )
        .bind(shard_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sequence)
    }

    async fn save(&self, shard_id: &str, sequence: i64) -> Result<(), StreamError> {
        sqlx::query(
            r#"
            INSERT INTO stream_checkpoints (shard_id, last_sequence, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (shard_id)
            DO UPDATE SET last_sequence = $2, updated_at = NOW()
            "#,
        )
        .bind(shard_id)
        .bind(sequence)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-memory checkpoints for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    positions: DashMap<String, i64>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every checkpoint, forcing the next start to fall back to its
    /// configured initial position.
    pub fn reset(&self) {
        self.positions.clear();
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, shard_id: &str) -> Result<Option<i64>, StreamError> {
        Ok(self.positions.get(shard_id).map(|entry| *entry))
    }

    async fn save(&self, shard_id: &str, sequence: i64) -> Result<(), StreamError> {
        self.positions.insert(shard_id.to_string(), sequence);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_checkpoint_round_trip() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.load("shard-0000").await.unwrap(), None);

        store.save("shard-0000", 41).await.unwrap();
        store.save("shard-0000", 42).await.unwrap();
        assert_eq!(store.load("shard-0000").await.unwrap(), Some(42));

        store.reset();
        assert_eq!(store.load("shard-0000").await.unwrap(), None);
    }
}
