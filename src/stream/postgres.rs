//! Postgres Change Stream
//!
//! Polling adapter over the event table's `global_seq` column. Shards are
//! a fixed hash partition of the aggregate space; within a shard, records
//! come back in commit order, which preserves per-aggregate version order
//! because the log serializes commits per aggregate.

use serde_json::Value;
use sqlx::PgPool;

use super::{
    parse_shard, shard_name, ChangeStream, IteratorPosition, RecordBatch, RecordKind, ShardInfo,
    ShardIterator, StreamError, StreamRecord,
};

/// Change stream over the Postgres event log.
#[derive(Debug, Clone)]
pub struct PgChangeStream {
    pool: PgPool,
    shard_count: u32,
}

impl PgChangeStream {
    /// `shard_count` must match the event log writing the table.
    pub fn new(pool: PgPool, shard_count: u32) -> Self {
        Self { pool, shard_count }
    }

    fn shard_index(&self, shard_id: &str) -> Result<u32, StreamError> {
        match parse_shard(shard_id) {
            Some(index) if index < self.shard_count => Ok(index),
            _ => Err(StreamError::UnknownShard(shard_id.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl ChangeStream for PgChangeStream {
    async fn describe(&self) -> Result<Vec<ShardInfo>, StreamError> {
        Ok((0..self.shard_count)
            .map(|index| ShardInfo {
                shard_id: shard_name(index),
            })
            .collect())
    }

    async fn open_iterator(
        &self,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<ShardIterator, StreamError> {
        self.shard_index(shard_id)?;

        let after_sequence = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => {
                let max: Option<i64> =
                    sqlx::query_scalar("SELECT MAX(global_seq) FROM events")
                        .fetch_optional(&self.pool)
                        .await?
                        .flatten();
                max.unwrap_or(0)
            }
            IteratorPosition::AfterSequence(sequence) => sequence,
        };

        Ok(ShardIterator {
            shard_id: shard_id.to_string(),
            after_sequence,
        })
    }

    async fn fetch(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<RecordBatch, StreamError> {
        let shard = self.shard_index(&iterator.shard_id)? as i32;

        let rows: Vec<(i64, Value)> = sqlx::query_as(
            r#"
            SELECT global_seq, event_data FROM events
            WHERE shard = $1 AND global_seq > $2
            ORDER BY global_seq ASC
            LIMIT $3
            "#,
        )
        .bind(shard)
        .bind(iterator.after_sequence)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let records: Vec<StreamRecord> = rows
            .into_iter()
            .map(|(sequence, event_data)| StreamRecord {
                sequence,
                kind: RecordKind::Insert,
                event_data,
            })
            .collect();

        let after_sequence = records
            .last()
            .map(|record| record.sequence)
            .unwrap_or(iterator.after_sequence);

        Ok(RecordBatch {
            records,
            next: Some(ShardIterator {
                shard_id: iterator.shard_id.clone(),
                after_sequence,
            }),
        })
    }
}
