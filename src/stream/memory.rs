//! In-memory Change Stream
//!
//! Replays the shard buffers of `MemoryEventLog`. Shards are fixed at
//! creation and never close; every record is an insert, retained forever,
//! so the trim horizon is always the start of the buffer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::event_log::memory::MemoryLogState;

use super::{
    parse_shard, shard_name, ChangeStream, IteratorPosition, RecordBatch, RecordKind, ShardInfo,
    ShardIterator, StreamError, StreamRecord,
};

/// Change stream over an in-memory event log.
#[derive(Clone)]
pub struct MemoryChangeStream {
    state: Arc<RwLock<MemoryLogState>>,
    shard_count: u32,
}

impl MemoryChangeStream {
    pub(crate) fn new(state: Arc<RwLock<MemoryLogState>>, shard_count: u32) -> Self {
        Self { state, shard_count }
    }

    fn shard_index(&self, shard_id: &str) -> Result<u32, StreamError> {
        match parse_shard(shard_id) {
            Some(index) if index < self.shard_count => Ok(index),
            _ => Err(StreamError::UnknownShard(shard_id.to_string())),
        }
    }
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
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
                let state = self.state.read().await;
                state.rows.last().map(|row| row.sequence).unwrap_or(0)
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
        let shard = self.shard_index(&iterator.shard_id)?;

        let state = self.state.read().await;
        let records: Vec<StreamRecord> = state
            .rows
            .iter()
            .filter(|row| row.shard == shard && row.sequence > iterator.after_sequence)
            .take(limit)
            .map(|row| StreamRecord {
                sequence: row.sequence,
                kind: RecordKind::Insert,
                event_data: row.event_data.clone(),
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
