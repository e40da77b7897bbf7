//! In-memory Event Log
//!
//! Same contract as the Postgres log, held in process memory. Used by the
//! test suites and as the seed for the in-memory change stream: every
//! committed event lands in a shard buffer the stream replays.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::codec;
use crate::domain::EventEnvelope;
use crate::stream::{shard_for, MemoryChangeStream};

use super::{first_versions, validate_batch, EventLog, EventLogError};

/// A committed row: stream position, shard and the canonical payload.
#[derive(Debug, Clone)]
pub(crate) struct MemoryRow {
    pub(crate) sequence: i64,
    pub(crate) shard: u32,
    pub(crate) event_data: Value,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryLogState {
    pub(crate) rows: Vec<MemoryRow>,
    event_ids: HashSet<Uuid>,
    highest: HashMap<Uuid, i64>,
}

/// In-memory event log with the same append semantics as `PgEventLog`.
#[derive(Clone)]
pub struct MemoryEventLog {
    state: Arc<RwLock<MemoryLogState>>,
    shard_count: u32,
}

impl MemoryEventLog {
    /// Create an empty log partitioned into `shard_count` stream shards.
    pub fn new(shard_count: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryLogState::default())),
            shard_count,
        }
    }

    /// The change stream attached to this log.
    pub fn change_stream(&self) -> MemoryChangeStream {
        MemoryChangeStream::new(Arc::clone(&self.state), self.shard_count)
    }

    /// Total number of committed events.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.rows.len()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append_atomic(&self, events: Vec<EventEnvelope>) -> Result<(), EventLogError> {
        validate_batch(&events)?;

        let mut state = self.state.write().await;

        // All checks complete before any row is written, so a failed batch
        // leaves no trace.
        for event in &events {
            if state.event_ids.contains(&event.event_id) {
                return Err(EventLogError::Conflict {
                    aggregate_id: event.aggregate_id,
                    version: event.version,
                });
            }
        }

        for (aggregate_id, first_version) in first_versions(&events) {
            let current = state.highest.get(&aggregate_id).copied().unwrap_or(0);
            if first_version != current + 1 {
                return Err(EventLogError::Conflict {
                    aggregate_id,
                    version: first_version,
                });
            }
        }

        // Encode everything before the first write for the same reason.
        let base = state.rows.len() as i64;
        let mut new_rows = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            new_rows.push(MemoryRow {
                sequence: base + offset as i64 + 1,
                shard: shard_for(event.aggregate_id, self.shard_count),
                event_data: codec::encode(event)?,
            });
        }

        for event in &events {
            state.event_ids.insert(event.event_id);
            state.highest.insert(event.aggregate_id, event.version);
        }
        state.rows.extend(new_rows);

        Ok(())
    }

    async fn read_stream(&self, aggregate_id: Uuid) -> Result<Vec<EventEnvelope>, EventLogError> {
        let state = self.state.read().await;
        let mut events = Vec::new();
        for row in &state.rows {
            let envelope = codec::decode(&row.event_data)?;
            if envelope.aggregate_id == aggregate_id {
                events.push(envelope);
            }
        }
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn highest_version(&self, aggregate_id: Uuid) -> Result<i64, EventLogError> {
        let state = self.state.read().await;
        Ok(state.highest.get(&aggregate_id).copied().unwrap_or(0))
    }
}
