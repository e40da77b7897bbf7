//! Event Log
//!
//! The append-only store of all events and the system's sole source of
//! truth. Appends are all-or-nothing; per-aggregate versions form a gapless
//! sequence starting at 1; a committed event is never mutated or deleted.

pub(crate) mod memory;
mod postgres;

pub use memory::MemoryEventLog;
pub use postgres::PgEventLog;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::EventEnvelope;

/// Errors that can occur in the event log
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// Optimistic concurrency failure: the event id or the
    /// (aggregate, version) slot is already taken. Callers retry from the
    /// reconstitution step.
    #[error("Append conflict for aggregate {aggregate_id} at version {version}")]
    Conflict { aggregate_id: Uuid, version: i64 },

    /// Store or network unavailability; not retried here
    #[error("Transport error: {0}")]
    Transport(#[from] sqlx::Error),

    /// A bounded call exceeded its deadline
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// A stored row could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The batch itself is malformed (empty, or non-consecutive versions)
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),
}

impl EventLogError {
    /// Check if this error is a concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventLogError::Conflict { .. })
    }
}

/// Storage seam for the append-only event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Commit a non-empty batch of events as one all-or-nothing
    /// transaction. Succeeds only if every event id is new and every
    /// aggregate's versions extend its stream contiguously.
    async fn append_atomic(&self, events: Vec<EventEnvelope>) -> Result<(), EventLogError>;

    /// All events for one aggregate, ordered by ascending version.
    async fn read_stream(&self, aggregate_id: Uuid) -> Result<Vec<EventEnvelope>, EventLogError>;

    /// Highest version recorded for the aggregate, or 0 if none.
    async fn highest_version(&self, aggregate_id: Uuid) -> Result<i64, EventLogError>;
}

/// Validate batch shape before touching storage: non-empty, and per
/// aggregate the versions are consecutive in batch order. The lowest
/// version of each aggregate is checked against the committed stream
/// inside the append transaction.
pub(crate) fn validate_batch(events: &[EventEnvelope]) -> Result<(), EventLogError> {
    if events.is_empty() {
        return Err(EventLogError::InvalidBatch("empty batch".to_string()));
    }

    let mut last_version: HashMap<Uuid, i64> = HashMap::new();
    for event in events {
        if event.version < 1 {
            return Err(EventLogError::InvalidBatch(format!(
                "version {} for aggregate {} is below 1",
                event.version, event.aggregate_id
            )));
        }
        if let Some(previous) = last_version.get(&event.aggregate_id) {
            if event.version != previous + 1 {
                return Err(EventLogError::InvalidBatch(format!(
                    "versions for aggregate {} jump from {} to {}",
                    event.aggregate_id, previous, event.version
                )));
            }
        }
        last_version.insert(event.aggregate_id, event.version);
    }

    Ok(())
}

/// First (lowest) version per aggregate in the batch, in batch order.
pub(crate) fn first_versions(events: &[EventEnvelope]) -> Vec<(Uuid, i64)> {
    let mut firsts: Vec<(Uuid, i64)> = Vec::new();
    for event in events {
        if !firsts.iter().any(|(id, _)| *id == event.aggregate_id) {
            firsts.push((event.aggregate_id, event.version));
        }
    }
    firsts
}
