//! Postgres Event Log
//!
//! One row per event, keyed by event id, with a unique
//! (aggregate_id, version) slot. Both uniqueness checks and the
//! highest-version precondition run inside a single transaction, which is
//! what makes a multi-event append all-or-nothing. The `global_seq` and
//! `shard` columns exist for the change stream and play no part in the
//! write-path contract.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::codec;
use crate::domain::EventEnvelope;
use crate::stream::shard_for;

use super::{first_versions, validate_batch, EventLog, EventLogError};

/// Event log backed by a PostgreSQL `events` table.
#[derive(Debug, Clone)]
pub struct PgEventLog {
    pool: PgPool,
    shard_count: u32,
}

impl PgEventLog {
    /// Create a new log over the given pool. `shard_count` must match the
    /// change stream reading the same table.
    pub fn new(pool: PgPool, shard_count: u32) -> Self {
        Self { pool, shard_count }
    }
}

#[async_trait::async_trait]
impl EventLog for PgEventLog {
    async fn append_atomic(&self, events: Vec<EventEnvelope>) -> Result<(), EventLogError> {
        validate_batch(&events)?;

        let mut tx = self.pool.begin().await?;

        // Each aggregate's batch must extend its committed stream exactly.
        for (aggregate_id, first_version) in first_versions(&events) {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                    .bind(aggregate_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .flatten();

            let current = current.unwrap_or(0);
            if first_version != current + 1 {
                return Err(EventLogError::Conflict {
                    aggregate_id,
                    version: first_version,
                });
            }
        }

        for event in &events {
            let event_data = codec::encode(event)?;
            let shard = shard_for(event.aggregate_id, self.shard_count) as i32;

            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id, aggregate_id, aggregate_type,
                    event_type, version, shard, created_at, event_data
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id)
            .bind(event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(event.event_type())
            .bind(event.version)
            .bind(shard)
            .bind(event.timestamp)
            .bind(&event_data)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, event))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn read_stream(&self, aggregate_id: Uuid) -> Result<Vec<EventEnvelope>, EventLogError> {
        let rows: Vec<Value> = sqlx::query_scalar(
            r#"
            SELECT event_data FROM events
            WHERE aggregate_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|value| codec::decode(value).map_err(EventLogError::from))
            .collect()
    }

    async fn highest_version(&self, aggregate_id: Uuid) -> Result<i64, EventLogError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        Ok(version.unwrap_or(0))
    }
}

/// A unique violation on the event id or the version slot is a losing race,
/// not a transport failure.
fn map_insert_error(error: sqlx::Error, event: &EventEnvelope) -> EventLogError {
    if let sqlx::Error::Database(ref db_err) = error {
        let conflicted = matches!(
            db_err.constraint(),
            Some("events_pkey") | Some("events_aggregate_id_version_key")
        );
        if conflicted {
            return EventLogError::Conflict {
                aggregate_id: event.aggregate_id,
                version: event.version,
            };
        }
    }
    EventLogError::Transport(error)
}
