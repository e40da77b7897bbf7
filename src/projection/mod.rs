//! Projection Service
//!
//! Applies committed events to the two read stores. Delivery is
//! at-least-once, so every handler is idempotent; the two targets are
//! attempted independently and one failing never blocks the other.

pub mod error;
pub mod kv;
pub mod relational;

pub use error::ProjectionError;
pub use kv::{BalanceRow, KvProjection, KvStore, MemoryKv, TransactionKind, TransactionRow};
pub use relational::PgRelationalProjection;

use async_trait::async_trait;

use crate::domain::EventEnvelope;

/// One read store the projection service writes to.
#[async_trait]
pub trait ProjectionTarget: Send + Sync {
    /// Target name for logs and reports.
    fn name(&self) -> &'static str;

    /// Apply one event. Re-applying an already-applied event must be a
    /// no-op.
    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError>;
}

/// What happened to one event across both targets. The consumer
/// checkpoints once both results are in, success or not; restart
/// re-delivery covers transient failures.
#[derive(Debug)]
pub struct ProjectionReport {
    pub kv: Result<(), ProjectionError>,
    pub relational: Result<(), ProjectionError>,
}

impl ProjectionReport {
    pub fn is_ok(&self) -> bool {
        self.kv.is_ok() && self.relational.is_ok()
    }

    /// Failed targets with their errors.
    pub fn failures(&self) -> Vec<(&'static str, &ProjectionError)> {
        let mut failures = Vec::new();
        if let Err(e) = &self.kv {
            failures.push(("key_value", e));
        }
        if let Err(e) = &self.relational {
            failures.push(("relational", e));
        }
        failures
    }
}

/// The seam the stream consumer dispatches through.
#[async_trait]
pub trait Projector: Send + Sync {
    async fn project(&self, envelope: &EventEnvelope) -> ProjectionReport;
}

/// Fans one event out to the key-value and relational targets.
pub struct ProjectionService<K, R> {
    kv: K,
    relational: R,
}

impl<K, R> ProjectionService<K, R> {
    pub fn new(kv: K, relational: R) -> Self {
        Self { kv, relational }
    }
}

#[async_trait]
impl<K, R> Projector for ProjectionService<K, R>
where
    K: ProjectionTarget,
    R: ProjectionTarget,
{
    async fn project(&self, envelope: &EventEnvelope) -> ProjectionReport {
        let (kv, relational) =
            tokio::join!(self.kv.apply(envelope), self.relational.apply(envelope));

        for (result, name) in [(&kv, self.kv.name()), (&relational, self.relational.name())] {
            if let Err(error) = result {
                tracing::error!(
                    target_store = name,
                    event_id = %envelope.event_id,
                    aggregate_id = %envelope.aggregate_id,
                    event_type = envelope.event_type(),
                    error = %error,
                    "projection target rejected event"
                );
            }
        }

        ProjectionReport { kv, relational }
    }
}
