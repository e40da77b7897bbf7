//! Projection errors
//!
//! Per-target failures. These are logged and absorbed by the stream
//! consumer; re-delivery retries them on the next pass.

use std::time::Duration;

use uuid::Uuid;

/// Errors from a projection target
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A balance-moving event arrived for an account the target has never
    /// seen, which means its open event was lost or is still in flight.
    #[error("No projected state for account {account_id}")]
    MissingState { account_id: Uuid },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// Key-value store adapter failure
    #[error("Store error: {0}")]
    Store(String),
}
