//! Error handling module
//!
//! The command path's error surface. Domain rejections, log conflicts and
//! transport failures pass through verbatim; the caller decides what to do
//! with them. The stream side never reports through this type, it absorbs
//! and logs.

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Errors surfaced by the command service
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A command violated a business rule; never retried
    #[error(transparent)]
    Domain(#[from] crate::domain::DomainError),

    /// Event log failure: conflict, transport or serialization
    #[error(transparent)]
    EventLog(#[from] crate::event_log::EventLogError),

    /// Configuration error at startup
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl AppError {
    /// Check for an optimistic-concurrency conflict, the one retryable
    /// failure on the command path.
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::EventLog(e) if e.is_conflict())
    }
}
