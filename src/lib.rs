//! ledgerstream Library
//!
//! Event-sourced account ledger: the command write path, the append-only
//! event log, the change-stream consumer and the projection service.
//! Re-exports modules for integration testing and embedding.

pub mod aggregate;
pub mod codec;
pub mod command;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod event_log;
pub mod projection;
pub mod stream;

pub use config::{Config, ConfigError};
pub use error::{AppError, AppResult};

pub use aggregate::{load_from_history, Account, AccountStatus, Aggregate};
pub use command::{CommandOptions, CommandReceipt, CommandService};
pub use domain::{
    AccountCommand, AccountEvent, AccountType, Amount, AmountError, Balance, DomainError,
    EventEnvelope,
};
pub use event_log::{EventLog, EventLogError, MemoryEventLog, PgEventLog};
pub use projection::{
    KvProjection, KvStore, MemoryKv, PgRelationalProjection, ProjectionError, ProjectionService,
    Projector,
};
pub use stream::{
    ChangeStream, CheckpointStore, ConsumerOptions, IteratorInit, MemoryChangeStream,
    MemoryCheckpointStore, PgChangeStream, PgCheckpointStore, StreamConsumer, StreamError,
};
