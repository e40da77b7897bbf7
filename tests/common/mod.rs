//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use ledgerstream::command::CommandService;
use ledgerstream::domain::EventEnvelope;
use ledgerstream::event_log::MemoryEventLog;
use ledgerstream::projection::{
    KvProjection, MemoryKv, ProjectionError, ProjectionService, ProjectionTarget,
};
use ledgerstream::stream::{
    ConsumerOptions, IteratorInit, MemoryChangeStream, MemoryCheckpointStore, StreamConsumer,
};

/// Stand-in for the relational target when no database is around; the
/// in-memory suites assert against the key-value side.
pub struct StubRelational;

#[async_trait]
impl ProjectionTarget for StubRelational {
    fn name(&self) -> &'static str {
        "relational"
    }

    async fn apply(&self, _envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        Ok(())
    }
}

pub type MemoryProjector = ProjectionService<KvProjection<MemoryKv>, StubRelational>;

/// The whole pipeline on in-memory parts: log, command service, stream,
/// checkpoints and the key-value read model.
pub struct MemoryStack {
    pub log: Arc<MemoryEventLog>,
    pub service: Arc<CommandService<MemoryEventLog>>,
    pub kv: Arc<MemoryKv>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub stream: Arc<MemoryChangeStream>,
    pub projector: Arc<MemoryProjector>,
}

impl MemoryStack {
    pub fn new() -> Self {
        let log = Arc::new(MemoryEventLog::new(4));
        let service = Arc::new(CommandService::new(Arc::clone(&log)));
        let kv = Arc::new(MemoryKv::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let stream = Arc::new(log.change_stream());
        let projector = Arc::new(ProjectionService::new(
            KvProjection::new(Arc::clone(&kv)),
            StubRelational,
        ));

        Self {
            log,
            service,
            kv,
            checkpoints,
            stream,
            projector,
        }
    }

    /// Spawn a consumer over this stack. Tests poll the read model and
    /// then call `RunningConsumer::stop`.
    pub fn spawn_consumer(&self, iterator_init: IteratorInit) -> RunningConsumer {
        let options = ConsumerOptions {
            poll_interval: Duration::from_millis(5),
            batch_limit: 100,
            iterator_init,
            redescribe_interval: Duration::from_millis(20),
            call_timeout: Duration::from_secs(2),
        };

        let consumer = StreamConsumer::new(
            Arc::clone(&self.stream),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.projector),
            options,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });

        RunningConsumer { shutdown, handle }
    }
}

pub struct RunningConsumer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunningConsumer {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.handle.await.expect("consumer panicked");
    }
}

/// Poll the key-value model until the account's row has absorbed at least
/// `version`, failing the test after a few seconds.
pub async fn wait_for_version(
    kv: &MemoryKv,
    account_id: uuid::Uuid,
    version: i64,
) -> ledgerstream::projection::BalanceRow {
    use ledgerstream::projection::KvStore;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(row) = kv.get_balance(account_id).await.unwrap() {
                if row.last_version >= version {
                    return row;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("projection did not catch up within deadline")
}

/// Connect to the test database and reset every table this crate owns.
/// Used by the Postgres suites, which are ignored unless a database is
/// provisioned.
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::query(
        "TRUNCATE TABLE events, stream_checkpoints, daily_balances, account_summary, \
         transactions, accounts CASCADE",
    )
    .execute(&pool)
    .await
    .expect("Failed to clean up DB");

    pool
}
