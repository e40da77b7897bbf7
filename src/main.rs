//! ledgerstream - projector daemon
//!
//! Tails the event log's change stream and keeps the key-value and
//! relational read models current. Commands enter through the
//! `CommandService` library API from whatever ingress the deployment runs;
//! this binary owns the read side.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgerstream::projection::{KvProjection, MemoryKv, PgRelationalProjection, ProjectionService};
use ledgerstream::stream::{PgChangeStream, PgCheckpointStore, StreamConsumer};
use ledgerstream::{db, Config};

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgerstream=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env()?;

    tracing::info!("Starting ledgerstream projector");
    tracing::info!("Connecting to database...");

    let pool = db::connect(&config).await?;

    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    tracing::info!("Database connected successfully");

    let stream = Arc::new(PgChangeStream::new(pool.clone(), config.shard_count));
    let checkpoints = Arc::new(PgCheckpointStore::new(pool.clone()));

    // The key-value service adapter is deployment specific; the in-process
    // store stands in until one is wired.
    let kv = KvProjection::new(Arc::new(MemoryKv::new()));
    let relational = PgRelationalProjection::new(pool.clone());
    let projector = Arc::new(ProjectionService::new(kv, relational));

    let consumer = StreamConsumer::new(stream, checkpoints, projector, config.consumer_options());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(shards = config.shard_count, "Consumer running");
    consumer.run(shutdown_rx).await;

    tracing::info!("Consumer stopped, closing database connections...");
    pool.close().await;
    tracing::info!("Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
