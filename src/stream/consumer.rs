//! Stream Consumer
//!
//! Tails the change stream with one worker per shard. Within a shard,
//! records are delivered to the projector strictly in stream order, one at
//! a time; the checkpoint advances only after a whole batch has been
//! handed over. Transport trouble never escapes a worker: it backs off,
//! re-acquires its iterator and keeps going.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::codec;
use crate::projection::Projector;

use super::{
    ChangeStream, CheckpointStore, IteratorInit, IteratorPosition, RecordBatch, RecordKind,
    ShardIterator, StreamError, StreamRecord,
};

/// Tuning knobs for the consumer, usually taken from `Config`.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Sleep between shard polls
    pub poll_interval: Duration,
    /// Max records per fetch
    pub batch_limit: usize,
    /// Where a shard starts when no prior position is known
    pub iterator_init: IteratorInit,
    /// How often to re-describe the stream for shard membership changes
    pub redescribe_interval: Duration,
    /// Deadline for each external call
    pub call_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_limit: 100,
            iterator_init: IteratorInit::AfterCheckpoint,
            redescribe_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Supervises one worker per live shard.
pub struct StreamConsumer<S, C, P> {
    stream: Arc<S>,
    checkpoints: Arc<C>,
    projector: Arc<P>,
    options: ConsumerOptions,
}

impl<S, C, P> StreamConsumer<S, C, P>
where
    S: ChangeStream + 'static,
    C: CheckpointStore + 'static,
    P: Projector + 'static,
{
    pub fn new(
        stream: Arc<S>,
        checkpoints: Arc<C>,
        projector: Arc<P>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            stream,
            checkpoints,
            projector,
            options,
        }
    }

    /// Run until the shutdown signal flips. Periodically re-describes the
    /// stream so shard splits get a worker and exited workers of closed
    /// shards are reaped; on shutdown every worker finishes its in-flight
    /// batch before the call returns.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut workers: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut shutdown_rx = shutdown.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match timeout(self.options.call_timeout, self.stream.describe()).await {
                Ok(Ok(shards)) => {
                    workers.retain(|_, handle| !handle.is_finished());
                    for shard in shards {
                        if !workers.contains_key(&shard.shard_id) {
                            tracing::info!(shard = %shard.shard_id, "starting shard worker");
                            let worker = ShardWorker {
                                stream: Arc::clone(&self.stream),
                                checkpoints: Arc::clone(&self.checkpoints),
                                projector: Arc::clone(&self.projector),
                                options: self.options.clone(),
                                shard_id: shard.shard_id.clone(),
                            };
                            workers.insert(shard.shard_id, tokio::spawn(worker.run(shutdown.clone())));
                        }
                    }
                }
                Ok(Err(error)) => {
                    tracing::warn!(error = %error, "describing the stream failed");
                }
                Err(_) => {
                    tracing::warn!(
                        deadline = ?self.options.call_timeout,
                        "describing the stream timed out"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.redescribe_interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(workers = workers.len(), "stream consumer stopping");
        for (shard_id, handle) in workers {
            if let Err(error) = handle.await {
                tracing::error!(shard = %shard_id, error = %error, "shard worker panicked");
            }
        }
    }
}

/// Per-shard lifecycle
enum ShardState {
    Initializing,
    Polling(ShardIterator),
    Recovering(u32),
    Stopping,
}

enum PollOutcome {
    Continue(ShardIterator),
    ShardClosed,
    Failed,
}

struct ShardWorker<S, C, P> {
    stream: Arc<S>,
    checkpoints: Arc<C>,
    projector: Arc<P>,
    options: ConsumerOptions,
    shard_id: String,
}

impl<S, C, P> ShardWorker<S, C, P>
where
    S: ChangeStream,
    C: CheckpointStore,
    P: Projector,
{
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut state = ShardState::Initializing;
        let mut last_processed: Option<i64> = None;

        loop {
            if *shutdown.borrow() {
                state = ShardState::Stopping;
            }

            state = match state {
                ShardState::Initializing => {
                    match self.acquire_iterator(last_processed).await {
                        Ok(iterator) => ShardState::Polling(iterator),
                        Err(error) => {
                            tracing::warn!(
                                shard = %self.shard_id,
                                error = %error,
                                "failed to open shard iterator"
                            );
                            ShardState::Recovering(0)
                        }
                    }
                }

                ShardState::Polling(iterator) => {
                    match self.poll_once(&iterator, &mut last_processed).await {
                        PollOutcome::Continue(next) => {
                            if !sleep_or_shutdown(self.options.poll_interval, &mut shutdown).await {
                                ShardState::Stopping
                            } else {
                                ShardState::Polling(next)
                            }
                        }
                        PollOutcome::ShardClosed => {
                            tracing::info!(shard = %self.shard_id, "shard closed, worker exiting");
                            return;
                        }
                        PollOutcome::Failed => ShardState::Recovering(0),
                    }
                }

                ShardState::Recovering(attempt) => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        shard = %self.shard_id,
                        attempt,
                        backoff = ?delay,
                        "recovering shard iterator"
                    );
                    if !sleep_or_shutdown(delay, &mut shutdown).await {
                        ShardState::Stopping
                    } else {
                        match self.acquire_iterator(last_processed).await {
                            Ok(iterator) => ShardState::Polling(iterator),
                            Err(_) => ShardState::Recovering(attempt.saturating_add(1)),
                        }
                    }
                }

                ShardState::Stopping => {
                    tracing::info!(shard = %self.shard_id, "shard worker stopped");
                    return;
                }
            };
        }
    }

    /// Resume after the last delivered record when this worker has already
    /// processed something; otherwise fall back to the configured start
    /// policy.
    async fn acquire_iterator(
        &self,
        last_processed: Option<i64>,
    ) -> Result<ShardIterator, StreamError> {
        let position = match last_processed {
            Some(sequence) => IteratorPosition::AfterSequence(sequence),
            None => self.initial_position().await?,
        };

        timeout(
            self.options.call_timeout,
            self.stream.open_iterator(&self.shard_id, position),
        )
        .await
        .map_err(|_| StreamError::Timeout(self.options.call_timeout))?
    }

    async fn initial_position(&self) -> Result<IteratorPosition, StreamError> {
        match self.options.iterator_init {
            IteratorInit::Latest => Ok(IteratorPosition::Latest),
            IteratorInit::TrimHorizon => Ok(IteratorPosition::TrimHorizon),
            IteratorInit::AfterCheckpoint => {
                match self.checkpoints.load(&self.shard_id).await? {
                    Some(sequence) => Ok(IteratorPosition::AfterSequence(sequence)),
                    // No checkpoint yet: rebuild from the oldest record.
                    None => Ok(IteratorPosition::TrimHorizon),
                }
            }
        }
    }

    async fn poll_once(
        &self,
        iterator: &ShardIterator,
        last_processed: &mut Option<i64>,
    ) -> PollOutcome {
        let batch: RecordBatch = match timeout(
            self.options.call_timeout,
            self.stream.fetch(iterator, self.options.batch_limit),
        )
        .await
        {
            Ok(Ok(batch)) => batch,
            Ok(Err(error)) => {
                tracing::warn!(shard = %self.shard_id, error = %error, "fetch failed");
                return PollOutcome::Failed;
            }
            Err(_) => {
                tracing::warn!(
                    shard = %self.shard_id,
                    deadline = ?self.options.call_timeout,
                    "fetch timed out"
                );
                return PollOutcome::Failed;
            }
        };

        if !batch.records.is_empty() {
            tracing::debug!(
                shard = %self.shard_id,
                records = batch.records.len(),
                "processing batch"
            );
        }

        for record in &batch.records {
            self.deliver(record).await;
            *last_processed = Some(record.sequence);
        }

        // Checkpoint after the batch, success or not: re-delivery plus
        // idempotent handlers cover per-target failures.
        if let Some(last) = batch.records.last() {
            if let Err(error) = self.checkpoints.save(&self.shard_id, last.sequence).await {
                tracing::warn!(
                    shard = %self.shard_id,
                    sequence = last.sequence,
                    error = %error,
                    "failed to persist checkpoint"
                );
            }
        }

        match batch.next {
            Some(next) => PollOutcome::Continue(next),
            None => PollOutcome::ShardClosed,
        }
    }

    async fn deliver(&self, record: &StreamRecord) {
        if record.kind != RecordKind::Insert {
            tracing::warn!(
                shard = %self.shard_id,
                sequence = record.sequence,
                kind = ?record.kind,
                "ignoring non-insert record on an append-only stream"
            );
            return;
        }

        let envelope = match codec::decode(&record.event_data) {
            Ok(envelope) => envelope,
            Err(error) => {
                // Poison record: re-delivery would fail identically, so it
                // is logged and skipped.
                tracing::error!(
                    shard = %self.shard_id,
                    sequence = record.sequence,
                    error = %error,
                    "undecodable stream record skipped"
                );
                return;
            }
        };

        match timeout(
            self.options.call_timeout,
            self.projector.project(&envelope),
        )
        .await
        {
            Ok(report) => {
                if !report.is_ok() {
                    tracing::debug!(
                        shard = %self.shard_id,
                        sequence = record.sequence,
                        "event left unapplied on at least one target"
                    );
                }
            }
            Err(_) => {
                tracing::error!(
                    shard = %self.shard_id,
                    sequence = record.sequence,
                    deadline = ?self.options.call_timeout,
                    "projection timed out, record remains for replay"
                );
            }
        }
    }
}

/// Exponential backoff, 500ms doubling up to 30s.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.min(6);
    Duration::from_millis(500 * (1u64 << exp)).min(Duration::from_secs(30))
}

/// Sleep, returning false when the shutdown signal interrupts.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_err() || !*shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountEvent, EventEnvelope};
    use crate::projection::{ProjectionReport, Projector};
    use crate::stream::{MemoryCheckpointStore, ShardInfo};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn record(sequence: i64, kind: RecordKind) -> StreamRecord {
        let envelope = EventEnvelope::for_account(
            Uuid::new_v4(),
            1,
            AccountEvent::FundsDeposited { amount: dec!(1) },
        );
        StreamRecord {
            sequence,
            kind,
            event_data: codec::encode(&envelope).unwrap(),
        }
    }

    fn iterator_after(sequence: i64) -> ShardIterator {
        ShardIterator {
            shard_id: "shard-0000".to_string(),
            after_sequence: sequence,
        }
    }

    /// Stream stub with scripted fetch results; repeats empty batches once
    /// the script runs dry.
    struct ScriptedStream {
        fetches: Mutex<VecDeque<Result<RecordBatch, StreamError>>>,
        opened_at: Mutex<Vec<IteratorPosition>>,
    }

    impl ScriptedStream {
        fn new(fetches: Vec<Result<RecordBatch, StreamError>>) -> Self {
            Self {
                fetches: Mutex::new(fetches.into()),
                opened_at: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChangeStream for ScriptedStream {
        async fn describe(&self) -> Result<Vec<ShardInfo>, StreamError> {
            Ok(vec![ShardInfo {
                shard_id: "shard-0000".to_string(),
            }])
        }

        async fn open_iterator(
            &self,
            shard_id: &str,
            position: IteratorPosition,
        ) -> Result<ShardIterator, StreamError> {
            self.opened_at.lock().unwrap().push(position);
            Ok(ShardIterator {
                shard_id: shard_id.to_string(),
                after_sequence: 0,
            })
        }

        async fn fetch(
            &self,
            iterator: &ShardIterator,
            _limit: usize,
        ) -> Result<RecordBatch, StreamError> {
            match self.fetches.lock().unwrap().pop_front() {
                Some(result) => result,
                None => Ok(RecordBatch {
                    records: Vec::new(),
                    next: Some(iterator.clone()),
                }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingProjector {
        seen: Mutex<Vec<EventEnvelope>>,
    }

    impl RecordingProjector {
        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Projector for RecordingProjector {
        async fn project(&self, envelope: &EventEnvelope) -> ProjectionReport {
            self.seen.lock().unwrap().push(envelope.clone());
            ProjectionReport {
                kv: Ok(()),
                relational: Ok(()),
            }
        }
    }

    fn fast_options() -> ConsumerOptions {
        ConsumerOptions {
            poll_interval: Duration::from_millis(5),
            batch_limit: 100,
            iterator_init: IteratorInit::AfterCheckpoint,
            redescribe_interval: Duration::from_millis(20),
            call_timeout: Duration::from_secs(2),
        }
    }

    fn worker(
        stream: Arc<ScriptedStream>,
        checkpoints: Arc<MemoryCheckpointStore>,
        projector: Arc<RecordingProjector>,
    ) -> ShardWorker<ScriptedStream, MemoryCheckpointStore, RecordingProjector> {
        ShardWorker {
            stream,
            checkpoints,
            projector,
            options: fast_options(),
            shard_id: "shard-0000".to_string(),
        }
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) {
        timeout(deadline, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_worker_delivers_batch_in_order_and_checkpoints() {
        let stream = Arc::new(ScriptedStream::new(vec![Ok(RecordBatch {
            records: vec![
                record(1, RecordKind::Insert),
                record(2, RecordKind::Insert),
                record(3, RecordKind::Insert),
            ],
            next: Some(iterator_after(3)),
        })]));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let projector = Arc::new(RecordingProjector::default());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(
            worker(
                Arc::clone(&stream),
                Arc::clone(&checkpoints),
                Arc::clone(&projector),
            )
            .run(rx),
        );

        wait_until(Duration::from_secs(5), || projector.count() == 3).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(checkpoints.load("shard-0000").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_worker_skips_poison_and_non_insert_records() {
        let poison = StreamRecord {
            sequence: 2,
            kind: RecordKind::Insert,
            event_data: serde_json::json!({"event_id": "not even close"}),
        };
        let stream = Arc::new(ScriptedStream::new(vec![Ok(RecordBatch {
            records: vec![
                record(1, RecordKind::Insert),
                poison,
                record(3, RecordKind::Modify),
                record(4, RecordKind::Insert),
            ],
            next: Some(iterator_after(4)),
        })]));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let projector = Arc::new(RecordingProjector::default());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(
            worker(
                Arc::clone(&stream),
                Arc::clone(&checkpoints),
                Arc::clone(&projector),
            )
            .run(rx),
        );

        wait_until(Duration::from_secs(5), || projector.count() == 2).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // The checkpoint covers skipped records; they will not come back.
        assert_eq!(checkpoints.load("shard-0000").await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_worker_recovers_after_fetch_error() {
        let stream = Arc::new(ScriptedStream::new(vec![
            Err(StreamError::Transport(sqlx::Error::PoolClosed)),
            Ok(RecordBatch {
                records: vec![record(1, RecordKind::Insert)],
                next: Some(iterator_after(1)),
            }),
        ]));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let projector = Arc::new(RecordingProjector::default());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(
            worker(
                Arc::clone(&stream),
                Arc::clone(&checkpoints),
                Arc::clone(&projector),
            )
            .run(rx),
        );

        wait_until(Duration::from_secs(5), || projector.count() == 1).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Recovery re-acquired the iterator after the failure.
        assert!(stream.opened_at.lock().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn test_worker_exits_when_shard_closes() {
        let stream = Arc::new(ScriptedStream::new(vec![Ok(RecordBatch {
            records: vec![record(1, RecordKind::Insert)],
            next: None,
        })]));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let projector = Arc::new(RecordingProjector::default());

        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(
            worker(
                Arc::clone(&stream),
                Arc::clone(&checkpoints),
                Arc::clone(&projector),
            )
            .run(rx),
        );

        // No shutdown signal needed: the worker exits on its own.
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not exit")
            .unwrap();
        assert_eq!(projector.count(), 1);
    }

    #[tokio::test]
    async fn test_worker_resumes_from_persisted_checkpoint() {
        let stream = Arc::new(ScriptedStream::new(Vec::new()));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints.save("shard-0000", 17).await.unwrap();
        let projector = Arc::new(RecordingProjector::default());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(
            worker(
                Arc::clone(&stream),
                Arc::clone(&checkpoints),
                Arc::clone(&projector),
            )
            .run(rx),
        );

        wait_until(Duration::from_secs(5), || {
            !stream.opened_at.lock().unwrap().is_empty()
        })
        .await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(
            stream.opened_at.lock().unwrap()[0],
            IteratorPosition::AfterSequence(17)
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(60), Duration::from_secs(30));
    }
}
