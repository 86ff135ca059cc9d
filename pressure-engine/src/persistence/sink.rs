//! Bounded, drop-oldest queue feeding a single durable log writer task.

use super::{
    backend::{LogBackend, ParquetBackend},
    record::LogRecord,
};
use crate::{config::PersistenceConfig, error::PersistenceError};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::{
    sync::{
        broadcast::{
            self,
            error::{RecvError, TryRecvError},
        },
        oneshot,
    },
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Counts of records that reached, or failed to reach, the durable log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub enqueued: u64,
    /// Records accepted by the backend, less any lost in a failed final flush.
    pub written: u64,
    /// Oldest records evicted because the queue was full.
    pub overflowed: u64,
    /// Records dropped after exhausting write attempts, or buffered when the final flush failed.
    pub failed: u64,
    /// Records still queued when the shutdown grace period expired.
    pub discarded: u64,
}

impl SinkStats {
    pub fn lost(&self) -> u64 {
        self.overflowed + self.failed + self.discarded
    }
}

#[derive(Debug, Default)]
struct SinkCounters {
    enqueued: AtomicU64,
    written: AtomicU64,
    overflowed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl SinkCounters {
    fn snapshot(&self) -> SinkStats {
        SinkStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable, non-blocking producer side of the [`PersistenceSink`].
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: broadcast::Sender<LogRecord>,
    counters: Arc<SinkCounters>,
}

impl PersistenceHandle {
    /// Queue a record for the writer without waiting. When the queue is full the oldest queued
    /// record is evicted. Returns `false` if the writer has already stopped.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        match self.tx.send(record) {
            Ok(_) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(broadcast::error::SendError(record)) => {
                debug!(
                    kind = %record.event_kind,
                    symbol = %record.symbol,
                    "durable log writer stopped, record not queued"
                );
                false
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }
}

/// Owns the durable log writer task.
#[derive(Debug)]
pub struct PersistenceSink {
    handle: PersistenceHandle,
    shutdown_tx: oneshot::Sender<()>,
    writer: JoinHandle<()>,
}

impl PersistenceSink {
    /// Open the configured segmented log and start the writer.
    pub async fn open(config: PersistenceConfig) -> Result<Self, PersistenceError> {
        let backend = ParquetBackend::open(&config).await?;
        Ok(Self::spawn(backend, config))
    }

    /// Start the writer over an arbitrary backend.
    pub fn spawn<Backend>(backend: Backend, config: PersistenceConfig) -> Self
    where
        Backend: LogBackend + 'static,
    {
        let (tx, rx) = broadcast::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(SinkCounters::default());

        info!(
            backend = backend.backend_type(),
            queue_capacity = config.queue_capacity,
            "durable log writer starting"
        );

        let writer = tokio::spawn(run_writer(
            backend,
            rx,
            shutdown_rx,
            config,
            Arc::clone(&counters),
        ));

        Self {
            handle: PersistenceHandle { tx, counters },
            shutdown_tx,
            writer,
        }
    }

    pub fn handle(&self) -> PersistenceHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> SinkStats {
        self.handle.stats()
    }

    /// Stop the writer, flushing queued records for at most the configured grace period.
    /// Records still queued at the deadline are discarded and reported.
    pub async fn shutdown(self) -> SinkStats {
        let Self {
            handle,
            shutdown_tx,
            writer,
        } = self;

        // Writer already gone means it observed every sender dropping, nothing to signal.
        let _ = shutdown_tx.send(());
        if let Err(error) = writer.await {
            error!(%error, "durable log writer task failed");
        }

        let stats = handle.stats();
        info!(?stats, "durable log writer stopped");
        stats
    }
}

async fn run_writer<Backend>(
    mut backend: Backend,
    mut rx: broadcast::Receiver<LogRecord>,
    mut shutdown_rx: oneshot::Receiver<()>,
    config: PersistenceConfig,
    counters: Arc<SinkCounters>,
) where
    Backend: LogBackend,
{
    let mut checkpoint = tokio::time::interval(config.flush_interval());
    checkpoint.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => break,

            _ = checkpoint.tick() => checkpoint_backend(&mut backend, &config).await,

            received = rx.recv() => match received {
                Ok(record) => write_record(&mut backend, &record, &config, &counters).await,
                Err(RecvError::Lagged(skipped)) => record_overflow(&counters, skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    drain(&mut backend, &mut rx, &config, &counters).await;

    let flushed = tokio::time::timeout(config.write_timeout(), backend.flush())
        .await
        .unwrap_or_else(|_| Err(PersistenceError::Timeout(config.write_timeout_ms)));

    if let Err(error) = flushed {
        let lost = backend.pending() as u64;
        counters.written.fetch_sub(lost, Ordering::Relaxed);
        counters.failed.fetch_add(lost, Ordering::Relaxed);
        error!(
            %error,
            lost,
            backend = backend.backend_type(),
            "durable log flush failed on shutdown, buffered records dropped"
        );
    }
}

/// Buffered records stay with the backend when a checkpoint fails and are retried on the next.
async fn checkpoint_backend<Backend>(backend: &mut Backend, config: &PersistenceConfig)
where
    Backend: LogBackend,
{
    let result = tokio::time::timeout(config.write_timeout(), backend.checkpoint())
        .await
        .unwrap_or_else(|_| Err(PersistenceError::Timeout(config.write_timeout_ms)));

    if let Err(error) = result {
        warn!(
            %error,
            pending = backend.pending(),
            backend = backend.backend_type(),
            "durable log checkpoint failed"
        );
    }
}

async fn drain<Backend>(
    backend: &mut Backend,
    rx: &mut broadcast::Receiver<LogRecord>,
    config: &PersistenceConfig,
    counters: &SinkCounters,
) where
    Backend: LogBackend,
{
    let deadline = Instant::now() + config.shutdown_grace();
    let mut discarded = 0_u64;

    loop {
        let record = match rx.try_recv() {
            Ok(record) => record,
            Err(TryRecvError::Lagged(skipped)) => {
                record_overflow(counters, skipped);
                continue;
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        };

        if Instant::now() >= deadline {
            discarded += 1;
            continue;
        }

        let write = write_record(backend, &record, config, counters);
        if tokio::time::timeout_at(deadline, write).await.is_err() {
            discarded += 1;
        }
    }

    if discarded > 0 {
        counters.discarded.fetch_add(discarded, Ordering::Relaxed);
        warn!(
            discarded,
            grace_ms = config.shutdown_grace_ms,
            "shutdown grace period expired, queued records discarded"
        );
    }
}

fn record_overflow(counters: &SinkCounters, skipped: u64) {
    counters.overflowed.fetch_add(skipped, Ordering::Relaxed);
    warn!(
        dropped = skipped,
        "durable log queue overflow, oldest records dropped"
    );
}

async fn write_record<Backend>(
    backend: &mut Backend,
    record: &LogRecord,
    config: &PersistenceConfig,
    counters: &SinkCounters,
) where
    Backend: LogBackend,
{
    match write_with_retry(backend, record, config).await {
        Ok(()) => {
            counters.written.fetch_add(1, Ordering::Relaxed);
        }
        Err(error) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                %error,
                kind = %record.event_kind,
                symbol = %record.symbol,
                timestamp = record.timestamp,
                attempts = config.max_attempts,
                "durable log write failed, record dropped"
            );
        }
    }
}

/// Attempt a write up to `max_attempts` times, each attempt bounded by the write timeout and
/// separated by a doubling backoff.
async fn write_with_retry<Backend>(
    backend: &mut Backend,
    record: &LogRecord,
    config: &PersistenceConfig,
) -> Result<(), PersistenceError>
where
    Backend: LogBackend,
{
    let mut backoff = config.retry_backoff();
    let mut attempt = 1;

    loop {
        let result = tokio::time::timeout(config.write_timeout(), backend.append(record))
            .await
            .unwrap_or_else(|_| Err(PersistenceError::Timeout(config.write_timeout_ms)));

        match result {
            Ok(()) => return Ok(()),
            Err(error) if attempt < config.max_attempts => {
                warn!(%error, attempt, "durable log write failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        event::{MarketEvent, Side},
        persistence::{DurableLog, Partition, RecordKind},
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// In-memory backend failing the first `failures` appends.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MemoryBackend {
        pub rows: Arc<Mutex<Vec<LogRecord>>>,
        pub failures: Arc<AtomicU64>,
    }

    impl MemoryBackend {
        pub fn failing(failures: u64) -> Self {
            Self {
                failures: Arc::new(AtomicU64::new(failures)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl LogBackend for MemoryBackend {
        async fn append(&mut self, record: &LogRecord) -> Result<(), PersistenceError> {
            let remaining = self.failures.load(Ordering::Relaxed);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::Relaxed);
                return Err(std::io::Error::other("disk unavailable").into());
            }
            self.rows.lock().push(record.clone());
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), PersistenceError> {
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "memory"
        }
    }

    /// Backend whose appends never complete.
    struct StalledBackend;

    #[async_trait]
    impl LogBackend for StalledBackend {
        async fn append(&mut self, _: &LogRecord) -> Result<(), PersistenceError> {
            futures::future::pending::<()>().await;
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), PersistenceError> {
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "stalled"
        }
    }

    /// Backend that buffers every record and can never make it durable.
    #[derive(Default)]
    struct UnflushableBackend {
        buffered: usize,
    }

    #[async_trait]
    impl LogBackend for UnflushableBackend {
        async fn append(&mut self, _: &LogRecord) -> Result<(), PersistenceError> {
            self.buffered += 1;
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), PersistenceError> {
            Err(std::io::Error::other("disk full").into())
        }

        fn pending(&self) -> usize {
            self.buffered
        }

        fn backend_type(&self) -> &'static str {
            "unflushable"
        }
    }

    fn config() -> PersistenceConfig {
        PersistenceConfig {
            queue_capacity: 16,
            max_attempts: 3,
            retry_backoff_ms: 1,
            write_timeout_ms: 20,
            shutdown_grace_ms: 1_000,
            ..PersistenceConfig::default()
        }
    }

    fn record(timestamp: f64) -> LogRecord {
        LogRecord::from(&MarketEvent::trade(timestamp, "BTCUSDT", 10.0, 1.0, Side::Buy))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_writes_in_enqueue_order() {
        let backend = MemoryBackend::default();
        let sink = PersistenceSink::spawn(backend.clone(), config());
        let handle = sink.handle();

        for timestamp in 1..=5 {
            assert!(handle.enqueue(record(timestamp as f64)));
        }
        settle().await;

        let stats = sink.shutdown().await;
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.written, 5);
        assert_eq!(stats.lost(), 0);

        let timestamps = backend.rows.lock().iter().map(|row| row.timestamp).collect::<Vec<_>>();
        assert_eq!(timestamps, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        struct TestCase {
            input: u64,
            expected: (u64, u64),
        }

        let tests = vec![
            TestCase {
                // TC0: recovers on the final attempt
                input: 2,
                expected: (1, 0),
            },
            TestCase {
                // TC1: attempts exhausted, record dropped
                input: 3,
                expected: (0, 1),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let backend = MemoryBackend::failing(test.input);
            let sink = PersistenceSink::spawn(backend.clone(), config());
            sink.handle().enqueue(record(1.0));
            settle().await;

            let stats = sink.shutdown().await;
            assert_eq!((stats.written, stats.failed), test.expected, "TC{} failed", index);
            assert_eq!(backend.rows.lock().len() as u64, test.expected.0, "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_write_timeout_counts_as_failure() {
        let sink = PersistenceSink::spawn(
            StalledBackend,
            PersistenceConfig {
                max_attempts: 1,
                ..config()
            },
        );
        sink.handle().enqueue(record(1.0));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = sink.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let backend = MemoryBackend::default();
        let sink = PersistenceSink::spawn(
            backend.clone(),
            PersistenceConfig {
                queue_capacity: 4,
                ..config()
            },
        );
        let handle = sink.handle();

        // writer has not been polled yet on the current-thread runtime
        for timestamp in 1..=10 {
            handle.enqueue(record(timestamp as f64));
        }

        let stats = sink.shutdown().await;
        assert_eq!(stats.enqueued, 10);
        assert_eq!(stats.overflowed, 6);
        assert_eq!(stats.written, 4);

        let timestamps = backend.rows.lock().iter().map(|row| row.timestamp).collect::<Vec<_>>();
        assert_eq!(timestamps, vec![7.0, 8.0, 9.0, 10.0]);
    }

    #[tokio::test]
    async fn test_shutdown_discards_after_grace_period() {
        let backend = MemoryBackend::default();
        let sink = PersistenceSink::spawn(
            backend.clone(),
            PersistenceConfig {
                shutdown_grace_ms: 0,
                ..config()
            },
        );
        let handle = sink.handle();
        for timestamp in 1..=3 {
            handle.enqueue(record(timestamp as f64));
        }

        let stats = sink.shutdown().await;
        assert_eq!(stats.discarded, 3);
        assert_eq!(stats.written, 0);
        assert!(backend.rows.lock().is_empty());

        // writer gone, enqueue is a no-op rather than an error
        assert!(!handle.enqueue(record(4.0)));
    }

    #[tokio::test]
    async fn test_failed_final_flush_counts_buffered_records_as_lost() {
        let sink = PersistenceSink::spawn(UnflushableBackend::default(), config());
        let handle = sink.handle();
        for timestamp in 1..=3 {
            handle.enqueue(record(timestamp as f64));
        }
        settle().await;
        assert_eq!(sink.stats().written, 3);

        let stats = sink.shutdown().await;
        assert_eq!(stats.written, 0);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.lost(), 3);
    }

    #[tokio::test]
    async fn test_checkpoint_makes_annotations_readable_before_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PersistenceSink::open(PersistenceConfig {
            path: dir.path().to_path_buf(),
            flush_interval_ms: 10,
            write_timeout_ms: 1_000,
            ..config()
        })
        .await
        .unwrap();

        let handle = sink.handle();
        handle.enqueue(record(1.0));
        handle.enqueue(LogRecord::proposal("BTCUSDT".into(), 1.0, "p-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let log = DurableLog::new(dir.path());
        let proposals = log.annotation_counts("BTCUSDT", 0.0, 2.0).unwrap();
        assert_eq!(proposals.get(&RecordKind::Proposal), Some(&1));
        // market rows wait for their segment to age or fill
        assert!(log.segments(Partition::Market, 0.0, 2.0).unwrap().is_empty());

        let stats = sink.shutdown().await;
        assert_eq!(stats.written, 2);
        assert_eq!(log.rows().unwrap().len(), 2);
    }
}
