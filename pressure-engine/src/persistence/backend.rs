use super::{
    record::LogRecord,
    segment::{self, Partition, SegmentName},
};
use crate::{config::PersistenceConfig, error::PersistenceError};
use async_trait::async_trait;
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info};

/// Append-only destination for [`LogRecord`]s.
#[async_trait]
pub trait LogBackend: Send {
    /// Accept a single record. Buffering backends may hold it until a later checkpoint.
    async fn append(&mut self, record: &LogRecord) -> Result<(), PersistenceError>;

    /// Persist buffered records that are due. Called periodically by the writer.
    async fn checkpoint(&mut self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Persist every buffered record.
    async fn flush(&mut self) -> Result<(), PersistenceError>;

    /// Records accepted by [`Self::append`] that are not yet durable.
    fn pending(&self) -> usize {
        0
    }

    /// Backend type for logging.
    fn backend_type(&self) -> &'static str;
}

#[derive(Debug)]
struct SegmentBuffer {
    rows: Vec<LogRecord>,
    opened_at: Option<Instant>,
}

impl SegmentBuffer {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            opened_at: None,
        }
    }

    fn push(&mut self, record: LogRecord) {
        self.opened_at.get_or_insert_with(Instant::now);
        self.rows.push(record);
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.opened_at = None;
    }

    fn is_due(&self, max_age: Duration) -> bool {
        self.opened_at
            .is_some_and(|opened_at| opened_at.elapsed() >= max_age)
    }
}

/// Buffers rows per [`Partition`] and seals them into immutable Parquet segments.
///
/// A partition is sealed when it holds `segment_max_rows` rows and another arrives, on flush,
/// and on checkpoint: annotations whenever any are buffered, market rows once the oldest has been
/// buffered for `segment_max_age_ms`. Each segment is written under a hidden staging name and
/// renamed into place.
#[derive(Debug)]
pub struct ParquetBackend {
    root: PathBuf,
    max_rows: usize,
    max_age: Duration,
    market: SegmentBuffer,
    annotations: SegmentBuffer,
    next_sequence: u64,
}

impl ParquetBackend {
    /// Open the log rooted at `config.path`, continuing the segment sequence of any existing log.
    pub async fn open(config: &PersistenceConfig) -> Result<Self, PersistenceError> {
        let root = config.path.clone();
        let mut next_sequence = 0;

        for partition in Partition::ALL {
            let dir = root.join(partition.to_string());
            tokio::fs::create_dir_all(&dir).await?;

            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str().and_then(SegmentName::parse) {
                    next_sequence = next_sequence.max(name.sequence + 1);
                }
            }
        }

        info!(root = %root.display(), next_sequence, "durable log opened");
        Ok(Self {
            root,
            max_rows: config.segment_max_rows.max(1),
            max_age: config.segment_max_age(),
            market: SegmentBuffer::new(),
            annotations: SegmentBuffer::new(),
            next_sequence,
        })
    }

    fn buffer(&self, partition: Partition) -> &SegmentBuffer {
        match partition {
            Partition::Market => &self.market,
            Partition::Annotations => &self.annotations,
        }
    }

    fn buffer_mut(&mut self, partition: Partition) -> &mut SegmentBuffer {
        match partition {
            Partition::Market => &mut self.market,
            Partition::Annotations => &mut self.annotations,
        }
    }

    /// Write the buffered rows of `partition` as one segment. The buffer is only cleared once the
    /// segment is in place, so a failed or cancelled seal is retried whole.
    async fn seal(&mut self, partition: Partition) -> Result<(), PersistenceError> {
        let buffer = self.buffer(partition);
        let Some(name) = SegmentName::covering(&buffer.rows, self.next_sequence) else {
            return Ok(());
        };
        let rows = buffer.rows.len();
        let bytes = segment::encode(&buffer.rows)?;

        let dir = self.root.join(partition.to_string());
        let path = dir.join(name.file_name());
        let staging = dir.join(format!(".{}.tmp", name.file_name()));

        let mut file = File::create(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&staging, &path).await?;

        self.buffer_mut(partition).clear();
        self.next_sequence += 1;
        debug!(%partition, rows, segment = %path.display(), "durable log segment sealed");
        Ok(())
    }
}

#[async_trait]
impl LogBackend for ParquetBackend {
    async fn append(&mut self, record: &LogRecord) -> Result<(), PersistenceError> {
        let partition = Partition::of(record);
        if self.buffer(partition).rows.len() >= self.max_rows {
            self.seal(partition).await?;
        }
        self.buffer_mut(partition).push(record.clone());
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<(), PersistenceError> {
        self.seal(Partition::Annotations).await?;
        if self.market.is_due(self.max_age) {
            self.seal(Partition::Market).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), PersistenceError> {
        for partition in Partition::ALL {
            self.seal(partition).await?;
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.market.rows.len() + self.annotations.rows.len()
    }

    fn backend_type(&self) -> &'static str {
        "parquet"
    }
}
