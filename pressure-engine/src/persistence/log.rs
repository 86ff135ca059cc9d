//! Read-only view over the segmented durable log.
//!
//! Lookups only open the partition they need and skip segments whose name places them outside
//! the requested time range, so correlation and classification queries never scan market rows.

use super::{
    record::{LogRecord, RecordKind},
    segment::{self, Partition, SegmentName},
};
use crate::{error::QueryError, evaluator::ClassificationEvent};
use fnv::FnvHashMap;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableLog {
    root: PathBuf,
}

impl DurableLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sealed segments of `partition` that may hold rows in `[from, to]`, in write order.
    /// A log that does not exist yet has no segments.
    pub fn segments(&self, partition: Partition, from: f64, to: f64) -> Result<Vec<PathBuf>, QueryError> {
        Ok(self
            .listing(partition)?
            .into_iter()
            .filter(|(name, _)| name.overlaps(from, to))
            .map(|(_, path)| path)
            .collect())
    }

    fn listing(&self, partition: Partition) -> Result<Vec<(SegmentName, PathBuf)>, QueryError> {
        let unavailable = |error: std::io::Error| QueryError::LogUnavailable(error.to_string());

        let entries = match std::fs::read_dir(self.root.join(partition.to_string())) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(unavailable(error)),
        };

        let mut segments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(unavailable)?;
            if let Some(name) = entry.file_name().to_str().and_then(SegmentName::parse) {
                segments.push((name, entry.path()));
            }
        }
        segments.sort_by_key(|(name, _)| *name);
        Ok(segments)
    }

    /// Rows of the given segments. Segments written by a newer schema version, and segments that
    /// fail to decode, are skipped.
    fn read<I>(segments: I) -> Vec<LogRecord>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut rows = Vec::new();
        for path in segments {
            match segment::read_segment(&path) {
                Ok(Some(segment)) => rows.extend(segment),
                Ok(None) => debug!(
                    segment = %path.display(),
                    "skipping durable log segment from newer schema"
                ),
                Err(error) => debug!(
                    segment = %path.display(),
                    %error,
                    "skipping unreadable durable log segment"
                ),
            }
        }
        rows
    }

    /// Every readable row of both partitions, in segment write order.
    pub fn rows(&self) -> Result<Vec<LogRecord>, QueryError> {
        let mut segments = Vec::new();
        for partition in Partition::ALL {
            segments.extend(self.listing(partition)?);
        }
        segments.sort_by_key(|(name, _)| *name);

        Ok(Self::read(segments.into_iter().map(|(_, path)| path)))
    }

    /// Annotation rows for `symbol` with timestamps in `[from, to]`.
    fn annotations(&self, symbol: &str, from: f64, to: f64) -> Result<Vec<LogRecord>, QueryError> {
        let segments = self.segments(Partition::Annotations, from, to)?;
        Ok(Self::read(segments)
            .into_iter()
            .filter(|row| row.symbol == symbol && row.timestamp >= from && row.timestamp <= to)
            .collect())
    }

    /// Per-kind counts of annotation rows (classifications, evaluations, proposals, ghost
    /// executions) for `symbol` in `[from, to]`. Unknown kinds are not counted.
    pub fn annotation_counts(
        &self,
        symbol: &str,
        from: f64,
        to: f64,
    ) -> Result<FnvHashMap<RecordKind, u64>, QueryError> {
        let mut counts = FnvHashMap::default();
        for kind in self
            .annotations(symbol, from, to)?
            .iter()
            .filter_map(LogRecord::kind)
        {
            *counts.entry(kind).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Persisted promotions for `symbol` at or after `since`.
    pub fn classifications(
        &self,
        symbol: &str,
        since: Option<f64>,
    ) -> Result<Vec<ClassificationEvent>, QueryError> {
        self.outcomes(symbol, since, RecordKind::Classification)
    }

    /// Persisted negative evaluations for `symbol` at or after `since`.
    pub fn evaluations(
        &self,
        symbol: &str,
        since: Option<f64>,
    ) -> Result<Vec<ClassificationEvent>, QueryError> {
        self.outcomes(symbol, since, RecordKind::Evaluation)
    }

    fn outcomes(
        &self,
        symbol: &str,
        since: Option<f64>,
        kind: RecordKind,
    ) -> Result<Vec<ClassificationEvent>, QueryError> {
        Ok(self
            .annotations(symbol, since.unwrap_or(f64::NEG_INFINITY), f64::INFINITY)?
            .iter()
            .filter(|row| row.kind() == Some(kind))
            .filter_map(LogRecord::to_classification)
            .collect())
    }
}
