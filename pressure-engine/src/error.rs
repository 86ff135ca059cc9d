use crate::event::Symbol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason a feed event was discarded before reaching detector state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum DropReason {
    #[error("symbol not allowlisted: {0}")]
    SymbolNotAllowlisted(Symbol),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("out-of-order timestamp: received {received} after {last}")]
    OutOfOrderTimestamp { last: f64, received: f64 },

    #[error("ingestion path for {0} is full")]
    PathFull(Symbol),
}

impl DropReason {
    pub fn label(&self) -> &'static str {
        match self {
            DropReason::SymbolNotAllowlisted(_) => "symbol_not_allowlisted",
            DropReason::MalformedPayload(_) => "malformed_payload",
            DropReason::OutOfOrderTimestamp { .. } => "out_of_order_timestamp",
            DropReason::PathFull(_) => "path_full",
        }
    }
}

/// Attempted mutation of one symbol's detector with another symbol's event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Error)]
#[error("isolation violation: detector {detector} received event for {event}")]
pub struct IsolationViolation {
    pub detector: Symbol,
    pub event: Symbol,
}

/// All errors generated while ingesting an event into a [`SymbolDetector`](crate::detector::SymbolDetector).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("event dropped: {0}")]
    Dropped(#[from] DropReason),

    #[error(transparent)]
    Isolation(#[from] IsolationViolation),
}

impl IngestError {
    /// Determine if an error must halt the ingestion path that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Isolation(_))
    }
}

/// Event could not be handed to its ingestion path.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Dropped(#[from] DropReason),

    #[error("ingestion path for {0} has halted")]
    PathHalted(Symbol),
}

/// Failure writing to, or reading from, the durable log. Never leaves the persistence layer
/// towards ingestion.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("unreadable segment: {0}")]
    Segment(String),

    #[error("write timed out after {0} ms")]
    Timeout(u64),
}

/// Startup configuration rejected. Always process-fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("symbol allowlist must contain exactly {expected} symbols, found {found}")]
    AllowlistSize { expected: usize, found: usize },

    #[error("symbol allowlist contains duplicate or empty symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("invalid window configuration: {0}")]
    InvalidWindow(String),

    #[error("invalid percentile target {name}: {value}")]
    InvalidPercentile { name: &'static str, value: String },

    #[error("baseline capacity {capacity} is below warm-up minimum {warmup}")]
    InvalidBaselineCapacity { capacity: usize, warmup: usize },

    #[error("invalid persistence configuration: {0}")]
    InvalidPersistence(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Engine failed to start.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("durable log unavailable: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Errors returned by the read-only query surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("invalid query window: center {center}, radius {radius}")]
    InvalidWindow { center: f64, radius: f64 },

    #[error("durable log unavailable: {0}")]
    LogUnavailable(String),
}
