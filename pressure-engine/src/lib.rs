//! Pressure Engine
//!
//! Per-symbol streaming detection of peak-pressure conditions over trade, order-book and
//! liquidation feeds for a fixed allowlist of ten symbols.
//!
//! The library includes:
//! - Normalisation and allowlist enforcement at the ingestion boundary
//! - One isolated detector per symbol (detection window, baselines, liquidation retention)
//! - The 4-condition promotion evaluator
//! - A fire-and-forget durable log writer and its reader
//! - A read-only correlation and query surface

pub mod baseline;
pub mod config;
pub mod correlation;
pub mod detector;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod ingestion;
pub mod normalizer;
pub mod persistence;
pub mod query;
pub mod registry;
pub mod retention;
pub mod window;

// Re-export commonly used types for convenience
pub use config::{EngineConfig, PersistenceConfig};
pub use correlation::CorrelationWindow;
pub use engine::{PressureEngine, ShutdownReport};
pub use error::{ConfigError, DropReason, EngineError, IngestError, QueryError, SubmitError};
pub use evaluator::{ClassificationEvent, PEAK_PRESSURE};
pub use event::{MarketEvent, Side, Symbol};
pub use normalizer::RawFeedMessage;
pub use query::{QueryRequest, QueryResponse, QueryService};
pub use window::WindowSnapshot;
