//! Fire-and-forget durable persistence.
//!
//! ```text
//! ingestion paths --enqueue--> broadcast queue (drop-oldest) --> writer task --> LogBackend
//!                                                                                  |
//!                          DurableLog (read-only) <---- sealed Parquet segments <--+
//!                                                       market/ | annotations/
//! ```
//!
//! Ingestion never awaits the writer. Queue overflow, write failures and shutdown discards are
//! logged as data-loss events and never flow back into detection state.

pub mod backend;
pub mod log;
pub mod record;
pub mod segment;
pub mod sink;

pub use backend::{LogBackend, ParquetBackend};
pub use log::DurableLog;
pub use record::{LogRecord, RecordKind, SCHEMA_VERSION};
pub use segment::Partition;
pub use sink::{PersistenceHandle, PersistenceSink, SinkStats};
