//! Columnar segment files of the durable log.
//!
//! ```text
//! <root>/market/<sequence>_<first_ms>_<last_ms>.parquet        trades, book updates, liquidations
//! <root>/annotations/<sequence>_<first_ms>_<last_ms>.parquet   classifications, evaluations,
//!                                                              proposals, ghost executions
//! ```
//!
//! A segment is sealed once and never rewritten. Its file name carries the write sequence and
//! the millisecond bounds of the rows inside, so readers skip segments outside a query range
//! without opening them. The schema version lives in the Parquet key-value metadata under
//! [`SCHEMA_VERSION_KEY`].

use super::record::{ClassificationColumns, LogRecord, SCHEMA_VERSION};
use crate::{
    error::PersistenceError,
    event::{Side, Symbol},
};
use arrow::{
    array::{
        Array, ArrayRef, BooleanArray, Float64Array, StringArray, TimestampMicrosecondArray,
        UInt8Array, UInt32Array,
    },
    datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::DateTime;
use derive_more::Display;
use itertools::Itertools;
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Compression,
    file::{metadata::KeyValue, properties::WriterProperties},
};
use std::{fs::File, path::Path, sync::Arc};

pub const SCHEMA_VERSION_KEY: &str = "pressure.schema_version";

const EXTENSION: &str = ".parquet";

/// Directory a row is written to. High-volume market rows are kept apart from the annotation rows
/// queried by correlation and classification lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Partition {
    #[display("market")]
    Market,
    #[display("annotations")]
    Annotations,
}

impl Partition {
    pub const ALL: [Partition; 2] = [Partition::Market, Partition::Annotations];

    /// Unknown kinds are annotations.
    pub fn of(record: &LogRecord) -> Self {
        match record.kind() {
            Some(kind) if kind.is_market() => Partition::Market,
            _ => Partition::Annotations,
        }
    }
}

/// Parsed segment file name. Orders by write sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SegmentName {
    pub sequence: u64,
    pub first_ms: i64,
    pub last_ms: i64,
}

impl SegmentName {
    /// Name of a segment holding `rows`, or `None` if there is nothing to seal.
    pub fn covering(rows: &[LogRecord], sequence: u64) -> Option<Self> {
        if rows.is_empty() {
            return None;
        }

        let (first_ms, last_ms) = rows
            .iter()
            .map(|row| row.timestamp)
            .filter(|timestamp| timestamp.is_finite())
            .minmax_by(f64::total_cmp)
            .into_option()
            .map_or((0, 0), |(first, last)| {
                ((first * 1_000.0).floor() as i64, (last * 1_000.0).ceil() as i64)
            });

        Some(Self {
            sequence,
            first_ms,
            last_ms,
        })
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let mut parts = file_name.strip_suffix(EXTENSION)?.splitn(3, '_');
        Some(Self {
            sequence: parts.next()?.parse().ok()?,
            first_ms: parts.next()?.parse().ok()?,
            last_ms: parts.next()?.parse().ok()?,
        })
    }

    pub fn file_name(&self) -> String {
        format!(
            "{:010}_{}_{}{EXTENSION}",
            self.sequence, self.first_ms, self.last_ms
        )
    }

    /// Whether any row of the segment may lie in `[from, to]` seconds.
    pub fn overlaps(&self, from: f64, to: f64) -> bool {
        self.last_ms as f64 >= from * 1_000.0 && self.first_ms as f64 <= to * 1_000.0
    }
}

pub fn log_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("event_kind", DataType::Utf8, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("timestamp", DataType::Float64, false),
        Field::new(
            "recorded_at",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("price", DataType::Float64, true),
        Field::new("base_qty", DataType::Float64, true),
        Field::new("quote_qty", DataType::Float64, true),
        Field::new("side", DataType::Utf8, true),
        Field::new("bid_levels_changed", DataType::UInt32, true),
        Field::new("ask_levels_changed", DataType::UInt32, true),
        Field::new("promoted", DataType::Boolean, true),
        Field::new("conditions_met", DataType::UInt8, true),
        Field::new("label", DataType::Utf8, true),
        Field::new("reference", DataType::Utf8, true),
    ]))
}

/// Encode `rows` as a single-row-group Parquet file.
pub fn encode(rows: &[LogRecord]) -> Result<Vec<u8>, PersistenceError> {
    write_batch(&record_batch(rows)?, SCHEMA_VERSION)
}

fn write_batch(batch: &RecordBatch, schema_version: u32) -> Result<Vec<u8>, PersistenceError> {
    let properties = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![KeyValue::new(
            SCHEMA_VERSION_KEY.to_string(),
            schema_version.to_string(),
        )]))
        .build();

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(properties))?;
    writer.write(batch)?;
    Ok(writer.into_inner()?)
}

fn record_batch(rows: &[LogRecord]) -> Result<RecordBatch, PersistenceError> {
    let event_kind = Arc::new(StringArray::from(
        rows.iter()
            .map(|row| row.event_kind.as_str())
            .collect::<Vec<_>>(),
    )) as ArrayRef;
    let symbol = Arc::new(StringArray::from(
        rows.iter().map(|row| row.symbol.as_str()).collect::<Vec<_>>(),
    )) as ArrayRef;
    let timestamp = Arc::new(Float64Array::from(
        rows.iter().map(|row| row.timestamp).collect::<Vec<_>>(),
    )) as ArrayRef;
    let recorded_at = Arc::new(
        TimestampMicrosecondArray::from(
            rows.iter()
                .map(|row| row.recorded_at.timestamp_micros())
                .collect::<Vec<_>>(),
        )
        .with_timezone("UTC"),
    ) as ArrayRef;
    let price = Arc::new(Float64Array::from(
        rows.iter().map(|row| row.price).collect::<Vec<_>>(),
    )) as ArrayRef;
    let base_qty = Arc::new(Float64Array::from(
        rows.iter().map(|row| row.base_qty).collect::<Vec<_>>(),
    )) as ArrayRef;
    let quote_qty = Arc::new(Float64Array::from(
        rows.iter().map(|row| row.quote_qty).collect::<Vec<_>>(),
    )) as ArrayRef;
    let side = Arc::new(StringArray::from(
        rows.iter()
            .map(|row| row.side.as_ref().map(Side::as_str))
            .collect::<Vec<_>>(),
    )) as ArrayRef;
    let bid_levels_changed = Arc::new(UInt32Array::from(
        rows.iter()
            .map(|row| row.bid_levels_changed)
            .collect::<Vec<_>>(),
    )) as ArrayRef;
    let ask_levels_changed = Arc::new(UInt32Array::from(
        rows.iter()
            .map(|row| row.ask_levels_changed)
            .collect::<Vec<_>>(),
    )) as ArrayRef;
    let promoted = Arc::new(BooleanArray::from(
        rows.iter()
            .map(|row| row.classification.as_ref().map(|columns| columns.promoted))
            .collect::<Vec<_>>(),
    )) as ArrayRef;
    let conditions_met = Arc::new(UInt8Array::from(
        rows.iter()
            .map(|row| {
                row.classification
                    .as_ref()
                    .map(|columns| conditions_mask(&columns.conditions_met))
            })
            .collect::<Vec<_>>(),
    )) as ArrayRef;
    let label = Arc::new(StringArray::from(
        rows.iter()
            .map(|row| {
                row.classification
                    .as_ref()
                    .and_then(|columns| columns.label.as_deref())
            })
            .collect::<Vec<_>>(),
    )) as ArrayRef;
    let reference = Arc::new(StringArray::from(
        rows.iter()
            .map(|row| row.reference.as_deref())
            .collect::<Vec<_>>(),
    )) as ArrayRef;

    let arrays = vec![
        event_kind,
        symbol,
        timestamp,
        recorded_at,
        price,
        base_qty,
        quote_qty,
        side,
        bid_levels_changed,
        ask_levels_changed,
        promoted,
        conditions_met,
        label,
        reference,
    ];
    Ok(RecordBatch::try_new(log_schema(), arrays)?)
}

/// Read every row of a sealed segment. `Ok(None)` if the segment was written by a newer schema
/// version than this reader understands.
pub fn read_segment(path: &Path) -> Result<Option<Vec<LogRecord>>, PersistenceError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;

    let schema_version = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|metadata| metadata.iter().find(|entry| entry.key == SCHEMA_VERSION_KEY))
        .and_then(|entry| entry.value.as_deref())
        .and_then(|value| value.parse::<u32>().ok())
        .ok_or_else(|| PersistenceError::Segment(format!("missing {SCHEMA_VERSION_KEY}")))?;
    if schema_version > SCHEMA_VERSION {
        return Ok(None);
    }

    let mut rows = Vec::new();
    for batch in builder.build()? {
        rows.extend(decode_batch(&batch?, schema_version)?);
    }
    Ok(Some(rows))
}

/// Columns are looked up by name: unknown columns are ignored and absent optional columns read
/// as null.
fn decode_batch(batch: &RecordBatch, schema_version: u32) -> Result<Vec<LogRecord>, PersistenceError> {
    let event_kind = required::<StringArray>(batch, "event_kind")?;
    let symbol = required::<StringArray>(batch, "symbol")?;
    let timestamp = required::<Float64Array>(batch, "timestamp")?;
    let recorded_at = required::<TimestampMicrosecondArray>(batch, "recorded_at")?;
    let price = optional::<Float64Array>(batch, "price");
    let base_qty = optional::<Float64Array>(batch, "base_qty");
    let quote_qty = optional::<Float64Array>(batch, "quote_qty");
    let side = optional::<StringArray>(batch, "side");
    let bid_levels_changed = optional::<UInt32Array>(batch, "bid_levels_changed");
    let ask_levels_changed = optional::<UInt32Array>(batch, "ask_levels_changed");
    let promoted = optional::<BooleanArray>(batch, "promoted");
    let conditions_met = optional::<UInt8Array>(batch, "conditions_met");
    let label = optional::<StringArray>(batch, "label");
    let reference = optional::<StringArray>(batch, "reference");

    (0..batch.num_rows())
        .map(|row| {
            let float = |column: Option<&Float64Array>| {
                column
                    .filter(|column| column.is_valid(row))
                    .map(|column| column.value(row))
            };
            let levels = |column: Option<&UInt32Array>| {
                column
                    .filter(|column| column.is_valid(row))
                    .map(|column| column.value(row))
            };
            let string = |column: Option<&StringArray>| {
                column
                    .filter(|column| column.is_valid(row))
                    .map(|column| column.value(row).to_string())
            };

            let classification = promoted
                .filter(|promoted| promoted.is_valid(row))
                .map(|promoted| ClassificationColumns {
                    promoted: promoted.value(row),
                    conditions_met: conditions_from_mask(
                        conditions_met
                            .filter(|conditions| conditions.is_valid(row))
                            .map_or(0, |conditions| conditions.value(row)),
                    ),
                    label: string(label),
                });

            let recorded_at = DateTime::from_timestamp_micros(recorded_at.value(row))
                .ok_or_else(|| PersistenceError::Segment(format!("recorded_at out of range at row {row}")))?;

            Ok(LogRecord {
                schema_version,
                event_kind: event_kind.value(row).to_string(),
                symbol: Symbol::new(symbol.value(row)),
                timestamp: timestamp.value(row),
                recorded_at,
                price: float(price),
                base_qty: float(base_qty),
                quote_qty: float(quote_qty),
                side: string(side).and_then(|side| side.parse().ok()),
                bid_levels_changed: levels(bid_levels_changed),
                ask_levels_changed: levels(ask_levels_changed),
                classification,
                reference: string(reference),
            })
        })
        .collect()
}

fn optional<'a, A: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Option<&'a A> {
    batch.column_by_name(name)?.as_any().downcast_ref::<A>()
}

fn required<'a, A: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a A, PersistenceError> {
    optional(batch, name)
        .ok_or_else(|| PersistenceError::Segment(format!("missing or mistyped column {name}")))
}

fn conditions_mask(conditions: &[bool; 4]) -> u8 {
    conditions
        .iter()
        .enumerate()
        .filter(|(_, met)| **met)
        .fold(0, |mask, (index, _)| mask | 1 << index)
}

fn conditions_from_mask(mask: u8) -> [bool; 4] {
    std::array::from_fn(|index| mask & (1 << index) != 0)
}
