//! Versioned row format of the durable log.
//!
//! Every row carries the same flat columns; variant-specific columns are null when unset.
//! Readers ignore unknown columns and unknown `event_kind`s, so columns may only be added within
//! a schema version. Removing or retyping a column requires bumping [`SCHEMA_VERSION`].

use crate::{
    evaluator::{ClassificationEvent, ConditionsMet, PEAK_PRESSURE},
    event::{EventKind, MarketEvent, Side, Symbol},
};
use chrono::{DateTime, Utc};
use derive_more::Display;

pub const SCHEMA_VERSION: u32 = 1;

/// Kinds of row understood by this schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RecordKind {
    #[display("trade")]
    Trade,
    #[display("book_update")]
    BookUpdate,
    #[display("liquidation")]
    Liquidation,
    /// Promoted interval, labelled [`PEAK_PRESSURE`].
    #[display("classification")]
    Classification,
    /// Interval evaluated with at least one promotion condition unmet. Audit only.
    #[display("evaluation")]
    Evaluation,
    /// Trade proposal raised by a governance collaborator.
    #[display("proposal")]
    Proposal,
    /// Simulated execution recorded by a governance collaborator.
    #[display("ghost_execution")]
    GhostExecution,
}

impl RecordKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "trade" => Some(RecordKind::Trade),
            "book_update" => Some(RecordKind::BookUpdate),
            "liquidation" => Some(RecordKind::Liquidation),
            "classification" => Some(RecordKind::Classification),
            "evaluation" => Some(RecordKind::Evaluation),
            "proposal" => Some(RecordKind::Proposal),
            "ghost_execution" => Some(RecordKind::GhostExecution),
            _ => None,
        }
    }

    /// Raw feed events, as opposed to rows annotating them.
    pub fn is_market(&self) -> bool {
        matches!(
            self,
            RecordKind::Trade | RecordKind::BookUpdate | RecordKind::Liquidation
        )
    }
}

/// Classification columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationColumns {
    pub promoted: bool,
    pub conditions_met: [bool; 4],
    pub label: Option<String>,
}

/// One row of the append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub schema_version: u32,
    pub event_kind: String,
    pub symbol: Symbol,
    /// Event time, seconds since epoch.
    pub timestamp: f64,
    /// Wall-clock time the record was enqueued.
    pub recorded_at: DateTime<Utc>,
    pub price: Option<f64>,
    pub base_qty: Option<f64>,
    pub quote_qty: Option<f64>,
    pub side: Option<Side>,
    pub bid_levels_changed: Option<u32>,
    pub ask_levels_changed: Option<u32>,
    pub classification: Option<ClassificationColumns>,
    /// Free-form collaborator reference (eg/ proposal id).
    pub reference: Option<String>,
}

impl LogRecord {
    fn empty(kind: RecordKind, symbol: Symbol, timestamp: f64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_kind: kind.to_string(),
            symbol,
            timestamp,
            recorded_at: Utc::now(),
            price: None,
            base_qty: None,
            quote_qty: None,
            side: None,
            bid_levels_changed: None,
            ask_levels_changed: None,
            classification: None,
            reference: None,
        }
    }

    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::parse(&self.event_kind)
    }

    pub fn proposal(symbol: Symbol, timestamp: f64, reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            ..Self::empty(RecordKind::Proposal, symbol, timestamp)
        }
    }

    pub fn ghost_execution(symbol: Symbol, timestamp: f64, reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            ..Self::empty(RecordKind::GhostExecution, symbol, timestamp)
        }
    }

    /// Rebuild the [`ClassificationEvent`] stored in a classification or evaluation row.
    pub fn to_classification(&self) -> Option<ClassificationEvent> {
        if !matches!(
            self.kind(),
            Some(RecordKind::Classification | RecordKind::Evaluation)
        ) {
            return None;
        }
        let columns = self.classification.as_ref()?;
        Some(ClassificationEvent {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            promoted: columns.promoted,
            conditions_met: ConditionsMet(columns.conditions_met),
        })
    }
}

impl From<&MarketEvent> for LogRecord {
    fn from(event: &MarketEvent) -> Self {
        match &event.kind {
            EventKind::Trade(trade) => Self {
                price: Some(trade.price),
                base_qty: Some(trade.base_qty),
                quote_qty: Some(trade.quote_qty),
                side: Some(trade.side),
                ..Self::empty(RecordKind::Trade, event.symbol.clone(), event.timestamp)
            },
            EventKind::BookUpdate(update) => Self {
                bid_levels_changed: Some(update.bid_levels_changed),
                ask_levels_changed: Some(update.ask_levels_changed),
                ..Self::empty(RecordKind::BookUpdate, event.symbol.clone(), event.timestamp)
            },
            EventKind::Liquidation(liquidation) => Self {
                price: Some(liquidation.price),
                base_qty: Some(liquidation.quantity),
                side: Some(liquidation.side),
                ..Self::empty(RecordKind::Liquidation, event.symbol.clone(), event.timestamp)
            },
        }
    }
}

/// Promotions become `classification` rows; negative outcomes become `evaluation` rows.
impl From<&ClassificationEvent> for LogRecord {
    fn from(classification: &ClassificationEvent) -> Self {
        let kind = if classification.promoted {
            RecordKind::Classification
        } else {
            RecordKind::Evaluation
        };

        Self {
            classification: Some(ClassificationColumns {
                promoted: classification.promoted,
                conditions_met: classification.conditions_met.0,
                label: classification.promoted.then(|| PEAK_PRESSURE.to_string()),
            }),
            ..Self::empty(kind, classification.symbol.clone(), classification.timestamp)
        }
    }
}
