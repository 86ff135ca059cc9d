//! Read-only "what happened around T" aggregation for observability collaborators.
//!
//! Counts and sums over the closed `[center - radius, center + radius]` range, applied to the
//! exact timestamp of every source. No ratios, no thresholds, no labels.

use crate::{
    error::QueryError,
    persistence::{DurableLog, RecordKind},
    registry::DetectorRegistry,
};
use serde::Serialize;
use std::sync::Arc;

/// Literal counts around a centre timestamp. Every field is zero when nothing was observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CorrelationWindow {
    pub trade_count: u64,
    pub total_volume: f64,
    pub book_update_count: u64,
    pub liquidation_count: u64,
    pub proposal_count: u64,
    pub ghost_execution_count: u64,
}

#[derive(Debug, Clone)]
pub struct CorrelationService {
    registry: Arc<DetectorRegistry>,
    log: DurableLog,
}

impl CorrelationService {
    pub fn new(registry: Arc<DetectorRegistry>, log: DurableLog) -> Self {
        Self { registry, log }
    }

    /// Aggregate activity for `symbol` within `radius_seconds` of `center`.
    ///
    /// Trades, volume and book updates come from the live detection window, liquidations from
    /// the retention buffer and proposal / ghost execution counts from the annotation partition
    /// of the durable log. Ranges older than the window or retention horizon read as zero.
    pub fn correlate(
        &self,
        symbol: &str,
        center: f64,
        radius_seconds: f64,
    ) -> Result<CorrelationWindow, QueryError> {
        if !center.is_finite() || !radius_seconds.is_finite() || radius_seconds < 0.0 {
            return Err(QueryError::InvalidWindow {
                center,
                radius: radius_seconds,
            });
        }

        let (from, to) = (center - radius_seconds, center + radius_seconds);

        let (symbol, totals, liquidation_count) = {
            let detector = self.registry.detector(symbol)?.read();
            (
                detector.symbol().clone(),
                detector.window_totals(from, to),
                detector.liquidation_count(center, radius_seconds),
            )
        };

        let kinds = self.log.annotation_counts(&symbol, from, to)?;
        let count = |kind| kinds.get(&kind).copied().unwrap_or(0);

        Ok(CorrelationWindow {
            trade_count: totals.trade_count,
            total_volume: totals.total_volume,
            book_update_count: totals.book_update_count,
            liquidation_count: liquidation_count as u64,
            proposal_count: count(RecordKind::Proposal),
            ghost_execution_count: count(RecordKind::GhostExecution),
        })
    }
}
