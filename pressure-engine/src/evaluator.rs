//! Four-condition structural check classifying an instant as peak pressure.
//!
//! Evaluation is a pure function of `(window, baselines, now)`: no clock reads, no randomness.
//! All four configured conditions must hold for promotion; there is no partial credit.

use crate::{
    baseline::{Baseline, Baselines},
    event::Symbol,
    window::WindowSnapshot,
};
use serde::{Deserialize, Serialize};

/// Label attached to promoted [`ClassificationEvent`]s.
pub const PEAK_PRESSURE: &str = "PEAK_PRESSURE";

/// Baseline threshold a metric is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Percentile {
    P90,
    P95,
}

impl Percentile {
    fn threshold(&self, baseline: &Baseline) -> Option<f64> {
        match self {
            Percentile::P90 => baseline.p90,
            Percentile::P95 => baseline.p95,
        }
    }
}

/// One structural condition of the promotion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    TradeCountAbove(Percentile),
    VolumeAbove(Percentile),
    BookUpdatesAbove(Percentile),
    /// A liquidation occurred no further than the correlation span from the evaluation instant.
    LiquidationWithinSpan,
}

/// Outcome of each configured condition, in configuration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConditionsMet(pub [bool; 4]);

impl ConditionsMet {
    pub fn all(&self) -> bool {
        self.0.iter().all(|met| *met)
    }

    pub fn count(&self) -> usize {
        self.0.iter().filter(|met| **met).count()
    }
}

/// Immutable result of one evaluation cycle.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClassificationEvent {
    pub symbol: Symbol,
    pub timestamp: f64,
    pub promoted: bool,
    pub conditions_met: ConditionsMet,
}

impl ClassificationEvent {
    pub fn label(&self) -> Option<&'static str> {
        self.promoted.then_some(PEAK_PRESSURE)
    }
}

/// Applies the configured 4-condition rule.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionEvaluator {
    conditions: [Condition; 4],
    correlation_span_seconds: f64,
}

impl PromotionEvaluator {
    pub fn new(conditions: [Condition; 4], correlation_span_seconds: f64) -> Self {
        Self {
            conditions,
            correlation_span_seconds,
        }
    }

    /// Classify the instant `now`.
    ///
    /// Returns `None` (no classification, not a negative one) while any baseline is warming up
    /// or the window has not yet observed an event.
    pub fn evaluate(
        &self,
        window: &WindowSnapshot,
        baselines: &Baselines,
        now: f64,
    ) -> Option<ClassificationEvent> {
        if !baselines.ready() || window.as_of.is_none() {
            return None;
        }

        let mut met = [false; 4];
        for (slot, condition) in met.iter_mut().zip(self.conditions.iter()) {
            *slot = self.check(condition, window, baselines, now)?;
        }
        let conditions_met = ConditionsMet(met);

        Some(ClassificationEvent {
            symbol: window.symbol.clone(),
            timestamp: now,
            promoted: conditions_met.all(),
            conditions_met,
        })
    }

    fn check(
        &self,
        condition: &Condition,
        window: &WindowSnapshot,
        baselines: &Baselines,
        now: f64,
    ) -> Option<bool> {
        let exceeds = |value: f64, baseline: &Baseline, percentile: &Percentile| {
            percentile.threshold(baseline).map(|threshold| value > threshold)
        };

        match condition {
            Condition::TradeCountAbove(percentile) => {
                exceeds(window.trade_count as f64, &baselines.trade_count, percentile)
            }
            Condition::VolumeAbove(percentile) => {
                exceeds(window.total_volume, &baselines.volume, percentile)
            }
            Condition::BookUpdatesAbove(percentile) => {
                exceeds(window.book_update_count as f64, &baselines.book_updates, percentile)
            }
            Condition::LiquidationWithinSpan => Some(
                window
                    .latest_liquidation_at
                    .is_some_and(|at| (now - at).abs() <= self.correlation_span_seconds),
            ),
        }
    }
}
