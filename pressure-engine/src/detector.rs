//! Per-symbol detector state.
//!
//! A [`SymbolDetector`] exclusively owns its detection window, baselines and retention buffer.
//! Every ingest verifies the event belongs to the detector's symbol; a mismatch is an
//! [`IsolationViolation`] and leaves the detector untouched.
//!
//! Sampling is driven by event time: when the first event of a new sample interval arrives,
//! the previous interval is closed by evaluating the window as of the interval boundary
//! against the current baselines, then feeding that window into the baselines.

use crate::{
    baseline::{BaselineSet, Baselines},
    config::EngineConfig,
    error::{DropReason, IngestError, IsolationViolation},
    evaluator::{ClassificationEvent, PromotionEvaluator},
    event::{MarketEvent, Symbol},
    retention::RetentionBuffer,
    window::{DetectionWindow, WindowSnapshot, WindowTotals},
};

#[derive(Debug, Clone)]
pub struct SymbolDetector {
    symbol: Symbol,
    window: DetectionWindow,
    baselines: BaselineSet,
    retention: RetentionBuffer,
    evaluator: PromotionEvaluator,
    sample_interval_seconds: f64,
    open_interval: Option<i64>,
    last_event_at: Option<f64>,
    last_classification_at: Option<f64>,
}

impl SymbolDetector {
    pub fn new(symbol: Symbol, config: &EngineConfig) -> Self {
        Self {
            window: DetectionWindow::new(
                symbol.clone(),
                config.detection_window_seconds,
                config.tick_resolution_seconds,
            ),
            baselines: BaselineSet::new(
                config.baseline_max_samples,
                config.warmup_min_samples,
                config.percentile_targets,
            ),
            retention: RetentionBuffer::new(symbol.clone(), config.retention_window_seconds),
            evaluator: PromotionEvaluator::new(
                config.promotion_conditions,
                config.correlation_span_seconds,
            ),
            sample_interval_seconds: config.sample_interval_seconds,
            open_interval: None,
            last_event_at: None,
            last_classification_at: None,
            symbol,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn last_classification_at(&self) -> Option<f64> {
        self.last_classification_at
    }

    fn interval_of(&self, timestamp: f64) -> i64 {
        (timestamp / self.sample_interval_seconds).floor() as i64
    }

    /// Ingest the next event for this symbol, returning the classification of any sample
    /// interval the event closed.
    pub fn ingest(&mut self, event: &MarketEvent) -> Result<Option<ClassificationEvent>, IngestError> {
        if event.symbol != self.symbol {
            return Err(IsolationViolation {
                detector: self.symbol.clone(),
                event: event.symbol.clone(),
            }
            .into());
        }

        if let Some(last) = self.last_event_at.filter(|last| event.timestamp < *last) {
            return Err(DropReason::OutOfOrderTimestamp {
                last,
                received: event.timestamp,
            }
            .into());
        }

        let interval = self.interval_of(event.timestamp);
        let classification = match self.open_interval {
            Some(open) if interval > open => self.close_interval(open),
            _ => None,
        };
        self.open_interval = Some(interval);
        self.last_event_at = Some(event.timestamp);

        self.window.push(event);
        self.retention.advance_to(event.timestamp);
        if event.is_liquidation() {
            self.retention.record(event);
        }

        Ok(classification)
    }

    fn close_interval(&mut self, interval: i64) -> Option<ClassificationEvent> {
        let boundary = (interval + 1) as f64 * self.sample_interval_seconds;
        let classification = self.evaluate_at(boundary);

        let closed = self.window.snapshot_at(boundary);
        self.baselines.observe(interval, &closed);

        classification
    }

    /// Evaluate the window as of `now` against the current baselines.
    ///
    /// At most one classification is produced per timestamp key: re-evaluating an instant at or
    /// before the last classified instant yields `None`.
    pub fn evaluate_at(&mut self, now: f64) -> Option<ClassificationEvent> {
        if self.last_classification_at.is_some_and(|last| now <= last) {
            return None;
        }

        let window = self.window.snapshot_at(now);
        let classification = self.evaluator.evaluate(&window, &self.baselines.current(), now)?;
        self.last_classification_at = Some(now);
        Some(classification)
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        self.window.snapshot()
    }

    pub fn baselines(&self) -> Baselines {
        self.baselines.current()
    }

    pub fn window_totals(&self, from: f64, to: f64) -> WindowTotals {
        self.window.totals_between(from, to)
    }

    pub fn liquidations(&self, center: f64, radius_seconds: f64) -> Vec<MarketEvent> {
        self.retention.query(center, radius_seconds)
    }

    pub fn liquidation_count(&self, center: f64, radius_seconds: f64) -> usize {
        self.retention.count(center, radius_seconds)
    }
}
