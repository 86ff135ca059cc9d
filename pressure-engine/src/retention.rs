//! Age-bounded store of raw liquidation events.
//!
//! Independent of the detection window: its eviction is driven purely by
//! `retention_window_seconds` relative to the latest timestamp observed for the symbol, never
//! by wall-clock time, so replaying the same feed always yields the same contents.

use crate::event::{MarketEvent, Symbol};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RetentionBuffer {
    symbol: Symbol,
    retention_seconds: f64,
    events: VecDeque<MarketEvent>,
    latest: Option<f64>,
}

impl RetentionBuffer {
    pub fn new(symbol: Symbol, retention_seconds: f64) -> Self {
        Self {
            symbol,
            retention_seconds,
            events: VecDeque::new(),
            latest: None,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Store a liquidation. Events of any other kind or symbol are ignored and `false` returned.
    pub fn record(&mut self, liquidation: &MarketEvent) -> bool {
        if !liquidation.is_liquidation() || liquidation.symbol != self.symbol {
            return false;
        }
        self.advance_to(liquidation.timestamp);
        self.events.push_back(liquidation.clone());
        true
    }

    /// Move the retention clock forward and evict expired liquidations.
    pub fn advance_to(&mut self, timestamp: f64) {
        let latest = self.latest.map_or(timestamp, |latest| latest.max(timestamp));
        self.latest = Some(latest);

        let cutoff = latest - self.retention_seconds;
        while self.events.front().is_some_and(|event| event.timestamp < cutoff) {
            self.events.pop_front();
        }
    }

    fn is_retained(&self, event: &MarketEvent) -> bool {
        self.latest
            .is_some_and(|latest| event.timestamp >= latest - self.retention_seconds)
    }

    /// Raw liquidations within `radius_seconds` of `center`.
    ///
    /// Read-only: entries past the retention age are treated as evicted without being removed.
    pub fn query(&self, center: f64, radius_seconds: f64) -> Vec<MarketEvent> {
        self.matching(center, radius_seconds).cloned().collect()
    }

    pub fn count(&self, center: f64, radius_seconds: f64) -> usize {
        self.matching(center, radius_seconds).count()
    }

    /// Same closed `[center - radius, center + radius]` bounds as detection window range totals.
    fn matching(&self, center: f64, radius_seconds: f64) -> impl Iterator<Item = &MarketEvent> {
        let (from, to) = (center - radius_seconds, center + radius_seconds);
        self.events.iter().filter(move |event| {
            self.is_retained(event) && event.timestamp >= from && event.timestamp <= to
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Side;

    fn liquidation(timestamp: f64) -> MarketEvent {
        MarketEvent::liquidation(timestamp, "BTCUSDT", 100.0, 1.0, Side::Sell)
    }

    #[test]
    fn test_record_rejects_non_liquidations() {
        let mut buffer = RetentionBuffer::new(Symbol::new("BTCUSDT"), 60.0);
        assert!(!buffer.record(&MarketEvent::trade(1.0, "BTCUSDT", 1.0, 1.0, Side::Buy)));
        assert!(!buffer.record(&MarketEvent::liquidation(1.0, "ETHUSDT", 1.0, 1.0, Side::Buy)));
        assert!(buffer.record(&liquidation(1.0)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_eviction_relative_to_latest_timestamp() {
        let mut buffer = RetentionBuffer::new(Symbol::new("BTCUSDT"), 60.0);
        buffer.record(&liquidation(100.0));
        buffer.record(&liquidation(130.0));

        buffer.advance_to(159.0);
        assert_eq!(buffer.len(), 2);

        buffer.advance_to(161.0);
        assert_eq!(buffer.len(), 1);

        // clock never moves backwards
        buffer.advance_to(50.0);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_query() {
        struct TestCase {
            input: (f64, f64),
            expected: usize,
        }

        let mut buffer = RetentionBuffer::new(Symbol::new("BTCUSDT"), 60.0);
        for timestamp in [100.0, 110.0, 125.0, 140.0] {
            buffer.record(&liquidation(timestamp));
        }

        let tests = vec![
            TestCase {
                // TC0: everything within radius
                input: (120.0, 30.0),
                expected: 4,
            },
            TestCase {
                // TC1: inclusive bounds
                input: (110.0, 15.0),
                expected: 3,
            },
            TestCase {
                // TC2: nothing nearby
                input: (500.0, 10.0),
                expected: 0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let (center, radius) = test.input;
            assert_eq!(buffer.count(center, radius), test.expected, "TC{} failed", index);
            assert_eq!(buffer.query(center, radius).len(), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_query_returns_raw_events() {
        let mut buffer = RetentionBuffer::new(Symbol::new("BTCUSDT"), 60.0);
        let event = liquidation(100.0);
        buffer.record(&event);
        assert_eq!(buffer.query(100.0, 0.0), vec![event]);
    }
}
