//! Rolling per-symbol detection window.
//!
//! Events are folded into fixed-width time buckets (`tick_resolution_seconds`) so the window
//! holds at most `detection_window_seconds / tick_resolution_seconds` buckets. Buckets older
//! than the span are trimmed on every ingest. Totals are re-summed from the buckets on each
//! snapshot, so identical bucket contents always produce identical totals.
//!
//! Each bucket also keeps its events' exact timestamps, so range queries whose bounds fall
//! inside a bucket count only the events actually in range.

use crate::event::{EventKind, MarketEvent, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
enum TickKind {
    Trade { volume: f64 },
    BookUpdate,
    Liquidation,
}

/// Exact time and contribution of one event inside a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tick {
    timestamp: f64,
    kind: TickKind,
}

#[derive(Debug, Clone, PartialEq)]
struct WindowBucket {
    slot: i64,
    trade_count: u64,
    volume: f64,
    book_update_count: u64,
    liquidation_count: u64,
    last_liquidation_at: Option<f64>,
    ticks: Vec<Tick>,
}

impl WindowBucket {
    fn new(slot: i64) -> Self {
        Self {
            slot,
            trade_count: 0,
            volume: 0.0,
            book_update_count: 0,
            liquidation_count: 0,
            last_liquidation_at: None,
            ticks: Vec::new(),
        }
    }

    fn add(&mut self, event: &MarketEvent) {
        let kind = match &event.kind {
            EventKind::Trade(trade) => {
                self.trade_count += 1;
                self.volume += trade.quote_qty;
                TickKind::Trade {
                    volume: trade.quote_qty,
                }
            }
            EventKind::BookUpdate(_) => {
                self.book_update_count += 1;
                TickKind::BookUpdate
            }
            EventKind::Liquidation(_) => {
                self.liquidation_count += 1;
                self.last_liquidation_at = Some(event.timestamp);
                TickKind::Liquidation
            }
        };
        self.ticks.push(Tick {
            timestamp: event.timestamp,
            kind,
        });
    }
}

/// Literal count/sum totals over a span of the detection window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct WindowTotals {
    pub trade_count: u64,
    /// Traded quote volume.
    pub total_volume: f64,
    pub book_update_count: u64,
    pub liquidation_count: u64,
}

impl WindowTotals {
    fn add_bucket(&mut self, bucket: &WindowBucket) {
        self.trade_count += bucket.trade_count;
        self.total_volume += bucket.volume;
        self.book_update_count += bucket.book_update_count;
        self.liquidation_count += bucket.liquidation_count;
    }

    fn add_tick(&mut self, tick: &Tick) {
        match tick.kind {
            TickKind::Trade { volume } => {
                self.trade_count += 1;
                self.total_volume += volume;
            }
            TickKind::BookUpdate => self.book_update_count += 1,
            TickKind::Liquidation => self.liquidation_count += 1,
        }
    }
}

/// Read-only point-in-time copy of a detection window.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WindowSnapshot {
    pub symbol: Symbol,
    /// End of the span covered by this snapshot. `None` until the first event is ingested.
    pub as_of: Option<f64>,
    pub span_seconds: f64,
    pub trade_count: u64,
    pub total_volume: f64,
    pub book_update_count: u64,
    pub liquidation_count: u64,
    /// Timestamp of the most recent liquidation inside the span.
    pub latest_liquidation_at: Option<f64>,
}

/// Fixed-capacity rolling window of bucketed activity for one symbol.
#[derive(Debug, Clone)]
pub struct DetectionWindow {
    symbol: Symbol,
    span_seconds: f64,
    resolution_seconds: f64,
    capacity: usize,
    buckets: VecDeque<WindowBucket>,
    latest: Option<f64>,
}

impl DetectionWindow {
    pub fn new(symbol: Symbol, span_seconds: f64, resolution_seconds: f64) -> Self {
        let capacity = (span_seconds / resolution_seconds).ceil().max(1.0) as usize;
        Self {
            symbol,
            span_seconds,
            resolution_seconds,
            capacity,
            buckets: VecDeque::with_capacity(capacity),
            latest: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.latest
    }

    fn slot_of(&self, timestamp: f64) -> i64 {
        (timestamp / self.resolution_seconds).floor() as i64
    }

    fn bucket_start(&self, bucket: &WindowBucket) -> f64 {
        bucket.slot as f64 * self.resolution_seconds
    }

    /// Fold an event into the window. Callers guarantee non-decreasing timestamps.
    pub fn push(&mut self, event: &MarketEvent) {
        let slot = self.slot_of(event.timestamp);

        if let Some(bucket) = self.buckets.back_mut().filter(|bucket| bucket.slot >= slot) {
            bucket.add(event);
        } else {
            let mut bucket = WindowBucket::new(slot);
            bucket.add(event);
            self.buckets.push_back(bucket);
        }

        self.latest = Some(self.latest.map_or(event.timestamp, |latest| latest.max(event.timestamp)));
        self.trim();
    }

    fn trim(&mut self) {
        let Some(latest) = self.latest else {
            return;
        };
        let cutoff = latest - self.span_seconds;

        while let Some(front) = self.buckets.front() {
            if self.bucket_start(front) + self.resolution_seconds <= cutoff || self.buckets.len() > self.capacity {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Snapshot of the trailing span ending at the close of the most recent bucket.
    pub fn snapshot(&self) -> WindowSnapshot {
        match self.buckets.back() {
            Some(bucket) => self.snapshot_at(self.bucket_start(bucket) + self.resolution_seconds),
            None => self.snapshot_at_inner(None),
        }
    }

    /// Snapshot of buckets starting within `[now - span, now)`.
    pub fn snapshot_at(&self, now: f64) -> WindowSnapshot {
        self.snapshot_at_inner(Some(now))
    }

    fn snapshot_at_inner(&self, now: Option<f64>) -> WindowSnapshot {
        let mut snapshot = WindowSnapshot {
            symbol: self.symbol.clone(),
            as_of: now.filter(|_| self.latest.is_some()),
            span_seconds: self.span_seconds,
            trade_count: 0,
            total_volume: 0.0,
            book_update_count: 0,
            liquidation_count: 0,
            latest_liquidation_at: None,
        };
        let Some(now) = snapshot.as_of else {
            return snapshot;
        };

        for bucket in self.buckets_between(now - self.span_seconds, now) {
            snapshot.trade_count += bucket.trade_count;
            snapshot.total_volume += bucket.volume;
            snapshot.book_update_count += bucket.book_update_count;
            snapshot.liquidation_count += bucket.liquidation_count;
            if bucket.last_liquidation_at.is_some() {
                snapshot.latest_liquidation_at = bucket.last_liquidation_at;
            }
        }

        snapshot
    }

    /// Totals of events with timestamps in the closed range `[from, to]`.
    ///
    /// Buckets entirely inside the range contribute their running totals; buckets straddling
    /// either bound are filtered event by event.
    pub fn totals_between(&self, from: f64, to: f64) -> WindowTotals {
        let mut totals = WindowTotals::default();

        for bucket in &self.buckets {
            let start = self.bucket_start(bucket);
            let end = start + self.resolution_seconds;
            if end <= from || start > to {
                continue;
            }

            if start >= from && end <= to {
                totals.add_bucket(bucket);
            } else {
                bucket
                    .ticks
                    .iter()
                    .filter(|tick| tick.timestamp >= from && tick.timestamp <= to)
                    .for_each(|tick| totals.add_tick(tick));
            }
        }

        totals
    }

    fn buckets_between(&self, from: f64, to: f64) -> impl Iterator<Item = &WindowBucket> {
        self.buckets.iter().filter(move |bucket| {
            let start = self.bucket_start(bucket);
            start >= from && start < to
        })
    }
}
