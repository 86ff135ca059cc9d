//! Ingestion-boundary filter converting raw feed payloads into [`MarketEvent`]s.
//!
//! The symbol allowlist is enforced here and nowhere else: any event that passes the
//! [`Normalizer`] is guaranteed to belong to one of the fixed detectors.

use crate::{
    error::DropReason,
    event::{BookUpdate, EventKind, Liquidation, MarketEvent, PublicTrade, Side, Symbol},
};
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Raw message envelope produced by the feed transport.
///
/// `data` is deserialised based on the `kind` field.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawFeedMessage {
    /// Seconds since epoch.
    pub timestamp: f64,
    pub symbol: String,
    /// "trade", "book_update" or "liquidation".
    pub kind: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    price: f64,
    #[serde(alias = "quantity", alias = "amount")]
    base_qty: f64,
    #[serde(default)]
    quote_qty: Option<f64>,
    side: Side,
}

#[derive(Debug, Deserialize)]
struct RawBookUpdate {
    bid_levels_changed: u32,
    ask_levels_changed: u32,
}

#[derive(Debug, Deserialize)]
struct RawLiquidation {
    side: Side,
    price: f64,
    #[serde(alias = "base_qty", alias = "amount")]
    quantity: f64,
}

/// Running count of dropped events per [`DropReason`].
#[derive(Debug, Default)]
pub struct DropCounters {
    not_allowlisted: AtomicU64,
    malformed: AtomicU64,
    out_of_order: AtomicU64,
    path_full: AtomicU64,
}

/// Point-in-time copy of [`DropCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub not_allowlisted: u64,
    pub malformed: u64,
    pub out_of_order: u64,
    /// Shed because the symbol's ingestion path was at capacity.
    pub path_full: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.not_allowlisted + self.malformed + self.out_of_order + self.path_full
    }
}

impl DropCounters {
    pub fn record(&self, reason: &DropReason) {
        let counter = match reason {
            DropReason::SymbolNotAllowlisted(_) => &self.not_allowlisted,
            DropReason::MalformedPayload(_) => &self.malformed,
            DropReason::OutOfOrderTimestamp { .. } => &self.out_of_order,
            DropReason::PathFull(_) => &self.path_full,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DropCounts {
        DropCounts {
            not_allowlisted: self.not_allowlisted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            path_full: self.path_full.load(Ordering::Relaxed),
        }
    }
}

/// Converts raw feed messages into canonical events, dropping anything outside the allowlist.
#[derive(Debug)]
pub struct Normalizer {
    allowlist: FnvHashSet<Symbol>,
    counters: DropCounters,
}

impl Normalizer {
    pub fn new<I>(allowlist: I) -> Self
    where
        I: IntoIterator<Item = Symbol>,
    {
        Self {
            allowlist: allowlist.into_iter().collect(),
            counters: DropCounters::default(),
        }
    }

    pub fn counters(&self) -> &DropCounters {
        &self.counters
    }

    /// Parse and normalise a raw JSON text frame.
    pub fn normalize_text(&self, text: &str) -> Result<MarketEvent, DropReason> {
        match serde_json::from_str::<RawFeedMessage>(text) {
            Ok(raw) => self.normalize(raw),
            Err(error) => self.reject(DropReason::MalformedPayload(format!("envelope: {error}"))),
        }
    }

    /// Normalise a raw feed message. The allowlist check runs before payload parsing.
    pub fn normalize(&self, raw: RawFeedMessage) -> Result<MarketEvent, DropReason> {
        let symbol = Symbol::new(raw.symbol.trim().to_uppercase());
        if !self.allowlist.contains(&symbol) {
            return self.reject(DropReason::SymbolNotAllowlisted(symbol));
        }

        if !raw.timestamp.is_finite() || raw.timestamp <= 0.0 {
            return self.reject(DropReason::MalformedPayload(format!(
                "timestamp: {}",
                raw.timestamp
            )));
        }

        match parse_kind(&raw.kind, raw.data) {
            Ok(kind) => Ok(MarketEvent {
                timestamp: raw.timestamp,
                symbol,
                kind,
            }),
            Err(reason) => self.reject(reason),
        }
    }

    /// Admit an already-typed event, applying the same allowlist and sanity checks as
    /// [`Self::normalize`].
    pub fn admit(&self, event: MarketEvent) -> Result<MarketEvent, DropReason> {
        if !self.allowlist.contains(&event.symbol) {
            return self.reject(DropReason::SymbolNotAllowlisted(event.symbol));
        }
        if !event.timestamp.is_finite() || event.timestamp <= 0.0 {
            return self.reject(DropReason::MalformedPayload(format!(
                "timestamp: {}",
                event.timestamp
            )));
        }
        if let Err(reason) = validate_kind(&event.kind) {
            return self.reject(reason);
        }
        Ok(event)
    }

    fn reject(&self, reason: DropReason) -> Result<MarketEvent, DropReason> {
        debug!(reason = %reason, "dropping feed event");
        self.counters.record(&reason);
        Err(reason)
    }
}

fn parse_kind(kind: &str, data: serde_json::Value) -> Result<EventKind, DropReason> {
    let malformed = |error: serde_json::Error| DropReason::MalformedPayload(format!("{kind}: {error}"));

    let kind = match kind {
        "trade" => {
            let trade = serde_json::from_value::<RawTrade>(data).map_err(malformed)?;
            EventKind::Trade(PublicTrade {
                price: trade.price,
                base_qty: trade.base_qty,
                quote_qty: trade.quote_qty.unwrap_or(trade.price * trade.base_qty),
                side: trade.side,
            })
        }
        "book_update" | "order_book_l2" => {
            let update = serde_json::from_value::<RawBookUpdate>(data).map_err(malformed)?;
            EventKind::BookUpdate(BookUpdate {
                bid_levels_changed: update.bid_levels_changed,
                ask_levels_changed: update.ask_levels_changed,
            })
        }
        "liquidation" => {
            let liquidation = serde_json::from_value::<RawLiquidation>(data).map_err(malformed)?;
            EventKind::Liquidation(Liquidation {
                side: liquidation.side,
                price: liquidation.price,
                quantity: liquidation.quantity,
            })
        }
        other => {
            return Err(DropReason::MalformedPayload(format!("unknown kind: {other}")));
        }
    };

    validate_kind(&kind)?;
    Ok(kind)
}

fn validate_kind(kind: &EventKind) -> Result<(), DropReason> {
    let positive = |name: &str, value: f64| {
        if value.is_finite() && value > 0.0 {
            Ok(())
        } else {
            Err(DropReason::MalformedPayload(format!("{name}: {value}")))
        }
    };

    match kind {
        EventKind::Trade(trade) => {
            positive("price", trade.price)?;
            positive("base_qty", trade.base_qty)?;
            positive("quote_qty", trade.quote_qty)
        }
        EventKind::Liquidation(liquidation) => {
            positive("price", liquidation.price)?;
            positive("quantity", liquidation.quantity)
        }
        EventKind::BookUpdate(_) => Ok(()),
    }
}
