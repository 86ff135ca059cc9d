//! Canonical market events delivered to the detection engine.
//!
//! Every event is symbol-tagged and carries a wall-clock timestamp in seconds since epoch.
//! Events are produced by the [`Normalizer`](crate::normalizer::Normalizer) and never
//! mutated afterwards; downstream components only hold shared references or clones.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::str::FromStr;

/// Exchange symbol, eg/ "BTCUSDT".
pub type Symbol = SmolStr;

/// Order side (Buy or Sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
pub enum Side {
    #[serde(alias = "buy", alias = "BUY", alias = "Bid", alias = "bid")]
    Buy,
    #[serde(alias = "sell", alias = "SELL", alias = "Ask", alias = "ask")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(side: &str) -> Result<Self, Self::Err> {
        match side.to_ascii_lowercase().as_str() {
            "buy" | "bid" => Ok(Side::Buy),
            "sell" | "ask" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Single public trade execution.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PublicTrade {
    pub price: f64,
    /// Trade size in base currency.
    pub base_qty: f64,
    /// Trade size in quote currency.
    pub quote_qty: f64,
    pub side: Side,
}

/// Incremental order book update, reduced to the number of price levels it touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BookUpdate {
    pub bid_levels_changed: u32,
    pub ask_levels_changed: u32,
}

impl BookUpdate {
    pub fn levels_changed(&self) -> u64 {
        u64::from(self.bid_levels_changed) + u64::from(self.ask_levels_changed)
    }
}

/// Forced liquidation of a position.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Liquidation {
    /// Side of the liquidation order.
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
}

/// Variant-specific payload of a [`MarketEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Trade(PublicTrade),
    BookUpdate(BookUpdate),
    Liquidation(Liquidation),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Trade(_) => "trade",
            EventKind::BookUpdate(_) => "book_update",
            EventKind::Liquidation(_) => "liquidation",
        }
    }
}

/// Normalised market event for one allowlisted symbol.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MarketEvent {
    /// Seconds since epoch.
    pub timestamp: f64,
    pub symbol: Symbol,
    pub kind: EventKind,
}

impl MarketEvent {
    pub fn new(timestamp: f64, symbol: impl Into<Symbol>, kind: EventKind) -> Self {
        Self {
            timestamp,
            symbol: symbol.into(),
            kind,
        }
    }

    pub fn trade(timestamp: f64, symbol: impl Into<Symbol>, price: f64, base_qty: f64, side: Side) -> Self {
        Self::new(
            timestamp,
            symbol,
            EventKind::Trade(PublicTrade {
                price,
                base_qty,
                quote_qty: price * base_qty,
                side,
            }),
        )
    }

    pub fn book_update(timestamp: f64, symbol: impl Into<Symbol>, bids: u32, asks: u32) -> Self {
        Self::new(
            timestamp,
            symbol,
            EventKind::BookUpdate(BookUpdate {
                bid_levels_changed: bids,
                ask_levels_changed: asks,
            }),
        )
    }

    pub fn liquidation(timestamp: f64, symbol: impl Into<Symbol>, price: f64, quantity: f64, side: Side) -> Self {
        Self::new(
            timestamp,
            symbol,
            EventKind::Liquidation(Liquidation {
                side,
                price,
                quantity,
            }),
        )
    }

    pub fn is_liquidation(&self) -> bool {
        matches!(self.kind, EventKind::Liquidation(_))
    }
}
