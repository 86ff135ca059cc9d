//! WebSocket client for the raw market data feed
//!
//! Provides automatic reconnection, heartbeat and frame decoding into engine feed messages.

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use pressure_engine::RawFeedMessage;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Feed client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    /// Market data WebSocket URL
    pub url: String,
    /// Ping interval to keep connection alive
    pub ping_interval: Duration,
    /// Reconnection delay after disconnect
    pub reconnect_delay: Duration,
    /// Frames buffered between the socket and the engine
    pub channel_buffer_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9001".to_string(),
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
            channel_buffer_size: 10_000,
        }
    }
}

impl FeedConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }
}

/// Connection status updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Feed client forwarding raw text frames
pub struct FeedClient {
    config: FeedConfig,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    /// Start the connection loop.
    ///
    /// Returns a receiver of raw text frames and a receiver of connection status updates.
    pub fn start(self) -> (mpsc::Receiver<String>, mpsc::Receiver<ConnectionStatus>) {
        let (frame_tx, frame_rx) = mpsc::channel(self.config.channel_buffer_size.max(1));
        let (status_tx, status_rx) = mpsc::channel(10);

        tokio::spawn(run_feed_loop(self.config, frame_tx, status_tx));

        (frame_rx, status_rx)
    }
}

/// Main connection loop with auto-reconnect
async fn run_feed_loop(
    config: FeedConfig,
    frame_tx: mpsc::Sender<String>,
    status_tx: mpsc::Sender<ConnectionStatus>,
) {
    info!(url = %config.url, "starting feed client");

    loop {
        let _ = status_tx.try_send(ConnectionStatus::Reconnecting);

        match connect_async(&config.url).await {
            Ok((ws_stream, _)) => {
                info!(url = %config.url, "connected to feed");
                let _ = status_tx.try_send(ConnectionStatus::Connected);

                let (mut write, mut read) = ws_stream.split();

                let ping_interval = config.ping_interval;
                let (ping_shutdown_tx, mut ping_shutdown_rx) = mpsc::channel::<()>(1);

                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(ping_interval);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                                    debug!("failed to send ping, connection likely dead");
                                    break;
                                }
                            }
                            _ = ping_shutdown_rx.recv() => break,
                        }
                    }
                });

                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if frame_tx.send(text.as_str().to_owned()).await.is_err() {
                                warn!("frame receiver dropped, stopping feed client");
                                let _ = ping_shutdown_tx.send(()).await;
                                return;
                            }
                        }
                        Ok(Message::Close(_)) => {
                            info!("feed closed connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(error) => {
                            error!(%error, "feed WebSocket error");
                            break;
                        }
                    }
                }

                let _ = ping_shutdown_tx.send(()).await;
                let _ = status_tx.try_send(ConnectionStatus::Disconnected);
                warn!("feed connection closed, will reconnect");
            }
            Err(error) => {
                error!(url = %config.url, %error, "failed to connect to feed");
                let _ = status_tx.try_send(ConnectionStatus::Disconnected);
            }
        }

        if frame_tx.is_closed() {
            return;
        }

        debug!(delay = ?config.reconnect_delay, "waiting before reconnecting");
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

/// Decoded feed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Feed-level message such as the welcome greeting.
    Control,
    Event(RawFeedMessage),
    /// Valid market data of a kind the engine does not consume, eg/ open interest.
    Ignored(String),
    /// Anything else. Handed to the engine so it is counted as malformed.
    Unrecognised,
}

/// Envelope broadcast by the aggregated market data server.
#[derive(Debug, Deserialize)]
struct AggregatedFeedMessage {
    time_exchange: DateTime<Utc>,
    instrument: AggregatedInstrument,
    kind: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AggregatedInstrument {
    base: String,
    quote: String,
}

impl From<AggregatedFeedMessage> for RawFeedMessage {
    fn from(message: AggregatedFeedMessage) -> Self {
        let (kind, data) = if message.kind == "order_book_l2" {
            ("book_update".to_string(), level_changes(&message.data))
        } else {
            (message.kind, message.data)
        };

        Self {
            timestamp: message.time_exchange.timestamp_micros() as f64 / 1e6,
            symbol: format!("{}{}", message.instrument.base, message.instrument.quote),
            kind,
            data,
        }
    }
}

/// Reduce an L2 snapshot or update to the number of levels it touched per side.
fn level_changes(data: &serde_json::Value) -> serde_json::Value {
    let book = data
        .get("Update")
        .or_else(|| data.get("Snapshot"))
        .unwrap_or(data);
    let levels = |side: &str| {
        book.get(side)
            .and_then(serde_json::Value::as_array)
            .map_or(0, Vec::len)
    };

    serde_json::json!({
        "bid_levels_changed": levels("bids"),
        "ask_levels_changed": levels("asks"),
    })
}

fn is_consumed(kind: &str) -> bool {
    matches!(kind, "trade" | "book_update" | "order_book_l2" | "liquidation")
}

pub fn decode_frame(text: &str) -> Frame {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Frame::Unrecognised;
    };

    if value.get("type").and_then(serde_json::Value::as_str) == Some("welcome") {
        return Frame::Control;
    }

    if let Some(kind) = value.get("kind").and_then(serde_json::Value::as_str) {
        if !is_consumed(kind) {
            return Frame::Ignored(kind.to_string());
        }
    }

    if value.get("instrument").is_some() {
        return match serde_json::from_value::<AggregatedFeedMessage>(value) {
            Ok(message) => Frame::Event(message.into()),
            Err(_) => Frame::Unrecognised,
        };
    }

    match serde_json::from_value::<RawFeedMessage>(value) {
        Ok(raw) => Frame::Event(raw),
        Err(_) => Frame::Unrecognised,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_builder() {
        let config = FeedConfig::new("ws://localhost:8080")
            .with_ping_interval(Duration::from_secs(15))
            .with_reconnect_delay(Duration::from_secs(5))
            .with_channel_buffer_size(500);

        assert_eq!(config.url, "ws://localhost:8080");
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.channel_buffer_size, 500);
    }

    #[test]
    fn test_decode_frame() {
        struct TestCase {
            input: serde_json::Value,
            expected: Frame,
        }

        let tests = vec![
            TestCase {
                // TC0: welcome greeting
                input: json!({"type": "welcome", "message": "hi"}),
                expected: Frame::Control,
            },
            TestCase {
                // TC1: engine-native raw message
                input: json!({
                    "timestamp": 10.0,
                    "symbol": "BTCUSDT",
                    "kind": "trade",
                    "data": {"price": 1.0, "base_qty": 2.0, "side": "Buy"}
                }),
                expected: Frame::Event(RawFeedMessage {
                    timestamp: 10.0,
                    symbol: "BTCUSDT".to_string(),
                    kind: "trade".to_string(),
                    data: json!({"price": 1.0, "base_qty": 2.0, "side": "Buy"}),
                }),
            },
            TestCase {
                // TC2: aggregated server trade
                input: json!({
                    "time_exchange": "2023-11-14T22:14:00Z",
                    "time_received": "2023-11-14T22:14:00.100Z",
                    "exchange": "BinanceFuturesUsd",
                    "instrument": {"base": "btc", "quote": "usdt", "kind": "Perpetual"},
                    "kind": "trade",
                    "data": {"id": "1", "price": 1.0, "amount": 2.0, "side": "Sell"}
                }),
                expected: Frame::Event(RawFeedMessage {
                    timestamp: 1_700_000_040.0,
                    symbol: "btcusdt".to_string(),
                    kind: "trade".to_string(),
                    data: json!({"id": "1", "price": 1.0, "amount": 2.0, "side": "Sell"}),
                }),
            },
            TestCase {
                // TC3: aggregated server L2 update reduced to level counts
                input: json!({
                    "time_exchange": "2023-11-14T22:14:00Z",
                    "instrument": {"base": "eth", "quote": "usdt"},
                    "kind": "order_book_l2",
                    "data": {"Update": {"bids": [[1.0, 2.0], [1.1, 0.0]], "asks": [[1.2, 1.0]]}}
                }),
                expected: Frame::Event(RawFeedMessage {
                    timestamp: 1_700_000_040.0,
                    symbol: "ethusdt".to_string(),
                    kind: "book_update".to_string(),
                    data: json!({"bid_levels_changed": 2, "ask_levels_changed": 1}),
                }),
            },
            TestCase {
                // TC4: kind not consumed by the engine
                input: json!({"kind": "open_interest", "data": {}}),
                expected: Frame::Ignored("open_interest".to_string()),
            },
            TestCase {
                // TC5: unknown shape
                input: json!({"hello": "world"}),
                expected: Frame::Unrecognised,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = decode_frame(&test.input.to_string());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_decode_invalid_json() {
        assert_eq!(decode_frame("not json"), Frame::Unrecognised);
    }
}
