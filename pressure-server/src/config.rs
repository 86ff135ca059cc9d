use crate::feed::FeedConfig;
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

/// Server-side settings. Engine settings live in [`pressure_engine::EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub feed: FeedConfig,
    pub query_addr: SocketAddr,
    /// Pushed classifications buffered per query client.
    pub api_buffer_size: usize,
    /// Cadence of the drop counter summary log line.
    pub summary_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            query_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9002)),
            api_buffer_size: 1_000,
            summary_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Read `FEED_URL`, `FEED_RECONNECT_SECS`, `FEED_PING_SECS`, `FEED_BUFFER_SIZE`,
    /// `QUERY_ADDR`, `API_BUFFER_SIZE` and `SUMMARY_INTERVAL_SECS`, defaulting anything unset or
    /// unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let feed = FeedConfig::new(
            std::env::var("FEED_URL").unwrap_or_else(|_| defaults.feed.url.clone()),
        )
        .with_reconnect_delay(Duration::from_secs(env_or(
            "FEED_RECONNECT_SECS",
            defaults.feed.reconnect_delay.as_secs(),
        )))
        .with_ping_interval(Duration::from_secs(env_or(
            "FEED_PING_SECS",
            defaults.feed.ping_interval.as_secs(),
        )))
        .with_channel_buffer_size(env_or("FEED_BUFFER_SIZE", defaults.feed.channel_buffer_size));

        Self {
            feed,
            query_addr: env_or("QUERY_ADDR", defaults.query_addr),
            api_buffer_size: env_or("API_BUFFER_SIZE", defaults.api_buffer_size).max(1),
            summary_interval: Duration::from_secs(
                env_or("SUMMARY_INTERVAL_SECS", defaults.summary_interval.as_secs()).max(1),
            ),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
