//! Engine configuration, loaded once at startup and immutable thereafter.
//!
//! Loaded from the JSON file named by `PRESSURE_CONFIG` when set, otherwise from individual
//! environment variables with defaults. Changing the symbol allowlist requires a restart.

use crate::{
    error::ConfigError,
    evaluator::{Condition, Percentile},
    event::Symbol,
};
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Number of symbols the engine observes. Fixed for the lifetime of the process.
pub const ALLOWLIST_SIZE: usize = 10;

/// Default symbol allowlist.
pub const DEFAULT_SYMBOLS: [&str; ALLOWLIST_SIZE] = [
    "BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "BNBUSDT", "ADAUSDT", "AVAXUSDT", "LINKUSDT",
    "LTCUSDT", "DOTUSDT",
];

/// Default 4-condition promotion rule: trade count above P90, volume above P90, a liquidation
/// within the correlation span and book-update count above P95.
pub const DEFAULT_CONDITIONS: [Condition; 4] = [
    Condition::TradeCountAbove(Percentile::P90),
    Condition::VolumeAbove(Percentile::P90),
    Condition::LiquidationWithinSpan,
    Condition::BookUpdatesAbove(Percentile::P95),
];

/// Quantiles backing the `p90` and `p95` baseline thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PercentileTargets {
    pub p90: f64,
    pub p95: f64,
}

impl Default for PercentileTargets {
    fn default() -> Self {
        Self {
            p90: 0.90,
            p95: 0.95,
        }
    }
}

/// Durable log writer configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Root directory of the segmented Parquet log.
    pub path: PathBuf,
    /// Records buffered between ingestion paths and the writer before the oldest are dropped.
    pub queue_capacity: usize,
    /// Write attempts per record before it is dropped.
    pub max_attempts: u32,
    /// Initial retry backoff, doubled after each failed attempt.
    pub retry_backoff_ms: u64,
    pub write_timeout_ms: u64,
    /// Time allowed for flushing the queue on shutdown.
    pub shutdown_grace_ms: u64,
    /// Rows buffered per partition before a segment is sealed.
    pub segment_max_rows: usize,
    /// Maximum age of the oldest buffered market row before its segment is sealed.
    pub segment_max_age_ms: u64,
    /// Cadence at which the writer checkpoints buffered rows.
    pub flush_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pressure_log"),
            queue_capacity: 10_000,
            max_attempts: 3,
            retry_backoff_ms: 50,
            write_timeout_ms: 1_000,
            shutdown_grace_ms: 2_000,
            segment_max_rows: 65_536,
            segment_max_age_ms: 60_000,
            flush_interval_ms: 1_000,
        }
    }
}

impl PersistenceConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn segment_max_age(&self) -> Duration {
        Duration::from_millis(self.segment_max_age_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Peak-pressure engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbol_allowlist: Vec<Symbol>,
    /// Span of the per-symbol detection window.
    pub detection_window_seconds: f64,
    /// Bucket width of the detection window; capacity = window / resolution.
    pub tick_resolution_seconds: f64,
    /// Maximum age of liquidations held in the retention buffer.
    pub retention_window_seconds: f64,
    /// Cadence at which baselines are sampled and promotion is evaluated.
    pub sample_interval_seconds: f64,
    pub warmup_min_samples: usize,
    pub baseline_max_samples: usize,
    pub percentile_targets: PercentileTargets,
    /// Maximum distance between a liquidation and the evaluation instant for the liquidation
    /// condition to hold.
    pub correlation_span_seconds: f64,
    pub promotion_conditions: [Condition; 4],
    /// Per-symbol ingestion path channel capacity.
    pub path_channel_capacity: usize,
    pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol_allowlist: DEFAULT_SYMBOLS.iter().map(|symbol| Symbol::new(symbol)).collect(),
            detection_window_seconds: 300.0,
            tick_resolution_seconds: 1.0,
            retention_window_seconds: 60.0,
            sample_interval_seconds: 60.0,
            warmup_min_samples: 30,
            baseline_max_samples: 1_440,
            percentile_targets: PercentileTargets::default(),
            correlation_span_seconds: 30.0,
            promotion_conditions: DEFAULT_CONDITIONS,
            path_channel_capacity: 4_096,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `PRESSURE_CONFIG` (JSON file) if set, otherwise from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match std::env::var("PRESSURE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| ConfigError::Parse(format!("{path}: {error}")))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|error| ConfigError::Parse(error.to_string()))
    }

    /// Defaults overridden by any of the recognised environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let symbol_allowlist = std::env::var("PRESSURE_SYMBOLS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|symbol| Symbol::new(symbol.trim().to_uppercase()))
                    .collect()
            })
            .unwrap_or(defaults.symbol_allowlist);

        let persistence = PersistenceConfig {
            path: std::env::var("PRESSURE_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.persistence.path),
            queue_capacity: env_or("PRESSURE_LOG_QUEUE", defaults.persistence.queue_capacity),
            segment_max_rows: env_or("PRESSURE_SEGMENT_ROWS", defaults.persistence.segment_max_rows),
            segment_max_age_ms: env_or("PRESSURE_SEGMENT_AGE_MS", defaults.persistence.segment_max_age_ms),
            flush_interval_ms: env_or("PRESSURE_FLUSH_INTERVAL_MS", defaults.persistence.flush_interval_ms),
            ..defaults.persistence
        };

        Self {
            symbol_allowlist,
            detection_window_seconds: env_or("DETECTION_WINDOW_SECS", defaults.detection_window_seconds),
            tick_resolution_seconds: env_or("TICK_RESOLUTION_SECS", defaults.tick_resolution_seconds),
            retention_window_seconds: env_or("RETENTION_WINDOW_SECS", defaults.retention_window_seconds),
            sample_interval_seconds: env_or("SAMPLE_INTERVAL_SECS", defaults.sample_interval_seconds),
            warmup_min_samples: env_or("WARMUP_MIN_SAMPLES", defaults.warmup_min_samples),
            baseline_max_samples: env_or("BASELINE_MAX_SAMPLES", defaults.baseline_max_samples),
            percentile_targets: PercentileTargets {
                p90: env_or("PERCENTILE_P90", defaults.percentile_targets.p90),
                p95: env_or("PERCENTILE_P95", defaults.percentile_targets.p95),
            },
            correlation_span_seconds: env_or("CORRELATION_SPAN_SECS", defaults.correlation_span_seconds),
            promotion_conditions: defaults.promotion_conditions,
            path_channel_capacity: env_or("PATH_CHANNEL_CAPACITY", defaults.path_channel_capacity),
            persistence,
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.symbol_allowlist = symbols
            .into_iter()
            .map(|symbol| Symbol::new(symbol.as_ref().to_uppercase()))
            .collect();
        self
    }

    pub fn with_detection_window(mut self, seconds: f64) -> Self {
        self.detection_window_seconds = seconds;
        self
    }

    pub fn with_retention_window(mut self, seconds: f64) -> Self {
        self.retention_window_seconds = seconds;
        self
    }

    pub fn with_sample_interval(mut self, seconds: f64) -> Self {
        self.sample_interval_seconds = seconds;
        self
    }

    pub fn with_warmup_min_samples(mut self, samples: usize) -> Self {
        self.warmup_min_samples = samples;
        self
    }

    pub fn with_correlation_span(mut self, seconds: f64) -> Self {
        self.correlation_span_seconds = seconds;
        self
    }

    pub fn with_path_channel_capacity(mut self, capacity: usize) -> Self {
        self.path_channel_capacity = capacity;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol_allowlist.len() != ALLOWLIST_SIZE {
            return Err(ConfigError::AllowlistSize {
                expected: ALLOWLIST_SIZE,
                found: self.symbol_allowlist.len(),
            });
        }

        let mut seen = FnvHashSet::default();
        for symbol in &self.symbol_allowlist {
            if symbol.is_empty() || !seen.insert(symbol.clone()) {
                return Err(ConfigError::InvalidSymbol(symbol.to_string()));
            }
        }

        for (name, value) in [
            ("detection_window_seconds", self.detection_window_seconds),
            ("tick_resolution_seconds", self.tick_resolution_seconds),
            ("retention_window_seconds", self.retention_window_seconds),
            ("sample_interval_seconds", self.sample_interval_seconds),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidWindow(format!("{name} must be positive, got {value}")));
            }
        }
        if !self.correlation_span_seconds.is_finite() || self.correlation_span_seconds < 0.0 {
            return Err(ConfigError::InvalidWindow(format!(
                "correlation_span_seconds must be non-negative, got {}",
                self.correlation_span_seconds
            )));
        }
        if self.tick_resolution_seconds > self.detection_window_seconds {
            return Err(ConfigError::InvalidWindow(format!(
                "tick resolution {}s exceeds detection window {}s",
                self.tick_resolution_seconds, self.detection_window_seconds
            )));
        }

        for (name, value) in [
            ("p90", self.percentile_targets.p90),
            ("p95", self.percentile_targets.p95),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(ConfigError::InvalidPercentile {
                    name,
                    value: value.to_string(),
                });
            }
        }

        if self.warmup_min_samples == 0 || self.baseline_max_samples < self.warmup_min_samples {
            return Err(ConfigError::InvalidBaselineCapacity {
                capacity: self.baseline_max_samples,
                warmup: self.warmup_min_samples,
            });
        }

        if self.path_channel_capacity == 0 {
            return Err(ConfigError::InvalidWindow("path_channel_capacity must be non-zero".to_string()));
        }
        if self.persistence.queue_capacity == 0 || self.persistence.max_attempts == 0 {
            return Err(ConfigError::InvalidPersistence(
                "queue_capacity and max_attempts must be non-zero".to_string(),
            ));
        }
        if self.persistence.segment_max_rows == 0 || self.persistence.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidPersistence(
                "segment_max_rows and flush_interval_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.symbol_allowlist.len(), ALLOWLIST_SIZE);
        assert!(!config.symbol_allowlist.contains(&Symbol::new("DOGEUSDT")));
    }

    #[test]
    fn test_validate() {
        struct TestCase {
            input: EngineConfig,
            expected: Result<(), ConfigError>,
        }

        let tests = vec![
            TestCase {
                // TC0: too few symbols
                input: EngineConfig::default().with_symbols(["BTCUSDT", "ETHUSDT"]),
                expected: Err(ConfigError::AllowlistSize {
                    expected: ALLOWLIST_SIZE,
                    found: 2,
                }),
            },
            TestCase {
                // TC1: duplicate symbol
                input: EngineConfig::default().with_symbols([
                    "BTCUSDT", "BTCUSDT", "SOLUSDT", "XRPUSDT", "BNBUSDT", "ADAUSDT", "AVAXUSDT",
                    "LINKUSDT", "LTCUSDT", "DOTUSDT",
                ]),
                expected: Err(ConfigError::InvalidSymbol("BTCUSDT".to_string())),
            },
            TestCase {
                // TC2: zero detection window
                input: EngineConfig::default().with_detection_window(0.0),
                expected: Err(ConfigError::InvalidWindow(
                    "detection_window_seconds must be positive, got 0".to_string(),
                )),
            },
            TestCase {
                // TC3: baseline capacity below warm-up
                input: EngineConfig {
                    baseline_max_samples: 5,
                    ..EngineConfig::default()
                },
                expected: Err(ConfigError::InvalidBaselineCapacity {
                    capacity: 5,
                    warmup: 30,
                }),
            },
            TestCase {
                // TC4: percentile outside (0, 1)
                input: EngineConfig {
                    percentile_targets: PercentileTargets { p90: 90.0, p95: 0.95 },
                    ..EngineConfig::default()
                },
                expected: Err(ConfigError::InvalidPercentile {
                    name: "p90",
                    value: "90".to_string(),
                }),
            },
            TestCase {
                // TC5: segments that can never hold a row
                input: EngineConfig::default().with_persistence(PersistenceConfig {
                    segment_max_rows: 0,
                    ..PersistenceConfig::default()
                }),
                expected: Err(ConfigError::InvalidPersistence(
                    "segment_max_rows and flush_interval_ms must be non-zero".to_string(),
                )),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.validate();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_from_json_with_partial_fields() {
        let config = EngineConfig::from_json(
            r#"{
                "detection_window_seconds": 120.0,
                "promotion_conditions": [
                    {"trade_count_above": "p95"},
                    {"volume_above": "p90"},
                    "liquidation_within_span",
                    {"book_updates_above": "p95"}
                ],
                "persistence": {"path": "/tmp/pressure", "segment_max_rows": 1024}
            }"#,
        )
        .unwrap();

        assert_eq!(config.detection_window_seconds, 120.0);
        assert_eq!(config.retention_window_seconds, 60.0);
        assert_eq!(
            config.promotion_conditions[0],
            Condition::TradeCountAbove(Percentile::P95)
        );
        assert_eq!(config.persistence.path, PathBuf::from("/tmp/pressure"));
        assert_eq!(config.persistence.segment_max_rows, 1_024);
        assert_eq!(config.persistence.max_attempts, 3);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_from_json_rejects_three_conditions() {
        let result = EngineConfig::from_json(
            r#"{"promotion_conditions": ["liquidation_within_span", "liquidation_within_span", "liquidation_within_span"]}"#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
