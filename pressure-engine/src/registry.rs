//! Fixed registry of per-symbol detectors, constructed once at startup.
//!
//! Each detector sits behind its own lock; there is no lock spanning symbols, so a reader of one
//! symbol never waits on ingestion of another. Readers always observe a detector between two
//! complete ingests.

use crate::{
    baseline::Baselines,
    config::EngineConfig,
    detector::SymbolDetector,
    error::{ConfigError, QueryError},
    event::Symbol,
    window::WindowSnapshot,
};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedDetector = Arc<RwLock<SymbolDetector>>;

#[derive(Debug)]
pub struct DetectorRegistry {
    config: Arc<EngineConfig>,
    detectors: FnvHashMap<Symbol, SharedDetector>,
}

impl DetectorRegistry {
    /// Validate the configuration and create exactly one detector per allowlisted symbol.
    pub fn new(config: Arc<EngineConfig>) -> Result<Self, ConfigError> {
        config.validate()?;

        let detectors = config
            .symbol_allowlist
            .iter()
            .map(|symbol| {
                let detector = SymbolDetector::new(symbol.clone(), &config);
                (symbol.clone(), Arc::new(RwLock::new(detector)))
            })
            .collect();

        Ok(Self { config, detectors })
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Allowlisted symbols in configuration order.
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.config.symbol_allowlist.iter()
    }

    /// Symbols are normalised the same way ingestion normalises them.
    fn entry(&self, symbol: &str) -> Option<(&Symbol, &SharedDetector)> {
        let symbol = symbol.trim();
        self.detectors
            .get_key_value(symbol)
            .or_else(|| self.detectors.get_key_value(symbol.to_uppercase().as_str()))
    }

    pub fn get(&self, symbol: &str) -> Option<&SharedDetector> {
        self.entry(symbol).map(|(_, detector)| detector)
    }

    pub fn detector(&self, symbol: &str) -> Result<&SharedDetector, QueryError> {
        self.get(symbol)
            .ok_or_else(|| QueryError::UnknownSymbol(symbol.to_string()))
    }

    /// Allowlisted spelling of `symbol`, eg/ "BTCUSDT" for " btcusdt".
    pub fn canonical(&self, symbol: &str) -> Result<&Symbol, QueryError> {
        self.entry(symbol)
            .map(|(symbol, _)| symbol)
            .ok_or_else(|| QueryError::UnknownSymbol(symbol.to_string()))
    }

    pub fn window_snapshot(&self, symbol: &str) -> Result<WindowSnapshot, QueryError> {
        Ok(self.detector(symbol)?.read().snapshot())
    }

    pub fn baselines(&self, symbol: &str) -> Result<Baselines, QueryError> {
        Ok(self.detector(symbol)?.read().baselines())
    }
}
