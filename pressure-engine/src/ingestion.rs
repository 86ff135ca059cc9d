//! Per-symbol ingestion paths.
//!
//! ```text
//!                      +--> [BTCUSDT path] --> SymbolDetector(BTCUSDT) --+
//! feed --> Normalizer -+--> [ETHUSDT path] --> SymbolDetector(ETHUSDT) --+--> PersistenceHandle
//!                      +--> ...                                          +--> classification broadcast
//! ```
//!
//! Each allowlisted symbol is served by its own task and bounded channel. Routing never waits on
//! a path: an event for a symbol whose channel is full is dropped and counted as
//! [`DropReason::PathFull`], so a slow or halted symbol never stalls another. Events for one
//! symbol are applied strictly in arrival order.

use crate::{
    error::{DropReason, IngestError, SubmitError},
    evaluator::ClassificationEvent,
    event::{MarketEvent, Symbol},
    normalizer::{Normalizer, RawFeedMessage},
    persistence::{LogRecord, PersistenceHandle},
    registry::{DetectorRegistry, SharedDetector},
};
use fnv::FnvHashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Outcome of one ingestion path, reported on shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathStats {
    pub symbol: Symbol,
    pub processed: u64,
    pub dropped: u64,
    pub classifications: u64,
    pub promotions: u64,
    /// Path stopped on an isolation violation.
    pub halted: bool,
}

impl PathStats {
    fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            processed: 0,
            dropped: 0,
            classifications: 0,
            promotions: 0,
            halted: false,
        }
    }
}

/// Routes normalised events to the ingestion path of their symbol.
#[derive(Debug)]
pub struct IngestionRouter {
    normalizer: Arc<Normalizer>,
    paths: FnvHashMap<Symbol, mpsc::Sender<MarketEvent>>,
    tasks: Vec<(Symbol, JoinHandle<PathStats>)>,
}

impl IngestionRouter {
    /// Spawn one ingestion path per detector in the registry.
    pub fn spawn(
        registry: &DetectorRegistry,
        sink: PersistenceHandle,
        classifications: broadcast::Sender<ClassificationEvent>,
    ) -> Self {
        let normalizer = Arc::new(Normalizer::new(registry.symbols().cloned()));
        let capacity = registry.config().path_channel_capacity.max(1);

        let mut paths = FnvHashMap::default();
        let mut tasks = Vec::with_capacity(registry.len());

        for symbol in registry.symbols() {
            let Some(detector) = registry.get(symbol) else {
                continue;
            };

            let (tx, rx) = mpsc::channel(capacity);
            let task = tokio::spawn(run_path(
                Arc::clone(detector),
                rx,
                Arc::clone(&normalizer),
                sink.clone(),
                classifications.clone(),
            ));

            paths.insert(symbol.clone(), tx);
            tasks.push((symbol.clone(), task));
        }

        info!(paths = tasks.len(), capacity, "ingestion paths started");

        Self {
            normalizer,
            paths,
            tasks,
        }
    }

    pub fn normalizer(&self) -> &Arc<Normalizer> {
        &self.normalizer
    }

    /// Normalise and route a raw JSON text frame.
    pub async fn submit_text(&self, text: &str) -> Result<(), SubmitError> {
        let event = self.normalizer.normalize_text(text)?;
        self.route(event).await
    }

    pub async fn submit(&self, raw: RawFeedMessage) -> Result<(), SubmitError> {
        let event = self.normalizer.normalize(raw)?;
        self.route(event).await
    }

    /// Route an already-typed event, subject to the same admission checks as raw messages.
    pub async fn submit_event(&self, event: MarketEvent) -> Result<(), SubmitError> {
        let event = self.normalizer.admit(event)?;
        self.route(event).await
    }

    async fn route(&self, event: MarketEvent) -> Result<(), SubmitError> {
        let Some(path) = self.paths.get(&event.symbol) else {
            return Err(DropReason::SymbolNotAllowlisted(event.symbol).into());
        };

        path.try_send(event).map_err(|error| match error {
            mpsc::error::TrySendError::Full(event) => {
                let reason = DropReason::PathFull(event.symbol);
                warn!(%reason, "dropping feed event");
                self.normalizer.counters().record(&reason);
                SubmitError::Dropped(reason)
            }
            mpsc::error::TrySendError::Closed(event) => {
                warn!(symbol = %event.symbol, "ingestion path halted, event discarded");
                SubmitError::PathHalted(event.symbol)
            }
        })
    }

    /// Close every path, letting each apply the events already queued, and collect their stats.
    pub async fn shutdown(self) -> Vec<PathStats> {
        let Self { paths, tasks, .. } = self;
        drop(paths);

        let mut stats = Vec::with_capacity(tasks.len());
        for (symbol, task) in tasks {
            match task.await {
                Ok(path) => stats.push(path),
                Err(error) => {
                    error!(%symbol, %error, "ingestion path task failed");
                    stats.push(PathStats {
                        halted: true,
                        ..PathStats::new(symbol)
                    });
                }
            }
        }

        info!(paths = stats.len(), "ingestion paths stopped");
        stats
    }
}

async fn run_path(
    detector: SharedDetector,
    mut rx: mpsc::Receiver<MarketEvent>,
    normalizer: Arc<Normalizer>,
    sink: PersistenceHandle,
    classifications: broadcast::Sender<ClassificationEvent>,
) -> PathStats {
    let symbol = detector.read().symbol().clone();
    let mut stats = PathStats::new(symbol.clone());

    while let Some(event) = rx.recv().await {
        let outcome = detector.write().ingest(&event);

        match outcome {
            Ok(classification) => {
                stats.processed += 1;
                if let Some(classification) = classification {
                    publish(&classification, &sink, &classifications, &mut stats);
                }
                sink.enqueue(LogRecord::from(&event));
            }
            Err(IngestError::Dropped(reason)) => {
                debug!(%symbol, %reason, "dropping feed event");
                normalizer.counters().record(&reason);
                stats.dropped += 1;
            }
            Err(IngestError::Isolation(violation)) => {
                error!(%symbol, %violation, "isolation violation, halting ingestion path");
                stats.halted = true;
                break;
            }
        }
    }

    debug!(%symbol, ?stats, "ingestion path finished");
    stats
}

/// Persist every classification; broadcast only promotions.
fn publish(
    classification: &ClassificationEvent,
    sink: &PersistenceHandle,
    classifications: &broadcast::Sender<ClassificationEvent>,
    stats: &mut PathStats,
) {
    stats.classifications += 1;
    sink.enqueue(LogRecord::from(classification));

    if !classification.promoted {
        debug!(
            symbol = %classification.symbol,
            timestamp = classification.timestamp,
            conditions_met = classification.conditions_met.count(),
            "interval classified below peak pressure"
        );
        return;
    }

    stats.promotions += 1;
    info!(
        symbol = %classification.symbol,
        timestamp = classification.timestamp,
        "PEAK_PRESSURE"
    );

    // No subscribers is fine, the classification is already persisted.
    let _ = classifications.send(classification.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        event::Side,
        persistence::{PersistenceSink, sink::tests::MemoryBackend},
    };
    use parking_lot::RwLock;

    fn registry() -> DetectorRegistry {
        DetectorRegistry::new(Arc::new(EngineConfig::default())).unwrap()
    }

    #[tokio::test]
    async fn test_routes_events_to_own_symbol() {
        let registry = registry();
        let backend = MemoryBackend::default();
        let sink = PersistenceSink::spawn(backend.clone(), Default::default());
        let (tx, _) = broadcast::channel(8);
        let router = IngestionRouter::spawn(&registry, sink.handle(), tx);

        router
            .submit_event(MarketEvent::trade(10.0, "BTCUSDT", 1.0, 2.0, Side::Buy))
            .await
            .unwrap();
        router
            .submit_text(r#"{"timestamp":11.0,"symbol":"ethusdt","kind":"trade","data":{"price":2.0,"base_qty":1.0,"side":"sell"}}"#)
            .await
            .unwrap();

        let stats = router.shutdown().await;
        let processed = |symbol: &str| {
            stats
                .iter()
                .find(|path| path.symbol == symbol)
                .map(|path| path.processed)
        };
        assert_eq!(stats.len(), 10);
        assert_eq!(processed("BTCUSDT"), Some(1));
        assert_eq!(processed("ETHUSDT"), Some(1));
        assert_eq!(processed("SOLUSDT"), Some(0));

        assert_eq!(registry.window_snapshot("BTCUSDT").unwrap().trade_count, 1);
        assert_eq!(registry.window_snapshot("ETHUSDT").unwrap().trade_count, 1);

        sink.shutdown().await;
        assert_eq!(backend.rows.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_drops_are_counted() {
        let registry = registry();
        let sink = PersistenceSink::spawn(MemoryBackend::default(), Default::default());
        let (tx, _) = broadcast::channel(8);
        let router = IngestionRouter::spawn(&registry, sink.handle(), tx);

        let result = router
            .submit_event(MarketEvent::trade(10.0, "DOGEUSDT", 1.0, 1.0, Side::Buy))
            .await;
        assert_eq!(
            result,
            Err(SubmitError::Dropped(DropReason::SymbolNotAllowlisted(Symbol::new("DOGEUSDT"))))
        );

        router
            .submit_event(MarketEvent::trade(10.0, "BTCUSDT", 1.0, 1.0, Side::Buy))
            .await
            .unwrap();
        router
            .submit_event(MarketEvent::trade(9.0, "BTCUSDT", 1.0, 1.0, Side::Buy))
            .await
            .unwrap();

        let normalizer = Arc::clone(router.normalizer());
        let stats = router.shutdown().await;
        let btc = stats.iter().find(|path| path.symbol == "BTCUSDT").unwrap();
        assert_eq!((btc.processed, btc.dropped), (1, 1));

        let counts = normalizer.counters().snapshot();
        assert_eq!(counts.not_allowlisted, 1);
        assert_eq!(counts.out_of_order, 1);
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_path_drops_without_blocking_other_symbols() {
        let config = EngineConfig::default().with_path_channel_capacity(1);
        let registry = DetectorRegistry::new(Arc::new(config)).unwrap();
        let sink = PersistenceSink::spawn(MemoryBackend::default(), Default::default());
        let (tx, _) = broadcast::channel(8);
        let router = IngestionRouter::spawn(&registry, sink.handle(), tx);

        // current-thread runtime: the BTCUSDT path cannot drain until this task yields
        router
            .submit_event(MarketEvent::trade(10.0, "BTCUSDT", 1.0, 1.0, Side::Buy))
            .await
            .unwrap();
        let result = router
            .submit_event(MarketEvent::trade(11.0, "BTCUSDT", 1.0, 1.0, Side::Buy))
            .await;
        assert_eq!(
            result,
            Err(SubmitError::Dropped(DropReason::PathFull(Symbol::new("BTCUSDT"))))
        );

        router
            .submit_event(MarketEvent::trade(10.0, "ETHUSDT", 1.0, 1.0, Side::Buy))
            .await
            .unwrap();

        let normalizer = Arc::clone(router.normalizer());
        let stats = router.shutdown().await;
        let processed = |symbol: &str| {
            stats
                .iter()
                .find(|path| path.symbol == symbol)
                .map(|path| path.processed)
        };
        assert_eq!(processed("BTCUSDT"), Some(1));
        assert_eq!(processed("ETHUSDT"), Some(1));

        let counts = normalizer.counters().snapshot();
        assert_eq!(counts.path_full, 1);
        assert_eq!(counts.total(), 1);
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_isolation_violation_halts_path() {
        let config = EngineConfig::default();
        let detector = Arc::new(RwLock::new(crate::detector::SymbolDetector::new(
            Symbol::new("BTCUSDT"),
            &config,
        )));
        let sink = PersistenceSink::spawn(MemoryBackend::default(), Default::default());
        let (classifications, _) = broadcast::channel(8);
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(run_path(
            Arc::clone(&detector),
            rx,
            Arc::new(Normalizer::new(config.symbol_allowlist.clone())),
            sink.handle(),
            classifications,
        ));

        tx.send(MarketEvent::trade(1.0, "BTCUSDT", 1.0, 1.0, Side::Buy)).await.unwrap();
        tx.send(MarketEvent::trade(2.0, "ETHUSDT", 1.0, 1.0, Side::Buy)).await.unwrap();
        tx.send(MarketEvent::trade(3.0, "BTCUSDT", 1.0, 1.0, Side::Buy)).await.unwrap();

        let stats = task.await.unwrap();
        assert!(stats.halted);
        assert_eq!(stats.processed, 1);
        assert_eq!(detector.read().snapshot().trade_count, 1);

        // receiver gone once the path halts
        assert!(tx.send(MarketEvent::trade(4.0, "BTCUSDT", 1.0, 1.0, Side::Buy)).await.is_err());
        sink.shutdown().await;
    }
}
