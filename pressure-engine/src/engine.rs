use crate::{
    config::EngineConfig,
    error::{ConfigError, DropReason, EngineError, SubmitError},
    evaluator::ClassificationEvent,
    event::{MarketEvent, Symbol},
    ingestion::{IngestionRouter, PathStats},
    normalizer::{DropCounts, RawFeedMessage},
    persistence::{DurableLog, LogBackend, LogRecord, PersistenceSink, SinkStats},
    query::QueryService,
    registry::DetectorRegistry,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Buffered promotions per classification subscriber before it starts lagging.
pub const CLASSIFICATION_CHANNEL_CAPACITY: usize = 1_024;

/// Final accounting returned by [`PressureEngine::shutdown`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub paths: Vec<PathStats>,
    pub drops: DropCounts,
    pub sink: SinkStats,
}

/// Running engine: the fixed detector registry, its ingestion paths, the durable log writer and
/// the read-only query surface.
#[derive(Debug)]
pub struct PressureEngine {
    registry: Arc<DetectorRegistry>,
    router: IngestionRouter,
    sink: PersistenceSink,
    classifications: broadcast::Sender<ClassificationEvent>,
    query: QueryService,
}

impl PressureEngine {
    /// Validate the configuration, open the configured durable log and start every ingestion path.
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let sink = PersistenceSink::open(config.persistence.clone()).await?;
        Self::assemble(Arc::new(config), sink).map_err(EngineError::from)
    }

    /// Start the engine over an arbitrary durable log backend. Queries still read the log at
    /// `config.persistence.path`.
    pub fn start_with_backend<Backend>(
        config: EngineConfig,
        backend: Backend,
    ) -> Result<Self, EngineError>
    where
        Backend: LogBackend + 'static,
    {
        config.validate()?;
        let sink = PersistenceSink::spawn(backend, config.persistence.clone());
        Self::assemble(Arc::new(config), sink).map_err(EngineError::from)
    }

    fn assemble(
        config: Arc<EngineConfig>,
        sink: PersistenceSink,
    ) -> Result<Self, ConfigError> {
        let registry = Arc::new(DetectorRegistry::new(Arc::clone(&config))?);
        let (classifications, _) = broadcast::channel(CLASSIFICATION_CHANNEL_CAPACITY);
        let router = IngestionRouter::spawn(&registry, sink.handle(), classifications.clone());
        let query = QueryService::new(
            Arc::clone(&registry),
            DurableLog::new(config.persistence.path.clone()),
        );

        info!(
            symbols = ?config.symbol_allowlist,
            detection_window_seconds = config.detection_window_seconds,
            retention_window_seconds = config.retention_window_seconds,
            warmup_min_samples = config.warmup_min_samples,
            "pressure engine started"
        );

        Ok(Self {
            registry,
            router,
            sink,
            classifications,
            query,
        })
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        self.registry.config()
    }

    pub fn registry(&self) -> &Arc<DetectorRegistry> {
        &self.registry
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    /// Subscribe to promoted classifications. Negative evaluations are persisted only.
    pub fn subscribe(&self) -> broadcast::Receiver<ClassificationEvent> {
        self.classifications.subscribe()
    }

    pub async fn submit(&self, raw: RawFeedMessage) -> Result<(), SubmitError> {
        self.router.submit(raw).await
    }

    pub async fn submit_text(&self, text: &str) -> Result<(), SubmitError> {
        self.router.submit_text(text).await
    }

    pub async fn submit_event(&self, event: MarketEvent) -> Result<(), SubmitError> {
        self.router.submit_event(event).await
    }

    /// Record a governance proposal in the durable log.
    pub fn record_proposal(
        &self,
        symbol: &str,
        timestamp: f64,
        reference: impl Into<String>,
    ) -> Result<bool, SubmitError> {
        let symbol = self.annotation_target(symbol, timestamp)?;
        Ok(self.sink.handle().enqueue(LogRecord::proposal(symbol, timestamp, reference)))
    }

    /// Record a simulated execution in the durable log.
    pub fn record_ghost_execution(
        &self,
        symbol: &str,
        timestamp: f64,
        reference: impl Into<String>,
    ) -> Result<bool, SubmitError> {
        let symbol = self.annotation_target(symbol, timestamp)?;
        Ok(self
            .sink
            .handle()
            .enqueue(LogRecord::ghost_execution(symbol, timestamp, reference)))
    }

    /// Canonical symbol for a collaborator annotation.
    fn annotation_target(&self, symbol: &str, timestamp: f64) -> Result<Symbol, SubmitError> {
        let symbol = match self.registry.canonical(symbol) {
            Ok(symbol) => symbol.clone(),
            Err(_) => {
                return Err(
                    DropReason::SymbolNotAllowlisted(Symbol::new(symbol.trim().to_uppercase()))
                        .into(),
                );
            }
        };
        if !timestamp.is_finite() {
            return Err(DropReason::MalformedPayload("timestamp".to_string()).into());
        }
        Ok(symbol)
    }

    pub fn drop_counts(&self) -> DropCounts {
        self.router.normalizer().counters().snapshot()
    }

    pub fn sink_stats(&self) -> SinkStats {
        self.sink.stats()
    }

    /// Drain ingestion paths, then flush the durable log within its grace period.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self { router, sink, .. } = self;

        let normalizer = Arc::clone(router.normalizer());
        let paths = router.shutdown().await;
        let drops = normalizer.counters().snapshot();
        let sink = sink.shutdown().await;

        let report = ShutdownReport { paths, drops, sink };
        info!(
            processed = report.paths.iter().map(|path| path.processed).sum::<u64>(),
            halted = report.paths.iter().filter(|path| path.halted).count(),
            dropped = report.drops.total(),
            lost_records = report.sink.lost(),
            "pressure engine stopped"
        );
        report
    }
}
