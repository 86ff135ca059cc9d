//! Read-only query surface consumed by dashboards and other observers.
//!
//! Nothing here mutates detector state. Live state (windows, baselines, retention) is read
//! through each detector's lock, so a query always observes a detector between two complete
//! ingests. Persisted history is read from the durable log, which trails ingestion by the
//! persistence queue.

use crate::{
    baseline::Baselines,
    correlation::{CorrelationService, CorrelationWindow},
    error::QueryError,
    evaluator::ClassificationEvent,
    event::Symbol,
    persistence::DurableLog,
    registry::DetectorRegistry,
    window::WindowSnapshot,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Query request, eg/ `{"query": "correlation", "symbol": "BTCUSDT", "center": 1.7e9, "radius": 30}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum QueryRequest {
    Correlation {
        symbol: Symbol,
        center: f64,
        radius: f64,
    },
    WindowSnapshot {
        symbol: Symbol,
    },
    Classifications {
        symbol: Symbol,
        #[serde(default)]
        since: Option<f64>,
    },
    Evaluations {
        symbol: Symbol,
        #[serde(default)]
        since: Option<f64>,
    },
    Baseline {
        symbol: Symbol,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryResponse {
    Correlation {
        symbol: Symbol,
        center: f64,
        radius: f64,
        window: CorrelationWindow,
    },
    WindowSnapshot(WindowSnapshot),
    Classifications {
        symbol: Symbol,
        classifications: Vec<ClassificationEvent>,
    },
    Evaluations {
        symbol: Symbol,
        evaluations: Vec<ClassificationEvent>,
    },
    Baseline {
        symbol: Symbol,
        baselines: Baselines,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct QueryService {
    registry: Arc<DetectorRegistry>,
    correlation: CorrelationService,
    log: DurableLog,
}

impl QueryService {
    pub fn new(registry: Arc<DetectorRegistry>, log: DurableLog) -> Self {
        Self {
            correlation: CorrelationService::new(Arc::clone(&registry), log.clone()),
            registry,
            log,
        }
    }

    pub fn window_snapshot(&self, symbol: &str) -> Result<WindowSnapshot, QueryError> {
        self.registry.window_snapshot(symbol)
    }

    pub fn baseline(&self, symbol: &str) -> Result<Baselines, QueryError> {
        self.registry.baselines(symbol)
    }

    pub fn correlation(
        &self,
        symbol: &str,
        center: f64,
        radius_seconds: f64,
    ) -> Result<CorrelationWindow, QueryError> {
        self.correlation.correlate(symbol, center, radius_seconds)
    }

    /// Persisted PEAK_PRESSURE classifications for `symbol` at or after `since`.
    pub fn classifications(
        &self,
        symbol: &str,
        since: Option<f64>,
    ) -> Result<Vec<ClassificationEvent>, QueryError> {
        self.log
            .classifications(self.registry.canonical(symbol)?, since)
    }

    /// Persisted negative evaluations for `symbol` at or after `since`. Audit only.
    pub fn evaluations(
        &self,
        symbol: &str,
        since: Option<f64>,
    ) -> Result<Vec<ClassificationEvent>, QueryError> {
        self.log.evaluations(self.registry.canonical(symbol)?, since)
    }

    /// Answer a request, folding failures into [`QueryResponse::Error`].
    pub fn handle(&self, request: QueryRequest) -> QueryResponse {
        self.try_handle(request)
            .unwrap_or_else(|error| QueryResponse::Error {
                message: error.to_string(),
            })
    }

    /// Responses echo the allowlisted spelling of the requested symbol.
    fn try_handle(&self, request: QueryRequest) -> Result<QueryResponse, QueryError> {
        Ok(match request {
            QueryRequest::Correlation {
                symbol,
                center,
                radius,
            } => QueryResponse::Correlation {
                window: self.correlation(&symbol, center, radius)?,
                symbol: self.registry.canonical(&symbol)?.clone(),
                center,
                radius,
            },
            QueryRequest::WindowSnapshot { symbol } => {
                QueryResponse::WindowSnapshot(self.window_snapshot(&symbol)?)
            }
            QueryRequest::Classifications { symbol, since } => QueryResponse::Classifications {
                classifications: self.classifications(&symbol, since)?,
                symbol: self.registry.canonical(&symbol)?.clone(),
            },
            QueryRequest::Evaluations { symbol, since } => QueryResponse::Evaluations {
                evaluations: self.evaluations(&symbol, since)?,
                symbol: self.registry.canonical(&symbol)?.clone(),
            },
            QueryRequest::Baseline { symbol } => QueryResponse::Baseline {
                baselines: self.baseline(&symbol)?,
                symbol: self.registry.canonical(&symbol)?.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use serde_json::json;

    fn service() -> (tempfile::TempDir, QueryService) {
        let dir = tempfile::tempdir().unwrap();
        let registry = DetectorRegistry::new(Arc::new(EngineConfig::default())).unwrap();
        let service = QueryService::new(Arc::new(registry), DurableLog::new(dir.path()));
        (dir, service)
    }

    #[test]
    fn test_de_query_request() {
        struct TestCase {
            input: serde_json::Value,
            expected: Option<QueryRequest>,
        }

        let tests = vec![
            TestCase {
                // TC0: correlation
                input: json!({"query": "correlation", "symbol": "BTCUSDT", "center": 100.0, "radius": 30.0}),
                expected: Some(QueryRequest::Correlation {
                    symbol: Symbol::new("BTCUSDT"),
                    center: 100.0,
                    radius: 30.0,
                }),
            },
            TestCase {
                // TC1: classifications w/o since
                input: json!({"query": "classifications", "symbol": "ETHUSDT"}),
                expected: Some(QueryRequest::Classifications {
                    symbol: Symbol::new("ETHUSDT"),
                    since: None,
                }),
            },
            TestCase {
                // TC2: evaluations since
                input: json!({"query": "evaluations", "symbol": "ETHUSDT", "since": 60.0}),
                expected: Some(QueryRequest::Evaluations {
                    symbol: Symbol::new("ETHUSDT"),
                    since: Some(60.0),
                }),
            },
            TestCase {
                // TC3: unknown query
                input: json!({"query": "mutate", "symbol": "ETHUSDT"}),
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_value::<QueryRequest>(test.input).ok();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_handle() {
        let (_dir, service) = service();

        let response = service.handle(QueryRequest::Correlation {
            symbol: Symbol::new("BTCUSDT"),
            center: 100.0,
            radius: 30.0,
        });
        assert_eq!(
            response,
            QueryResponse::Correlation {
                symbol: Symbol::new("BTCUSDT"),
                center: 100.0,
                radius: 30.0,
                window: CorrelationWindow::default(),
            }
        );

        let response = service.handle(QueryRequest::Baseline {
            symbol: Symbol::new("DOGEUSDT"),
        });
        assert_eq!(
            response,
            QueryResponse::Error {
                message: "unknown symbol: DOGEUSDT".to_string()
            }
        );

        let QueryResponse::Baseline { baselines, .. } = service.handle(QueryRequest::Baseline {
            symbol: Symbol::new("SOLUSDT"),
        }) else {
            panic!("expected baseline response");
        };
        assert!(!baselines.ready());
    }

    #[test]
    fn test_lower_case_symbol_is_answered_canonically() {
        let (_dir, service) = service();

        let request = serde_json::from_value::<QueryRequest>(
            json!({"query": "correlation", "symbol": "btcusdt", "center": 100.0, "radius": 30.0}),
        )
        .unwrap();
        assert_eq!(
            service.handle(request),
            QueryResponse::Correlation {
                symbol: Symbol::new("BTCUSDT"),
                center: 100.0,
                radius: 30.0,
                window: CorrelationWindow::default(),
            }
        );

        let response = service.handle(QueryRequest::Evaluations {
            symbol: Symbol::new("ethusdt"),
            since: None,
        });
        assert_eq!(
            response,
            QueryResponse::Evaluations {
                symbol: Symbol::new("ETHUSDT"),
                evaluations: vec![],
            }
        );
    }

    #[test]
    fn test_se_response_is_tagged() {
        let (_dir, service) = service();
        let response = service.handle(QueryRequest::WindowSnapshot {
            symbol: Symbol::new("BTCUSDT"),
        });

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "window_snapshot");
        assert_eq!(json["symbol"], "BTCUSDT");
        assert_eq!(json["trade_count"], 0);
    }
}
