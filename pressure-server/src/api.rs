//! WebSocket query API.
//!
//! Clients send [`QueryRequest`] JSON text frames and receive one [`QueryResponse`] per request.
//! Every promoted classification is pushed to all connected clients as it happens.

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use pressure_engine::{ClassificationEvent, QueryRequest, QueryResponse, QueryService};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Message pushed by the server without a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Classification(ClassificationEvent),
}

/// Accept query clients until the listener fails.
pub async fn start_query_server(
    addr: SocketAddr,
    query: QueryService,
    tx: Arc<broadcast::Sender<ServerMessage>>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "query server bound");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        info!(%peer_addr, "new query connection");
        tokio::spawn(handle_client(stream, peer_addr, query.clone(), Arc::clone(&tx)));
    }
}

async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    query: QueryService,
    tx: Arc<broadcast::Sender<ServerMessage>>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            error!(%peer_addr, %error, "WebSocket handshake failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut rx = tx.subscribe();
    let (response_tx, mut response_rx) = mpsc::channel::<String>(64);

    let welcome = ServerMessage::Welcome {
        message: "Connected to pressure-engine query API".to_string(),
        timestamp: Utc::now(),
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }

    // Single writer for pushed classifications and query responses
    let mut send_task = tokio::spawn(async move {
        loop {
            let json = tokio::select! {
                pushed = rx.recv() => match pushed {
                    Ok(message) => match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(error) => {
                            warn!(%error, "failed to serialise pushed message");
                            continue;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%peer_addr, skipped, "client lagged, classifications skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                response = response_rx.recv() => match response {
                    Some(json) => json,
                    None => break,
                },
            };

            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let response = answer(&query, text.as_str()).await;
                    match serde_json::to_string(&response) {
                        Ok(json) => {
                            if response_tx.send(json).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => warn!(%error, "failed to serialise query response"),
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    error!(%peer_addr, %error, "query WebSocket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(%peer_addr, "query connection closed");
}

/// Parse and answer a single request. Log reads block, so the query runs off the async workers.
pub async fn answer(query: &QueryService, text: &str) -> QueryResponse {
    let request = match serde_json::from_str::<QueryRequest>(text) {
        Ok(request) => request,
        Err(error) => {
            debug!(%error, "invalid query request");
            return QueryResponse::Error {
                message: format!("invalid request: {error}"),
            };
        }
    };

    let query = query.clone();
    tokio::task::spawn_blocking(move || query.handle(request))
        .await
        .unwrap_or_else(|error| QueryResponse::Error {
            message: format!("query failed: {error}"),
        })
}

/// Forward promoted classifications from the engine to every query client.
pub async fn forward_classifications(
    mut classifications: broadcast::Receiver<ClassificationEvent>,
    tx: Arc<broadcast::Sender<ServerMessage>>,
) {
    loop {
        match classifications.recv().await {
            Ok(classification) => {
                // No connected clients is fine
                let _ = tx.send(ServerMessage::Classification(classification));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "classification forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pressure_engine::{
        EngineConfig, Symbol, evaluator::ConditionsMet, persistence::DurableLog,
        registry::DetectorRegistry,
    };

    fn query(dir: &tempfile::TempDir) -> QueryService {
        let registry = DetectorRegistry::new(Arc::new(EngineConfig::default())).unwrap();
        QueryService::new(Arc::new(registry), DurableLog::new(dir.path()))
    }

    #[tokio::test]
    async fn test_answer() {
        struct TestCase {
            input: &'static str,
            expected: &'static str,
        }

        let dir = tempfile::tempdir().unwrap();
        let query = query(&dir);

        let tests = vec![
            TestCase {
                // TC0: correlation
                input: r#"{"query":"correlation","symbol":"BTCUSDT","center":100.0,"radius":30.0}"#,
                expected: "correlation",
            },
            TestCase {
                // TC1: snapshot
                input: r#"{"query":"window_snapshot","symbol":"ETHUSDT"}"#,
                expected: "window_snapshot",
            },
            TestCase {
                // TC2: unknown symbol
                input: r#"{"query":"baseline","symbol":"DOGEUSDT"}"#,
                expected: "error",
            },
            TestCase {
                // TC3: garbage
                input: "select * from classifications",
                expected: "error",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let response = serde_json::to_value(answer(&query, test.input).await).unwrap();
            assert_eq!(response["type"], test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_forward_classifications() {
        let (engine_tx, engine_rx) = broadcast::channel(8);
        let (api_tx, mut api_rx) = broadcast::channel(8);
        let forwarder = tokio::spawn(forward_classifications(engine_rx, Arc::new(api_tx)));

        let classification = ClassificationEvent {
            symbol: Symbol::new("BTCUSDT"),
            timestamp: 120.0,
            promoted: true,
            conditions_met: ConditionsMet([true; 4]),
        };
        engine_tx.send(classification.clone()).unwrap();
        drop(engine_tx);
        forwarder.await.unwrap();

        let message = api_rx.recv().await.unwrap();
        assert_eq!(message, ServerMessage::Classification(classification));

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "classification");
        assert_eq!(json["symbol"], "BTCUSDT");
        assert_eq!(json["promoted"], true);
    }
}
