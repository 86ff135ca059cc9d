mod api;
mod config;
mod feed;

use crate::{
    api::ServerMessage,
    config::ServerConfig,
    feed::{FeedClient, Frame},
};
use pressure_engine::{EngineConfig, PressureEngine, SubmitError};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting pressure-engine server");

    // Allowlist misconfiguration is process-fatal
    let engine_config = match EngineConfig::load() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid engine configuration");
            std::process::exit(1);
        }
    };
    let server_config = ServerConfig::from_env();

    let engine = match PressureEngine::start(engine_config).await {
        Ok(engine) => engine,
        Err(error) => {
            error!(%error, "failed to start engine");
            std::process::exit(1);
        }
    };

    let (api_tx, _api_rx) = broadcast::channel::<ServerMessage>(server_config.api_buffer_size);
    let api_tx = Arc::new(api_tx);
    tokio::spawn(api::forward_classifications(
        engine.subscribe(),
        Arc::clone(&api_tx),
    ));

    let query = engine.query().clone();
    let query_addr = server_config.query_addr;
    tokio::spawn(async move {
        if let Err(error) = api::start_query_server(query_addr, query, api_tx).await {
            error!(%query_addr, %error, "query server stopped");
        }
    });
    info!("Query API listening on ws://{}", query_addr);

    let (mut frames, mut connection) = FeedClient::new(server_config.feed.clone()).start();

    let mut summary = tokio::time::interval(server_config.summary_interval);
    summary.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, draining ingestion paths");
                break;
            }
            frame = frames.recv() => match frame {
                Some(text) => ingest_frame(&engine, &text).await,
                None => {
                    error!("feed client stopped");
                    break;
                }
            },
            Some(status) = connection.recv() => debug!(?status, "feed connection status"),
            _ = summary.tick() => log_summary(&engine),
        }
    }

    let report = engine.shutdown().await;
    info!(
        processed = report.paths.iter().map(|path| path.processed).sum::<u64>(),
        dropped = report.drops.total(),
        records_written = report.sink.written,
        records_lost = report.sink.lost(),
        "pressure-engine server stopped"
    );
}

async fn ingest_frame(engine: &PressureEngine, text: &str) {
    let result = match feed::decode_frame(text) {
        Frame::Event(raw) => engine.submit(raw).await,
        Frame::Unrecognised => engine.submit_text(text).await,
        Frame::Ignored(kind) => {
            debug!(%kind, "ignoring feed frame");
            return;
        }
        Frame::Control => return,
    };

    // Drops are already logged and counted by the engine
    if let Err(SubmitError::PathHalted(symbol)) = result {
        error!(%symbol, "ingestion path halted, symbol no longer observed");
    }
}

fn log_summary(engine: &PressureEngine) {
    let drops = engine.drop_counts();
    let sink = engine.sink_stats();
    info!(
        not_allowlisted = drops.not_allowlisted,
        malformed = drops.malformed,
        out_of_order = drops.out_of_order,
        path_full = drops.path_full,
        records_written = sink.written,
        records_lost = sink.lost(),
        "ingestion summary"
    );
}

/// Initialize logging
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}
