//! Ingest the live AIS stream into current vessel positions and a deduplicated history.
use std::sync::Arc;

use ais_common::health::HealthRegistry;
use ais_common::metrics::{serve, setup_metrics_recorder, setup_router};
use ais_common::store::{NoopStore, PgVesselStore, VesselStore};
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ais_ingest::config::Config;
use ais_ingest::error::IngestError;
use ais_ingest::pipeline::Pipeline;
use ais_ingest::stream::ConnectionManager;

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown_signal() -> Result<(), IngestError> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(IngestError::SignalError)?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(IngestError::SignalError)?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), IngestError> {
    setup_tracing();

    let config = Config::init_from_env().map_err(|e| {
        error!(error = %e, "invalid configuration");
        e
    })?;

    let store: Arc<dyn VesselStore> = match config.database.connect_options() {
        Some(options) => {
            info!(
                host = %config.database.host,
                port = config.database.port,
                database = %config.database.name,
                "storing vessel data in postgres"
            );
            Arc::new(PgVesselStore::new(
                options,
                config.database.max_connections,
            ))
        }
        None => {
            warn!("DB_USER or DB_PSWD not set, running without storage");
            Arc::new(NoopStore {})
        }
    };

    let liveness = HealthRegistry::new("liveness");
    let recorder = setup_metrics_recorder()?;
    let router = setup_router(liveness.clone(), recorder);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = %e, %bind, "failed to serve metrics and health");
        }
    });

    let mut pipeline = Pipeline::new(store, config.gate, config.history, config.cache);
    pipeline.start(&liveness);

    // Long enough to cover the longest reconnect wait plus a connect attempt.
    let stream_deadline = config
        .stream
        .reconnect_max
        .0
        .saturating_add(config.stream.connect_timeout.0)
        .saturating_add(config.stream.idle_timeout.0);
    let shutdown = CancellationToken::new();
    let manager = ConnectionManager::new(
        &config.stream,
        pipeline.dispatcher(),
        liveness.register("stream", stream_deadline),
        shutdown.clone(),
    );
    let mut stream = tokio::spawn(manager.run());

    let stream_finished = tokio::select! {
        signalled = shutdown_signal() => {
            signalled?;
            false
        }
        joined = &mut stream => {
            if let Err(e) = joined {
                error!(error = %e, "stream task failed");
            }
            true
        }
    };

    info!("shutting down: closing stream and stopping reconnects");
    shutdown.cancel();
    let grace = config.shutdown_grace_ms.0;
    if !stream_finished && tokio::time::timeout(grace, &mut stream).await.is_err() {
        warn!(
            grace_ms = grace.as_millis() as u64,
            "stream did not close within grace period"
        );
    }

    pipeline.shutdown().await;
    info!("shutdown complete");

    Ok(())
}
