//! statecache - a Kafka-backed key/value cache
//!
//! This application materializes a compacted Kafka topic into a local store,
//! serves reads from it over HTTP, and publishes writes back to the log
//! through a persistent outbox.

use std::sync::Arc;
use std::time::Duration;

use statecache::{
    api::{health_monitor, AppState},
    config::Config,
    create_server,
    db::Storage,
    error::Result,
    kafka::{
        ConsumerSettings, KafkaLogReader, KafkaPublisher, OutboxSettings, OutboxWorker,
        StateConsumer,
    },
    logging,
    shutdown::{listen_for_signals, Shutdown, ShutdownReason},
};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env()?;

    // Validate configuration
    config.validate()?;

    // Initialize logging/tracing
    logging::init_tracing(&config.server.log_level, &config.server.environment)?;

    config.log_config();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting statecache");

    let storage = Storage::open(&config.storage, config.query).await?;
    let shutdown = Shutdown::new();
    tokio::spawn(listen_for_signals(shutdown.clone()));

    let state = AppState::new(storage, shutdown.clone());

    // Log consumer: builds the materialized view
    let reader = Arc::new(KafkaLogReader::new(&config.kafka)?);
    let mut consumer = StateConsumer::new(
        reader,
        Arc::clone(&state.storage.store),
        ConsumerSettings::new(&config.kafka, &config.consumer),
        shutdown.clone(),
    );
    let consumer_task = tokio::spawn(async move { consumer.run().await });

    // Outbox worker: publishes queued writes
    let publisher = Arc::new(KafkaPublisher::new(&config.kafka)?);
    let mut worker = OutboxWorker::new(
        Arc::clone(&state.storage.outbox),
        publisher.clone(),
        OutboxSettings::from(&config.outbox),
        shutdown.clone(),
    );
    if config.outbox.wait_for_ready {
        worker = worker.wait_for(Arc::clone(&state.readiness));
    }
    let outbox_task = tokio::spawn(async move { worker.run().await });

    let monitor_task = tokio::spawn(health_monitor(state.clone(), HEALTH_CHECK_INTERVAL));

    let served = create_server(state, &config.server).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server failed");
    }
    shutdown.trigger(ShutdownReason::Requested);

    let background = async {
        if let Ok(Err(e)) = consumer_task.await {
            tracing::debug!(error = %e, "Consumer exited with error");
        }
        let _ = outbox_task.await;
        let _ = monitor_task.await;
    };
    if tokio::time::timeout(config.server.shutdown_timeout(), background)
        .await
        .is_err()
    {
        tracing::warn!("Background tasks did not stop within the shutdown timeout");
    }

    publisher.flush(config.server.shutdown_timeout());

    let reason = shutdown.reason().unwrap_or(ShutdownReason::Requested);
    tracing::info!(reason = %reason, "statecache shutdown complete");

    served?;
    if reason.is_failure() {
        std::process::exit(1);
    }
    Ok(())
}
