use std::sync::Arc;

use anyhow::{Context, Result};
use courier_queue::persistence::PostgresWorkStore;
use courier_queue::pipeline::{Pipeline, TaskProcessor};
use courier_queue::stages::delivery_stages;
use courier_worker::{init_telemetry, TelemetryConfig, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging via RUST_LOG or LOG_LEVEL (default: courier_worker=debug,courier_queue=info)
    init_telemetry(&TelemetryConfig::from_env());

    tracing::info!("courier-worker starting...");

    let config = WorkerConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.claim_batch_size.max(1) as u32 + 2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let store = Arc::new(PostgresWorkStore::new(pool));
    store.migrate().await.context("Failed to run migrations")?;

    let client = config
        .http_config()
        .build_client()
        .context("Failed to build HTTP client")?;
    let mut pipeline = Pipeline::new(store, config.pipeline_config());
    for stage in delivery_stages(&client, &config.endpoints) {
        pipeline = pipeline.with_shared_stage(stage);
    }

    tracing::info!(
        batch_size = config.claim_batch_size,
        max_attempts = config.max_attempts,
        send_message_url = %config.endpoints.send_message_url,
        "Starting task processor"
    );

    let processor = TaskProcessor::new(pipeline, config.processor_config());
    let shutdown = CancellationToken::new();
    let mut run = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { processor.run(shutdown).await }
    });

    // Run the processor (blocks until shutdown)
    let interrupted = tokio::select! {
        result = &mut run => {
            result.context("Task processor panicked")??;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        tracing::info!("Received shutdown signal");
        shutdown.cancel();

        match config.shutdown_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result.context("Task processor panicked")??,
                Err(_) => tracing::warn!(
                    stale_threshold = ?config.stale_threshold,
                    "Shutdown timeout reached; unfinished tasks stay RUNNING until a worker reclaims them"
                ),
            },
            None => run.await.context("Task processor panicked")??,
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
