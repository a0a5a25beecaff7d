use std::sync::Arc;

use anyhow::{Context, Result};
use courier_queue::consumer::ConsumerConfig;
use courier_queue::persistence::PostgresWorkStore;
use courier_worker::seed::{ingest_messages, sample_message, seed_queue_options};
use courier_worker::{init_telemetry, TelemetryConfig, WorkerConfig};
use sqlx::PgPool;

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(&TelemetryConfig::from_env());

    let config = WorkerConfig::from_env()?;
    let count: u64 = match std::env::var("SEED_COUNT") {
        Ok(raw) => raw.parse().context("SEED_COUNT must be a number")?,
        Err(_) => 100,
    };

    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let store = Arc::new(PostgresWorkStore::new(pool));
    store.migrate().await.context("Failed to run migrations")?;

    let messages: Vec<_> = (1..=count).map(sample_message).collect();
    let ingested = ingest_messages(
        store,
        &config.queue_name,
        &messages,
        ConsumerConfig::new().with_queue_options(seed_queue_options()),
    )
    .await?;

    tracing::info!(ingested, "Seeding complete");
    Ok(())
}
