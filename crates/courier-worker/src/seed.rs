//! Sample message generation and ingestion through the consumer loop

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use courier_queue::consumer::{
    Broker, ConsumerConfig, ConsumerLoop, InMemoryBroker, IngestHandler, QueueOptions,
};
use courier_queue::persistence::WorkStore;
use serde_json::{json, Value};
use tracing::info;

const SAMPLE_ATTACHMENT_URL: &str = "https://www.python.org/static/opengraph-icon-200x200.png";

/// A delivery request shaped like the ones the pipeline expects
pub fn sample_message(user_id: u64) -> Value {
    json!({
        "user_id": user_id,
        "message": {},
        "attachments": [
            {"name": "icon1.png", "url": SAMPLE_ATTACHMENT_URL},
            {"name": "icon2.png", "url": SAMPLE_ATTACHMENT_URL},
        ]
    })
}

/// Publish `messages` to a local broker queue and consume them into `store`
///
/// Returns once every message has been acked, i.e. persisted as a `NEW` task.
pub async fn ingest_messages(
    store: Arc<dyn WorkStore>,
    queue_name: &str,
    messages: &[Value],
    config: ConsumerConfig,
) -> Result<usize> {
    let broker = Arc::new(InMemoryBroker::new());
    broker
        .declare_queue(queue_name, &config.queue_options)
        .await?;
    for message in messages {
        broker.publish(queue_name, message.to_string())?;
    }

    let consumer = Arc::new(ConsumerLoop::new(
        broker.clone(),
        Arc::new(IngestHandler::new(store)),
        config,
    ));
    let subscription = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        let queue_name = queue_name.to_string();
        async move { consumer.subscribe(&queue_name).await }
    });

    while broker.acked_count() < messages.len() {
        if subscription.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    consumer.close().await?;
    subscription.await??;

    info!(count = messages.len(), queue = queue_name, "Ingested messages");
    Ok(broker.acked_count())
}

/// Queue options used by the seeding tool
pub fn seed_queue_options() -> QueueOptions {
    QueueOptions {
        durable: false,
        auto_delete: true,
        ..QueueOptions::default()
    }
}
