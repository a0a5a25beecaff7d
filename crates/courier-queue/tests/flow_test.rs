//! End-to-end flow: broker delivery → ingestion → claim → delivery stages
//!
//! Run with: cargo test -p courier-queue --test flow_test

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use courier_queue::consumer::{
    Broker, ConsumerConfig, ConsumerLoop, InMemoryBroker, IngestHandler, QueueOptions,
};
use courier_queue::persistence::{InMemoryWorkStore, TaskStatus, WorkStore};
use courier_queue::pipeline::{
    BatchReport, Pipeline, PipelineConfig, PollerConfig, ProcessorConfig, TaskProcessor,
};
use courier_queue::reliability::RetryPolicy;
use courier_queue::stages::{delivery_stages, Endpoints, HttpConfig};

const QUEUE: &str = "messages";

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Collaborator endpoints that accept everything
async fn mount_happy_collaborators(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/get_auth_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"auth_key": "issued"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/report.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"report".to_vec()))
        .mount(server)
        .await;
}

fn processor(store: Arc<InMemoryWorkStore>, server: &MockServer, retry: RetryPolicy) -> TaskProcessor {
    let client = HttpConfig::default().build_client().unwrap();
    let endpoints = Endpoints::with_base_url(&server.uri());

    let mut pipeline = Pipeline::new(store, PipelineConfig::default().with_retry(retry));
    for stage in delivery_stages(&client, &endpoints) {
        pipeline = pipeline.with_shared_stage(stage);
    }
    TaskProcessor::new(
        pipeline,
        ProcessorConfig::new().with_poller(PollerConfig::new().with_batch_size(10)),
    )
}

/// Publish raw messages and ingest them through a consumer loop
async fn ingest(store: Arc<InMemoryWorkStore>, messages: &[String]) {
    let broker = Arc::new(InMemoryBroker::new());
    broker
        .declare_queue(QUEUE, &QueueOptions::default())
        .await
        .unwrap();
    for message in messages {
        broker.publish(QUEUE, message.as_str()).unwrap();
    }

    let consumer = Arc::new(ConsumerLoop::new(
        broker.clone(),
        Arc::new(IngestHandler::new(store)),
        ConsumerConfig::new()
            .with_concurrency_limit(4)
            .with_poll_backoff(Duration::from_millis(10)),
    ));
    let handle = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.subscribe(QUEUE).await }
    });

    wait_until(|| broker.acked_count() == messages.len()).await;
    consumer.close().await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(broker.ready_count(QUEUE), 0);
}

#[test_log::test(tokio::test)]
async fn test_messages_flow_from_broker_to_delivery() {
    let server = MockServer::start().await;
    mount_happy_collaborators(&server).await;
    Mock::given(method("POST"))
        .and(path("/send_message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryWorkStore::new());
    let good = json!({
        "user_id": 1,
        "message": {"subject": "hi"},
        "attachments": [{"name": "report.txt", "url": format!("{}/files/report.txt", server.uri())}]
    });
    ingest(store.clone(), &[good.to_string(), "not json".to_string()]).await;
    assert_eq!(store.count_with_status(TaskStatus::New), 2);

    let report = processor(store.clone(), &server, RetryPolicy::default())
        .run_once()
        .await
        .unwrap();
    assert_eq!(
        report,
        BatchReport {
            claimed: 2,
            succeeded: 1,
            fatal: 1,
            ..Default::default()
        }
    );

    let mut delivered = None;
    let mut rejected = None;
    for id in 1..=2 {
        let task = store.get(id).await.unwrap().unwrap();
        match task.status {
            TaskStatus::Success => delivered = Some(task),
            TaskStatus::Fatal => rejected = Some(task),
            other => panic!("unexpected status {other}"),
        }
    }

    let delivered = delivered.expect("one task should succeed");
    let payload: Value = serde_json::from_str(&delivered.payload).unwrap();
    assert_eq!(
        payload,
        json!({
            "user_id": 1,
            "message": {"subject": "hi"},
            "auth_key": "issued",
            "attachments": {"report.txt": "cmVwb3J0"}
        })
    );
    assert!(store.errors(delivered.id).await.unwrap().is_empty());

    let rejected = rejected.expect("one task should be fatal");
    let errors = store.errors(rejected.id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].detail.starts_with("payload parse failure"));
}

#[test_log::test(tokio::test)]
async fn test_failed_send_is_retried_on_next_claim() {
    let server = MockServer::start().await;
    mount_happy_collaborators(&server).await;
    Mock::given(method("POST"))
        .and(path("/send_message"))
        .respond_with(ResponseTemplate::new(502).set_body_json(json!({"status": "fail"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/send_message"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryWorkStore::new());
    ingest(store.clone(), &[json!({"user_id": 9}).to_string()]).await;
    let processor = processor(store.clone(), &server, RetryPolicy::default());

    let first = processor.run_once().await.unwrap();
    assert_eq!(first.retrying, 1);
    let task = store.get(1).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert!(store.errors(1).await.unwrap().is_empty());

    let second = processor.run_once().await.unwrap();
    assert_eq!(second.succeeded, 1);
    let task = store.get(1).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.attempts, 2);
}

#[test_log::test(tokio::test)]
async fn test_persistent_send_failure_is_dead_lettered() {
    let server = MockServer::start().await;
    mount_happy_collaborators(&server).await;
    Mock::given(method("POST"))
        .and(path("/send_message"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"status": "fail"})))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryWorkStore::new());
    ingest(store.clone(), &[json!({"user_id": 9}).to_string()]).await;
    let processor = processor(store.clone(), &server, RetryPolicy::new(2));

    assert_eq!(processor.run_once().await.unwrap().retrying, 1);
    assert_eq!(processor.run_once().await.unwrap().exhausted, 1);
    assert_eq!(processor.run_once().await.unwrap().claimed, 0);

    let task = store.get(1).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Fatal);
    let errors = store.errors(1).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].detail.starts_with("retry limit reached after 2 attempts"));
}
