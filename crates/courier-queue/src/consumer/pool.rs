//! Concurrency-bounded consumer loop
//!
//! Pulls deliveries from a broker queue and runs each one as a spawned unit
//! holding one of `concurrency_limit` slots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::broker::{Broker, BrokerError, Delivery, DeliveryTag, QueueOptions};
use super::handler::{HandlerError, MessageHandler};

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    /// Maximum deliveries handled at once
    pub concurrency_limit: usize,

    /// Wait after an empty fetch
    #[serde(with = "crate::duration_millis")]
    pub poll_backoff: Duration,

    /// Options used when declaring the subscribed queue
    pub queue_options: QueueOptions,

    /// How long `close()` waits for in-flight units to release their slots
    #[serde(with = "crate::duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            poll_backoff: Duration::from_secs(1),
            queue_options: QueueOptions::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    /// Create a new consumer configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set concurrency limit
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Set empty-poll backoff
    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Set queue declaration options
    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Consumer loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not pulling new deliveries (initial)
    Stopped,
    /// Pulling deliveries while slots are available
    Running,
}

/// Consumer errors
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Another `subscribe` call is already driving this consumer
    #[error("consumer is already subscribed")]
    AlreadyRunning,

    #[error("in-flight deliveries did not finish before the shutdown timeout")]
    ShutdownTimeout,
}

type Registry = Arc<Mutex<HashMap<DeliveryTag, CancellationToken>>>;

struct Shared {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    slots: Arc<Semaphore>,
    in_flight: Registry,
    state: watch::Sender<ConsumerState>,
    /// Parent of every unit token
    units: CancellationToken,
}

impl Shared {
    fn start(&self) {
        if self.state.send_replace(ConsumerState::Running) == ConsumerState::Stopped {
            info!("Consumer started");
        }
    }

    fn stop(&self) {
        if self.state.send_replace(ConsumerState::Stopped) == ConsumerState::Running {
            info!("Consumer stopped");
        }
    }

    fn cancel_in_flight(&self) {
        let count = self.in_flight.lock().len();
        if count > 0 {
            warn!(count, "Cancelling in-flight deliveries");
        }
        self.units.cancel();
    }

    /// Register the delivery, then spawn its unit
    fn dispatch(&self, delivery: Delivery, permit: OwnedSemaphorePermit) {
        let tag = delivery.tag;
        let token = self.units.child_token();
        self.in_flight.lock().insert(tag, token.clone());

        let guard = UnitGuard {
            tag,
            in_flight: Arc::clone(&self.in_flight),
            _permit: permit,
        };
        let broker = Arc::clone(&self.broker);
        let handler = Arc::clone(&self.handler);

        tokio::spawn(async move {
            let _guard = guard;

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(delivery_tag = tag, "Delivery cancelled before completion");
                    return;
                }
                result = handle_body(handler.as_ref(), &delivery.body) => result,
            };

            match result {
                Ok(()) => {
                    if let Err(e) = broker.ack(tag).await {
                        error!(delivery_tag = tag, "Failed to ack delivery: {}", e);
                    }
                }
                Err(e) => {
                    warn!(delivery_tag = tag, "Delivery rejected: {}", e);
                    if let Err(e) = broker.nack(tag).await {
                        error!(delivery_tag = tag, "Failed to nack delivery: {}", e);
                    }
                }
            }
        });
    }
}

async fn handle_body(handler: &dyn MessageHandler, body: &[u8]) -> Result<(), HandlerError> {
    let message = std::str::from_utf8(body)
        .map_err(|e| HandlerError::Rejected(format!("body is not valid UTF-8: {e}")))?;
    handler.handle(message).await
}

/// Releases a unit's slot and registry entry however the unit ends
struct UnitGuard {
    tag: DeliveryTag,
    in_flight: Registry,
    _permit: OwnedSemaphorePermit,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.tag);
    }
}

async fn until_stopped(state: &mut watch::Receiver<ConsumerState>) {
    let _ = state.wait_for(|s| *s == ConsumerState::Stopped).await;
}

/// Concurrency-bounded broker consumer
///
/// Each delivery is handed to the [`MessageHandler`] in its own task; a
/// successful result is acked and any error nacks the delivery. When the
/// broker channel closes, the loop stops and every in-flight unit is
/// cancelled without acking or nacking, leaving redelivery to the broker.
///
/// # Example
///
/// ```ignore
/// let consumer = Arc::new(ConsumerLoop::new(broker, handler, ConsumerConfig::default()));
///
/// tokio::spawn({
///     let consumer = consumer.clone();
///     async move { consumer.subscribe("messages").await }
/// });
///
/// // ... later
/// consumer.close().await?;
/// ```
pub struct ConsumerLoop {
    shared: Arc<Shared>,
    observer: Mutex<Option<JoinHandle<()>>>,
    subscribed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl ConsumerLoop {
    /// Create a consumer and start watching the broker's close signal
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn MessageHandler>,
        mut config: ConsumerConfig,
    ) -> Self {
        // A deserialized config can bypass the builder's clamp
        config.concurrency_limit = config.concurrency_limit.max(1);
        let (state, _) = watch::channel(ConsumerState::Stopped);
        let shared = Arc::new(Shared {
            slots: Arc::new(Semaphore::new(config.concurrency_limit)),
            broker,
            handler,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            state,
            units: CancellationToken::new(),
        });

        let observer = tokio::spawn({
            let shared = Arc::clone(&shared);
            let signal = shared.broker.close_signal();
            async move {
                signal.cancelled().await;
                error!("Broker channel closed");
                shared.stop();
                shared.cancel_in_flight();
            }
        });

        Self {
            shared,
            observer: Mutex::new(Some(observer)),
            subscribed: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.shared.start();
    }

    /// Stop pulling new deliveries; in-flight units keep running
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Declare `queue_name` and consume it until stopped
    ///
    /// Returns once the consumer is stopped, either by [`stop`](Self::stop),
    /// [`close`](Self::close) or the broker closing the channel.
    #[instrument(skip(self))]
    pub async fn subscribe(&self, queue_name: &str) -> Result<(), ConsumerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed.into());
        }
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyRunning);
        }
        let _subscription = Subscription(Arc::clone(&self.subscribed));

        self.shared
            .broker
            .declare_queue(queue_name, &self.shared.config.queue_options)
            .await?;
        self.start();
        info!(
            queue = queue_name,
            concurrency_limit = self.shared.config.concurrency_limit,
            "Subscribed"
        );

        let mut state = self.shared.state.subscribe();
        loop {
            if *state.borrow() == ConsumerState::Stopped {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.shared.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = until_stopped(&mut state) => break,
            };

            match self.shared.broker.fetch_next(queue_name).await {
                Ok(Some(delivery)) => {
                    debug!(delivery_tag = delivery.tag, "Received delivery");
                    self.shared.dispatch(delivery, permit);
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                }
                Err(BrokerError::ChannelClosed) => {
                    drop(permit);
                    warn!(queue = queue_name, "Channel closed while fetching");
                    self.stop();
                    break;
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = queue_name, "Fetch failed: {}", e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.shared.config.poll_backoff) => {}
                _ = until_stopped(&mut state) => break,
            }
        }

        debug!(queue = queue_name, "Subscription loop exited");
        Ok(())
    }

    /// Stop, cancel in-flight units, close the channel and wait for slots to drain
    ///
    /// Calling it again is a no-op.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), ConsumerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing consumer");
        self.stop();
        if let Some(observer) = self.observer.lock().take() {
            observer.abort();
        }
        self.shared.cancel_in_flight();

        if let Err(e) = self.shared.broker.close().await {
            warn!("Failed to close broker channel: {}", e);
        }

        let limit = self.shared.config.concurrency_limit;
        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_timeout;
        loop {
            let available = self.shared.slots.available_permits();
            if available == limit {
                debug!("All slots released");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = limit - available,
                    "Shutdown timeout reached"
                );
                return Err(ConsumerError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!("Consumer closed");
        Ok(())
    }

    /// Deliveries currently being handled
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    pub fn available_slots(&self) -> usize {
        self.shared.slots.available_permits()
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state.borrow()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.config
    }
}

impl Drop for ConsumerLoop {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.lock().take() {
            observer.abort();
        }
    }
}

struct Subscription(Arc<AtomicBool>);

impl Drop for Subscription {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::consumer::InMemoryBroker;

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

    async fn broker() -> Arc<InMemoryBroker> {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .declare_queue(QUEUE, &QueueOptions::default())
            .await
            .unwrap();
        broker
    }

    fn spawn_subscribe(consumer: &Arc<ConsumerLoop>) -> JoinHandle<Result<(), ConsumerError>> {
        let consumer = Arc::clone(consumer);
        tokio::spawn(async move { consumer.subscribe(QUEUE).await })
    }

    /// Records messages; rejects anything starting with "bad"
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle(&self, message: &str) -> Result<(), HandlerError> {
            self.seen.lock().push(message.to_string());
            if message.starts_with("bad") {
                return Err(HandlerError::Rejected("bad message".to_string()));
            }
            Ok(())
        }
    }

    /// Tracks peak concurrency
    #[derive(Default)]
    struct Slow {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Slow {
        async fn handle(&self, _message: &str) -> Result<(), HandlerError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Never finishes on its own
    #[derive(Default)]
    struct Stuck {
        started: AtomicUsize,
        notify: Notify,
    }

    #[async_trait]
    impl MessageHandler for Stuck {
        async fn handle(&self, _message: &str) -> Result<(), HandlerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.notify.notified().await;
            Ok(())
        }
    }

    fn config(limit: usize) -> ConsumerConfig {
        ConsumerConfig::new()
            .with_concurrency_limit(limit)
            .with_poll_backoff(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_successful_deliveries_are_acked() {
        let broker = broker().await;
        for i in 0..3 {
            broker.publish(QUEUE, format!("message-{i}")).unwrap();
        }
        let handler = Arc::new(Recording::default());
        let consumer = Arc::new(ConsumerLoop::new(broker.clone(), handler.clone(), config(2)));

        let handle = spawn_subscribe(&consumer);
        wait_until(|| broker.acked_count() == 3).await;
        assert_eq!(consumer.state(), ConsumerState::Running);

        consumer.stop();
        handle.await.unwrap().unwrap();

        let mut seen = handler.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["message-0", "message-1", "message-2"]);
        assert_eq!(broker.nacked_count(), 0);
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(consumer.available_slots(), 2);
    }

    async fn consume_until_nacked(body: Vec<u8>) -> (Arc<InMemoryBroker>, Arc<Recording>) {
        let broker = broker().await;
        broker.publish(QUEUE, body).unwrap();
        let handler = Arc::new(Recording::default());
        let consumer = Arc::new(ConsumerLoop::new(broker.clone(), handler.clone(), config(1)));

        let handle = spawn_subscribe(&consumer);
        wait_until(|| broker.nacked_count() >= 1).await;
        consumer.stop();
        handle.await.unwrap().unwrap();
        (broker, handler)
    }

    #[tokio::test]
    async fn test_rejected_delivery_is_nacked() {
        let (broker, handler) = consume_until_nacked(b"bad payload".to_vec()).await;

        assert_eq!(broker.acked_count(), 0);
        assert_eq!(handler.seen.lock()[0], "bad payload");
    }

    #[tokio::test]
    async fn test_undecodable_delivery_is_nacked_without_reaching_handler() {
        let (broker, handler) = consume_until_nacked(vec![0xff, 0xfe]).await;

        assert_eq!(broker.acked_count(), 0);
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let broker = broker().await;
        for i in 0..12 {
            broker.publish(QUEUE, format!("{i}")).unwrap();
        }
        let handler = Arc::new(Slow::default());
        let consumer = Arc::new(ConsumerLoop::new(broker.clone(), handler.clone(), config(3)));

        let handle = spawn_subscribe(&consumer);
        wait_until(|| broker.acked_count() == 12).await;
        consumer.stop();
        handle.await.unwrap().unwrap();

        let peak = handler.peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak concurrency was {peak}");
    }

    #[tokio::test]
    async fn test_channel_close_cancels_in_flight_units() {
        let broker = broker().await;
        for i in 0..3 {
            broker.publish(QUEUE, format!("{i}")).unwrap();
        }
        let handler = Arc::new(Stuck::default());
        let consumer = Arc::new(ConsumerLoop::new(broker.clone(), handler.clone(), config(3)));

        let handle = spawn_subscribe(&consumer);
        wait_until(|| handler.started.load(Ordering::SeqCst) == 3).await;
        assert_eq!(consumer.in_flight(), 3);
        assert_eq!(consumer.available_slots(), 0);

        broker.close().await.unwrap();
        handle.await.unwrap().unwrap();
        wait_until(|| consumer.in_flight() == 0 && consumer.available_slots() == 3).await;

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(broker.acked_count(), 0);
        assert_eq!(broker.nacked_count(), 0);
        // Unacked deliveries went back to the queue
        assert_eq!(broker.ready_count(QUEUE), 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = broker().await;
        broker.publish(QUEUE, "x").unwrap();
        let handler = Arc::new(Stuck::default());
        let consumer = Arc::new(ConsumerLoop::new(broker.clone(), handler.clone(), config(2)));

        let handle = spawn_subscribe(&consumer);
        wait_until(|| handler.started.load(Ordering::SeqCst) == 1).await;

        consumer.close().await.unwrap();
        handle.await.unwrap().unwrap();
        assert!(broker.is_closed());
        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(consumer.available_slots(), 2);

        consumer.close().await.unwrap();
        assert!(matches!(
            consumer.subscribe(QUEUE).await,
            Err(ConsumerError::Broker(BrokerError::ChannelClosed))
        ));
    }

    #[tokio::test]
    async fn test_second_subscribe_is_rejected() {
        let broker = broker().await;
        let consumer = Arc::new(ConsumerLoop::new(
            broker.clone(),
            Arc::new(Recording::default()),
            config(1),
        ));

        let handle = spawn_subscribe(&consumer);
        wait_until(|| consumer.state() == ConsumerState::Running).await;

        assert!(matches!(
            consumer.subscribe(QUEUE).await,
            Err(ConsumerError::AlreadyRunning)
        ));

        consumer.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_interrupts_empty_poll_backoff() {
        let broker = broker().await;
        let consumer = Arc::new(ConsumerLoop::new(
            broker.clone(),
            Arc::new(Recording::default()),
            config(1).with_poll_backoff(Duration::from_secs(3600)),
        ));

        let handle = spawn_subscribe(&consumer);
        wait_until(|| consumer.state() == ConsumerState::Running).await;
        consumer.stop();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("subscribe did not return after stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_concurrency_limit_still_consumes() {
        let broker = broker().await;
        broker.publish(QUEUE, "only").unwrap();
        let consumer = Arc::new(ConsumerLoop::new(
            broker.clone(),
            Arc::new(Recording::default()),
            ConsumerConfig {
                concurrency_limit: 0,
                ..config(1)
            },
        ));
        assert_eq!(consumer.config().concurrency_limit, 1);
        assert_eq!(consumer.available_slots(), 1);

        let handle = spawn_subscribe(&consumer);
        wait_until(|| broker.acked_count() == 1).await;

        consumer.stop();
        handle.await.unwrap().unwrap();
    }
}
