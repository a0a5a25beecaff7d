//! In-memory broker for tests and local runs

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::broker::*;

#[derive(Default)]
struct Channel {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashMap<DeliveryTag, (String, Vec<u8>)>,
    next_tag: DeliveryTag,
    acked: usize,
    nacked: usize,
}

/// In-memory [`Broker`]
///
/// Nacked deliveries go back to the head of their queue. Closing the channel
/// requeues every unacknowledged delivery and fires the close signal.
pub struct InMemoryBroker {
    channel: Mutex<Channel>,
    closed: CancellationToken,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            channel: Mutex::new(Channel {
                next_tag: 1,
                ..Default::default()
            }),
            closed: CancellationToken::new(),
        }
    }

    /// Append a message to a declared queue
    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut channel = self.channel.lock();
        let messages = channel
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        messages.push_back(body.into());
        Ok(())
    }

    /// Messages waiting in `queue`
    pub fn ready_count(&self, queue: &str) -> usize {
        self.channel
            .lock()
            .queues
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Deliveries handed out but neither acked nor nacked
    pub fn unacked_count(&self) -> usize {
        self.channel.lock().unacked.len()
    }

    pub fn acked_count(&self) -> usize {
        self.channel.lock().acked
    }

    pub fn nacked_count(&self) -> usize {
        self.channel.lock().nacked
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, name: &str, _options: &QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.channel
            .lock()
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn fetch_next(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_open()?;
        let mut channel = self.channel.lock();
        let body = match channel.queues.get_mut(queue) {
            Some(messages) => messages.pop_front(),
            None => return Err(BrokerError::QueueNotFound(queue.to_string())),
        };
        let Some(body) = body else {
            return Ok(None);
        };

        let tag = channel.next_tag;
        channel.next_tag += 1;
        channel
            .unacked
            .insert(tag, (queue.to_string(), body.clone()));
        Ok(Some(Delivery { tag, body }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut channel = self.channel.lock();
        channel
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        channel.acked += 1;
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut channel = self.channel.lock();
        let (queue, body) = channel
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        channel.queues.entry(queue).or_default().push_front(body);
        channel.nacked += 1;
        Ok(())
    }

    fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }

        {
            let mut channel = self.channel.lock();
            let mut pending: Vec<_> = channel.unacked.drain().collect();
            pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, (queue, body)) in pending {
                channel.queues.entry(queue).or_default().push_front(body);
            }
        }

        debug!("In-memory broker channel closed");
        self.closed.cancel();
        Ok(())
    }
}
