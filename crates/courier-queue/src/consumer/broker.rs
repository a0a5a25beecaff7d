//! Broker channel abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Channel-scoped delivery identifier
pub type DeliveryTag = u64;

/// A message pulled from a queue, awaiting ack or nack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
}

/// Queue declaration options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,

    /// Restrict the queue to the declaring connection
    pub exclusive: bool,

    /// Delete the queue once the last consumer goes away
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Broker errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(DeliveryTag),

    /// The channel is gone; no further operation will succeed
    #[error("broker channel closed")]
    ChannelClosed,

    #[error("broker transport error: {0}")]
    Transport(String),
}

/// A pull-mode broker channel
///
/// Unacknowledged deliveries are returned to their queue when the channel
/// closes, which is what makes consumption at-least-once.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declare a queue; declaring an existing queue is a no-op
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    /// Pull one message, or `None` when the queue is empty
    async fn fetch_next(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Reject a delivery and requeue it
    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Token cancelled once, when the channel closes for any reason
    fn close_signal(&self) -> CancellationToken;

    async fn close(&self) -> Result<(), BrokerError>;
}
