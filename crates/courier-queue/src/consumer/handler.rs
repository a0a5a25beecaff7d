//! Message handlers invoked for each delivery

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::persistence::{StoreError, WorkStore};

/// Handler errors; any of them causes the delivery to be nacked
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The message itself is unusable
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// Processes one decoded broker message
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &str) -> Result<(), HandlerError>;
}

/// Persists each inbound message as a new task
pub struct IngestHandler {
    store: Arc<dyn WorkStore>,
}

impl IngestHandler {
    pub fn new(store: Arc<dyn WorkStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for IngestHandler {
    async fn handle(&self, message: &str) -> Result<(), HandlerError> {
        let id = self.store.create(message).await?;
        debug!(task_id = id, "Ingested message");
        Ok(())
    }
}
