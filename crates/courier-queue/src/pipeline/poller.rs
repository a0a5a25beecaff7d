//! Batch claiming with adaptive idle backoff

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::persistence::{StoreError, TaskRecord, WorkStore};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval right after a non-empty claim
    #[serde(with = "crate::duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling while the store stays empty
    #[serde(with = "crate::duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no tasks found
    pub backoff_multiplier: f64,

    /// Maximum tasks to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Use one fixed interval regardless of idleness
    pub fn with_fixed_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Task poller with adaptive backoff
///
/// Claims batches from the store, backing off exponentially while the
/// store is empty and resetting to the minimum interval once work appears.
pub struct TaskPoller {
    store: Arc<dyn WorkStore>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown: CancellationToken,
}

impl TaskPoller {
    /// Create a new task poller
    pub fn new(
        store: Arc<dyn WorkStore>,
        config: PollerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            current_interval: config.min_interval,
            config,
            shutdown,
        }
    }

    /// Claim the next batch
    ///
    /// Returns claimed tasks and updates internal backoff state.
    #[instrument(skip(self))]
    pub async fn poll(&mut self) -> Result<Vec<TaskRecord>, StoreError> {
        if self.shutdown.is_cancelled() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let tasks = self.store.claim_batch(self.config.batch_size).await?;

        if tasks.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "No tasks found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = tasks.len(), "Claimed tasks");
        }

        Ok(tasks)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled during the wait.
    pub async fn wait(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = self.shutdown.cancelled() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}
