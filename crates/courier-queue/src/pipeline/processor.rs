//! Processing loop: claim batches and run them through the pipeline

use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::poller::{PollerConfig, TaskPoller};
use super::task::{Pipeline, TaskOutcome};
use crate::persistence::StoreError;

/// Processor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessorConfig {
    /// Claim batching and idle backoff
    pub poller: PollerConfig,

    /// Age after which a `RUNNING` task is considered abandoned (None = never reclaim)
    #[serde(with = "crate::duration_millis::option")]
    pub stale_threshold: Option<Duration>,

    /// How often abandoned tasks are looked for
    #[serde(with = "crate::duration_millis")]
    pub stale_reclaim_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            stale_threshold: None,
            stale_reclaim_interval: Duration::from_secs(30),
        }
    }
}

impl ProcessorConfig {
    /// Create a new processor configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set poller configuration
    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    /// Reclaim `RUNNING` tasks older than `threshold`
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = Some(threshold);
        self
    }

    /// Set stale task reclamation interval
    pub fn with_stale_reclaim_interval(mut self, interval: Duration) -> Self {
        self.stale_reclaim_interval = interval;
        self
    }
}

/// Processor errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Tally of one claimed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retrying: usize,
    pub fatal: usize,
    pub exhausted: usize,
    /// Attempts that were reclaimed before their outcome was written
    pub claims_lost: usize,
    /// Tasks whose outcome could not be written
    pub store_errors: usize,
}

impl BatchReport {
    fn record(&mut self, result: &Result<TaskOutcome, StoreError>) {
        match result {
            Ok(TaskOutcome::Succeeded) => self.succeeded += 1,
            Ok(TaskOutcome::Retrying { .. }) => self.retrying += 1,
            Ok(TaskOutcome::Fatal) => self.fatal += 1,
            Ok(TaskOutcome::Exhausted { .. }) => self.exhausted += 1,
            Err(StoreError::ClaimLost { .. }) => self.claims_lost += 1,
            Err(_) => self.store_errors += 1,
        }
    }
}

/// Drives claimed tasks through a [`Pipeline`]
///
/// Each iteration claims up to `batch_size` tasks, runs them concurrently
/// and waits for the whole batch before claiming again. An empty claim
/// backs off adaptively.
///
/// # Example
///
/// ```ignore
/// let processor = TaskProcessor::new(pipeline, ProcessorConfig::default());
/// let shutdown = CancellationToken::new();
///
/// tokio::spawn({
///     let shutdown = shutdown.clone();
///     async move { processor.run(shutdown).await }
/// });
///
/// // ... later
/// shutdown.cancel();
/// ```
pub struct TaskProcessor {
    pipeline: Pipeline,
    config: ProcessorConfig,
}

impl TaskProcessor {
    /// Create a new processor
    pub fn new(pipeline: Pipeline, config: ProcessorConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Claim one batch and run it to completion
    pub async fn run_once(&self) -> Result<BatchReport, ProcessorError> {
        let batch = self
            .pipeline
            .store()
            .claim_batch(self.config.poller.batch_size)
            .await?;
        Ok(self.run_batch(batch).await)
    }

    /// Run until `shutdown` is cancelled
    ///
    /// A batch already in progress is allowed to finish. Claim errors are
    /// logged and followed by a backoff wait.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ProcessorError> {
        info!(
            batch_size = self.config.poller.batch_size,
            stages = ?self.pipeline.stage_names(),
            "Starting task processor"
        );

        let mut poller = TaskPoller::new(
            self.pipeline.store().clone(),
            self.config.poller.clone(),
            shutdown.clone(),
        );
        let mut last_reclaim = Instant::now();

        loop {
            if poller.is_shutdown() {
                debug!("Processor loop: shutdown requested");
                break;
            }

            if let Some(threshold) = self.config.stale_threshold {
                if last_reclaim.elapsed() >= self.config.stale_reclaim_interval {
                    last_reclaim = Instant::now();
                    self.reclaim_stale(threshold).await;
                }
            }

            match poller.poll().await {
                Ok(batch) if !batch.is_empty() => {
                    let report = self.run_batch(batch).await;
                    debug!(?report, "Batch finished");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Claim failed: {}", e);
                }
            }

            if poller.wait().await {
                break;
            }
        }

        info!("Task processor stopped");
        Ok(())
    }

    async fn run_batch(&self, batch: Vec<crate::persistence::TaskRecord>) -> BatchReport {
        let mut report = BatchReport {
            claimed: batch.len(),
            ..Default::default()
        };

        let tasks = batch.into_iter().map(|record| {
            let task = self.pipeline.task(record);
            let id = task.id();
            async move { (id, task.run().await) }
        });

        for (id, result) in join_all(tasks).await {
            match &result {
                Err(StoreError::ClaimLost { attempt, .. }) => {
                    warn!(task_id = id, attempt, "Outcome dropped, task was reclaimed");
                }
                Err(e) => error!(task_id = id, "Failed to record task outcome: {}", e),
                Ok(_) => {}
            }
            report.record(&result);
        }

        report
    }

    async fn reclaim_stale(&self, threshold: Duration) {
        match self.pipeline.store().reclaim_stale(threshold).await {
            Ok(reclaimed) => {
                if !reclaimed.is_empty() {
                    warn!(count = reclaimed.len(), "Reclaimed stale tasks");
                }
            }
            Err(e) => {
                error!("Stale task reclamation failed: {}", e);
            }
        }
    }
}
