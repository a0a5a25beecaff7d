//! Task execution: fold a claimed task's payload through the stage chain
//! and record the outcome in the store.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::stage::{Payload, RetryableKind, Stage, StageError};
use crate::persistence::{StoreError, TaskId, TaskRecord, WorkStore};
use crate::reliability::{run_with_timeout, RetryPolicy};

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Deadline for a single stage (None = unbounded)
    #[serde(with = "crate::duration_millis::option")]
    pub stage_timeout: Option<Duration>,

    /// Retry bound for retryable failures
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Some(Duration::from_secs(30)),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new pipeline configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-stage timeout
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    /// Run stages without a deadline
    pub fn without_stage_timeout(mut self) -> Self {
        self.stage_timeout = None;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// All stages passed; task is `SUCCESS`
    Succeeded,
    /// A stage failed transiently; task is back in `FAILURE`
    Retrying { kind: RetryableKind },
    /// Unparsable payload or a fatal stage error; task is `FATAL`
    Fatal,
    /// Retryable failure with no attempts left; task is `FATAL`
    Exhausted { attempts: u32 },
}

/// An ordered stage chain bound to a store
///
/// # Example
///
/// ```ignore
/// let pipeline = Pipeline::new(store, PipelineConfig::default())
///     .with_stage(AuthRefresh::new(client.clone(), &check_url, &issue_url))
///     .with_stage(AttachmentLoader::new(client.clone()))
///     .with_stage(MessageSender::new(client, &send_url));
///
/// for record in store.claim_batch(10).await? {
///     pipeline.task(record).run().await?;
/// }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn WorkStore>,
    stages: Arc<Vec<Arc<dyn Stage>>>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a pipeline with no stages
    pub fn new(store: Arc<dyn WorkStore>, config: PipelineConfig) -> Self {
        Self {
            store,
            stages: Arc::new(Vec::new()),
            config,
        }
    }

    /// Append a stage to the end of the chain
    pub fn with_stage(mut self, stage: impl Stage) -> Self {
        Arc::make_mut(&mut self.stages).push(Arc::new(stage));
        self
    }

    /// Append an already shared stage
    pub fn with_shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        Arc::make_mut(&mut self.stages).push(stage);
        self
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    /// Build the runtime task for one claimed record
    pub fn task(&self, record: TaskRecord) -> Task {
        Task {
            id: record.id,
            payload: record.payload,
            attempt: record.attempts,
            stages: Arc::clone(&self.stages),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

/// A stage failure together with the stage that raised it
struct StageFailure {
    stage: String,
    error: StageError,
}

/// One processing attempt of a claimed task
///
/// Holds no durable state of its own: every outcome is written through the
/// store before [`Task::run`] returns.
pub struct Task {
    id: TaskId,
    payload: String,
    attempt: u32,
    stages: Arc<Vec<Arc<dyn Stage>>>,
    store: Arc<dyn WorkStore>,
    config: PipelineConfig,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Run the attempt and persist its outcome
    ///
    /// Stage errors are classified here and never escape; only store
    /// errors are returned. Every write is guarded by this attempt's claim,
    /// so an attempt that was reclaimed meanwhile gets
    /// [`StoreError::ClaimLost`] and leaves the task untouched.
    #[instrument(skip(self), fields(task_id = self.id, attempt = self.attempt))]
    pub async fn run(self) -> Result<TaskOutcome, StoreError> {
        let payload: Payload = match serde_json::from_str(&self.payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "task payload is not valid JSON");
                let detail = format!("payload parse failure: {e}");
                self.store.mark_fatal(self.id, self.attempt, &detail).await?;
                return Ok(TaskOutcome::Fatal);
            }
        };

        match self.fold(payload).await {
            Ok(payload) => {
                self.store
                    .mark_success(self.id, self.attempt, &payload.to_string())
                    .await?;
                info!("task succeeded");
                Ok(TaskOutcome::Succeeded)
            }
            Err(StageFailure {
                stage,
                error: StageError::Retryable { kind, message },
            }) => {
                if self.config.retry.has_attempts_remaining(self.attempt) {
                    warn!(%stage, %kind, %message, "task failed, will retry");
                    self.store.mark_failure(self.id, self.attempt).await?;
                    Ok(TaskOutcome::Retrying { kind })
                } else {
                    error!(%stage, %kind, %message, "task failed, retry limit reached");
                    let detail = format!(
                        "retry limit reached after {} attempts; last failure in stage '{}': {} error: {}",
                        self.attempt, stage, kind, message
                    );
                    self.store.mark_fatal(self.id, self.attempt, &detail).await?;
                    Ok(TaskOutcome::Exhausted {
                        attempts: self.attempt,
                    })
                }
            }
            Err(StageFailure {
                stage,
                error: StageError::Fatal { diagnostic },
            }) => {
                error!(%stage, %diagnostic, "task failed fatally");
                let detail = format!("stage '{stage}' failed: {diagnostic}");
                self.store.mark_fatal(self.id, self.attempt, &detail).await?;
                Ok(TaskOutcome::Fatal)
            }
        }
    }

    async fn fold(&self, mut payload: Payload) -> Result<Payload, StageFailure> {
        for stage in self.stages.iter() {
            debug!(stage = stage.name(), "running stage");

            let guarded = AssertUnwindSafe(stage.apply(payload)).catch_unwind();
            payload = match run_with_timeout(self.config.stage_timeout, guarded).await {
                Ok(Ok(Ok(next))) => next,
                Ok(Ok(Err(error))) => {
                    return Err(StageFailure {
                        stage: stage.name().to_string(),
                        error,
                    })
                }
                Ok(Err(panic)) => {
                    return Err(StageFailure {
                        stage: stage.name().to_string(),
                        error: StageError::fatal(format!("panicked: {}", panic_message(&*panic))),
                    })
                }
                Err(timeout) => {
                    return Err(StageFailure {
                        stage: stage.name().to_string(),
                        error: StageError::retryable(RetryableKind::Timeout, timeout.to_string()),
                    })
                }
            };
        }
        Ok(payload)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
