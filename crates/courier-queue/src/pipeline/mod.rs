//! Task pipeline
//!
//! A claimed task's payload is parsed as JSON and folded through an ordered
//! list of [`Stage`]s. The first failure stops the chain:
//!
//! - [`StageError::Retryable`] returns the task to `FAILURE` so it is claimed again
//! - [`StageError::Fatal`] moves it to `FATAL` and appends a diagnostic
//!
//! When every stage succeeds the final payload is stored and the task
//! becomes `SUCCESS`. [`TaskProcessor`] drives claimed batches through a
//! [`Pipeline`] until shut down.

mod poller;
mod processor;
mod stage;
mod task;

pub use poller::{PollerConfig, TaskPoller};
pub use processor::{BatchReport, ProcessorConfig, ProcessorError, TaskProcessor};
pub use stage::{stage_fn, FnStage, Payload, RetryableKind, Stage, StageError};
pub use task::{Pipeline, PipelineConfig, Task, TaskOutcome};
