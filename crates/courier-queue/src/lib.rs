//! # Courier Task Queue
//!
//! A PostgreSQL-backed, at-least-once task queue for outbound message delivery.
//!
//! ## Features
//!
//! - **Atomic batch claims**: tasks move to `RUNNING` in one serializable transaction
//! - **Ordered stage pipeline**: retryable failures are re-claimed, fatal ones are recorded
//! - **Bounded broker consumption**: a fixed number of in-flight deliveries, cancelled safely on close
//! - **Dead-lettering**: tasks that keep failing end `FATAL` with a diagnostic
//!
//! ## Architecture
//!
//! ```text
//!   broker ──► ConsumerLoop ──► IngestHandler ──► WorkStore::create      (NEW)
//!
//!   TaskProcessor ──► WorkStore::claim_batch                             (RUNNING)
//!         │
//!         ▼
//!   Task::run ──► auth_refresh ──► attachment_loader ──► message_sender
//!         │
//!         ▼
//!   mark_success (SUCCESS) | mark_failure (FAILURE) | mark_fatal (FATAL + error row)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use courier_queue::prelude::*;
//!
//! let store = Arc::new(PostgresWorkStore::new(pool));
//! let client = HttpConfig::default().build_client()?;
//!
//! let mut pipeline = Pipeline::new(store, PipelineConfig::default());
//! for stage in delivery_stages(&client, &Endpoints::default()) {
//!     pipeline = pipeline.with_shared_stage(stage);
//! }
//!
//! TaskProcessor::new(pipeline, ProcessorConfig::default())
//!     .run(shutdown)
//!     .await?;
//! ```

pub mod consumer;
pub mod persistence;
pub mod pipeline;
pub mod reliability;
pub mod stages;

pub(crate) mod duration_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::consumer::{
        Broker, BrokerError, ConsumerConfig, ConsumerError, ConsumerLoop, HandlerError,
        InMemoryBroker, IngestHandler, MessageHandler, QueueOptions,
    };
    pub use crate::persistence::{
        InMemoryWorkStore, PostgresWorkStore, StoreError, TaskId, TaskRecord, TaskStatus,
        WorkStore,
    };
    pub use crate::pipeline::{
        stage_fn, Payload, Pipeline, PipelineConfig, PollerConfig, ProcessorConfig,
        RetryableKind, Stage, StageError, TaskOutcome, TaskProcessor,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::stages::{delivery_stages, Endpoints, HttpConfig};
}

// Re-export key types at crate root
pub use consumer::{ConsumerConfig, ConsumerError, ConsumerLoop, InMemoryBroker, IngestHandler};
pub use persistence::{
    InMemoryWorkStore, PostgresWorkStore, StoreError, TaskId, TaskRecord, TaskStatus, WorkStore,
};
pub use pipeline::{Pipeline, PipelineConfig, Stage, StageError, TaskOutcome, TaskProcessor};
pub use reliability::RetryPolicy;
