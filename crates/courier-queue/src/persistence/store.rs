//! WorkStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned task identifier
pub type TaskId = i64;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Claim transaction kept failing serialization
    #[error("claim conflict: serialization failed after {attempts} attempts")]
    Conflict { attempts: u32 },

    /// A status string read back from the store is not part of the lifecycle
    #[error("invalid task status: {0}")]
    InvalidStatus(String),

    /// The attempt no longer owns the task: it was reclaimed, re-claimed
    /// or already finished
    #[error("claim lost: task {id} is no longer RUNNING under attempt {attempt}")]
    ClaimLost { id: TaskId, attempt: u32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

/// Task lifecycle status
///
/// ```text
/// NEW ──┐
///       ├─(claim)─> RUNNING ─┬─> SUCCESS   (terminal)
/// FAILURE ┘                  ├─> FAILURE   (re-claimable)
///                            └─> FATAL     (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Running,
    Success,
    Failure,
    Fatal,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Fatal => "FATAL",
        }
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::New | Self::Failure)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fatal)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "FATAL" => Ok(Self::Fatal),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// A persisted task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Opaque serialized payload, parsed only by the pipeline
    pub payload: String,
    pub status: TaskStatus,
    /// Number of times this task has been claimed
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An append-only diagnostic attached to a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub id: i64,
    pub task_id: TaskId,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Durable store for tasks and their error log
///
/// Implementations must be thread-safe and support concurrent access.
/// `claim_batch` must hand every eligible row to exactly one caller.
#[async_trait]
pub trait WorkStore: Send + Sync + 'static {
    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Insert a new task in `NEW` and return its id
    async fn create(&self, payload: &str) -> Result<TaskId, StoreError>;

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Atomically move up to `limit` tasks in `NEW`/`FAILURE` to `RUNNING`
    ///
    /// Returns the claimed records with their post-claim state. An empty
    /// result has no side effects.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError>;

    /// Move `RUNNING` tasks untouched for longer than `threshold` back to `FAILURE`
    async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<TaskId>, StoreError>;

    // =========================================================================
    // Outcomes
    // =========================================================================

    /// Update a task's status without a claim check
    ///
    /// Idempotent for repeated writes of the same status.
    async fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<(), StoreError>;

    /// Append a diagnostic to the task's error log
    async fn record_error(&self, id: TaskId, detail: &str) -> Result<(), StoreError>;

    // Claim-guarded writes: each applies only while the task is `RUNNING`
    // with `attempts == attempt`, and fails with `ClaimLost` otherwise.

    /// Release a failed attempt back to `FAILURE`
    async fn mark_failure(&self, id: TaskId, attempt: u32) -> Result<(), StoreError>;

    /// Set `FATAL` and append the diagnostic as one atomic unit
    async fn mark_fatal(&self, id: TaskId, attempt: u32, detail: &str) -> Result<(), StoreError>;

    /// Set `SUCCESS` and store the final payload as one atomic unit
    async fn mark_success(&self, id: TaskId, attempt: u32, payload: &str)
        -> Result<(), StoreError>;

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Load a single task
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Load a task's error log, oldest first
    async fn errors(&self, id: TaskId) -> Result<Vec<ErrorRecord>, StoreError>;
}
