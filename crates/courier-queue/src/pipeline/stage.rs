//! Stage trait definition

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The payload a stage consumes and produces
pub type Payload = serde_json::Value;

/// Transient failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableKind {
    /// Auth authority unreachable or no token issued
    Authentication,
    /// An attachment could not be fetched
    Download,
    /// The delivery endpoint rejected or failed the message
    Send,
    /// The stage exceeded its deadline
    Timeout,
}

impl std::fmt::Display for RetryableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Download => write!(f, "download"),
            Self::Send => write!(f, "send"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Error type for stage failures
///
/// `Retryable` leaves the task eligible for a later claim; `Fatal` ends it
/// and the diagnostic is persisted to the error log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Transient condition; the task may succeed on a later attempt
    #[error("{kind} error: {message}")]
    Retryable {
        kind: RetryableKind,
        message: String,
    },

    /// Unexpected failure; retrying will not help
    #[error("fatal: {diagnostic}")]
    Fatal { diagnostic: String },
}

impl StageError {
    /// Create a retryable error
    pub fn retryable(kind: RetryableKind, message: impl Into<String>) -> Self {
        Self::Retryable {
            kind,
            message: message.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(diagnostic: impl Into<String>) -> Self {
        Self::Fatal {
            diagnostic: diagnostic.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// One step of the processing pipeline
///
/// Stages run strictly in order; each receives the payload produced by the
/// previous one. Stages may be replayed (at-least-once), so side effects
/// must tolerate repetition.
///
/// # Example
///
/// ```ignore
/// struct Stamp;
///
/// #[async_trait]
/// impl Stage for Stamp {
///     fn name(&self) -> &str {
///         "stamp"
///     }
///
///     async fn apply(&self, mut payload: Payload) -> Result<Payload, StageError> {
///         payload["stamped"] = true.into();
///         Ok(payload)
///     }
/// }
/// ```
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Name used in logs and diagnostics
    fn name(&self) -> &str;

    /// Transform the payload
    async fn apply(&self, payload: Payload) -> Result<Payload, StageError>;
}

type StageFuture = Pin<Box<dyn Future<Output = Result<Payload, StageError>> + Send>>;

/// A stage backed by an async closure
pub struct FnStage {
    name: String,
    func: Box<dyn Fn(Payload) -> StageFuture + Send + Sync>,
}

/// Build a stage from an async closure
///
/// ```
/// use courier_queue::pipeline::stage_fn;
///
/// let stage = stage_fn("noop", |payload| async move { Ok(payload) });
/// ```
pub fn stage_fn<F, Fut>(name: impl Into<String>, func: F) -> FnStage
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, StageError>> + Send + 'static,
{
    FnStage {
        name: name.into(),
        func: Box::new(move |payload| Box::pin(func(payload))),
    }
}

#[async_trait]
impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, payload: Payload) -> Result<Payload, StageError> {
        (self.func)(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_error_display() {
        let err = StageError::retryable(RetryableKind::Download, "404 from cdn");
        assert_eq!(err.to_string(), "download error: 404 from cdn");
        assert!(err.is_retryable());

        let err = StageError::fatal("missing user_id");
        assert_eq!(err.to_string(), "fatal: missing user_id");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fn_stage_applies_closure() {
        let stage = stage_fn("add_flag", |mut payload: Payload| async move {
            payload["flag"] = json!(true);
            Ok(payload)
        });

        assert_eq!(stage.name(), "add_flag");
        let out = stage.apply(json!({})).await.unwrap();
        assert_eq!(out, json!({"flag": true}));
    }
}
