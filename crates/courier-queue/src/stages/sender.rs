//! Final delivery of the message

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::instrument;

use crate::pipeline::{Payload, RetryableKind, Stage, StageError};

fn send_error(message: impl Into<String>) -> StageError {
    StageError::retryable(RetryableKind::Send, message)
}

/// Posts the payload as JSON to the delivery endpoint
///
/// Only a 200/201 answer whose body is `{"status": "ok"}` counts as
/// delivered. The payload passes through unchanged.
pub struct MessageSender {
    client: reqwest::Client,
    url: String,
}

impl MessageSender {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Stage for MessageSender {
    fn name(&self) -> &str {
        "message_sender"
    }

    #[instrument(skip_all)]
    async fn apply(&self, payload: Payload) -> Result<Payload, StageError> {
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| send_error(format!("could not send message: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(send_error(format!("delivery endpoint returned {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| send_error(format!("unreadable delivery response: {e}")))?;
        match body.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(payload),
            Some(other) => Err(send_error(format!("delivery endpoint reported status '{other}'"))),
            None => Err(send_error("delivery response has no status")),
        }
    }
}
