//! Auth key verification and refresh

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, instrument};

use super::as_object;
use crate::pipeline::{Payload, RetryableKind, Stage, StageError};

fn auth_error(message: impl Into<String>) -> StageError {
    StageError::retryable(RetryableKind::Authentication, message)
}

/// Ensures the payload carries a valid `auth_key`
///
/// A present key is checked against the auth authority; a missing or
/// rejected key is replaced by one issued for the payload's `user_id`.
pub struct AuthRefresh {
    client: reqwest::Client,
    check_url: String,
    issue_url: String,
}

impl AuthRefresh {
    pub fn new(client: reqwest::Client, check_url: &str, issue_url: &str) -> Self {
        Self {
            client,
            check_url: check_url.to_string(),
            issue_url: issue_url.to_string(),
        }
    }

    async fn is_valid(&self, auth_key: &str) -> Result<bool, StageError> {
        let response = self
            .client
            .get(&self.check_url)
            .query(&[("auth_key", auth_key)])
            .send()
            .await
            .map_err(|e| auth_error(format!("could not check auth key: {e}")))?;
        Ok(response.status() == StatusCode::OK)
    }

    async fn issue(&self, user_id: &str) -> Result<String, StageError> {
        let response = self
            .client
            .post(&self.issue_url)
            .form(&[("user_id", user_id)])
            .send()
            .await
            .map_err(|e| auth_error(format!("could not get auth key: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(auth_error(format!("bad response {status} from auth server")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| auth_error(format!("unreadable auth server response: {e}")))?;
        body.get("auth_key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| auth_error("auth server issued no auth_key"))
    }
}

#[async_trait]
impl Stage for AuthRefresh {
    fn name(&self) -> &str {
        "auth_refresh"
    }

    #[instrument(skip_all)]
    async fn apply(&self, mut payload: Payload) -> Result<Payload, StageError> {
        let fields = as_object(&mut payload)?;

        if let Some(auth_key) = fields.get("auth_key").and_then(Value::as_str) {
            if self.is_valid(auth_key).await? {
                return Ok(payload);
            }
            debug!("Auth key rejected, requesting a new one");
        }

        let user_id = match fields.get("user_id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(StageError::fatal("payload has no usable user_id")),
        };

        let auth_key = self.issue(&user_id).await?;
        fields.insert("auth_key".to_string(), Value::String(auth_key));
        Ok(payload)
    }
}
