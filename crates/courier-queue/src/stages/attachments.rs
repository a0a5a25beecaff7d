//! Attachment download and embedding

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::try_join_all;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use super::as_object;
use crate::pipeline::{Payload, RetryableKind, Stage, StageError};

#[derive(Debug, Deserialize)]
struct Attachment {
    name: String,
    url: String,
}

/// Replaces `attachments: [{name, url}]` with `{name: base64(bytes)}`
///
/// Downloads run concurrently. A single failed download fails the whole
/// stage; nothing is embedded partially.
pub struct AttachmentLoader {
    client: reqwest::Client,
}

impl AttachmentLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, attachment: &Attachment) -> Result<Vec<u8>, StageError> {
        let download_error = |reason: String| {
            StageError::retryable(
                RetryableKind::Download,
                format!("could not download '{}': {reason}", attachment.name),
            )
        };

        let response = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(download_error(format!("{} returned {status}", attachment.url)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Stage for AttachmentLoader {
    fn name(&self) -> &str {
        "attachment_loader"
    }

    #[instrument(skip_all)]
    async fn apply(&self, mut payload: Payload) -> Result<Payload, StageError> {
        let fields = as_object(&mut payload)?;

        let attachments: Vec<Attachment> = match fields.remove("attachments") {
            None | Some(Value::Null) => Vec::new(),
            Some(list) => serde_json::from_value(list)
                .map_err(|e| StageError::fatal(format!("malformed attachments: {e}")))?,
        };

        let bodies = try_join_all(attachments.iter().map(|a| self.fetch(a))).await?;
        debug!(count = bodies.len(), "Downloaded attachments");

        let embedded: Map<String, Value> = attachments
            .into_iter()
            .zip(bodies)
            .map(|(attachment, body)| (attachment.name, Value::String(STANDARD.encode(body))))
            .collect();
        fields.insert("attachments".to_string(), Value::Object(embedded));

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_attachments_are_embedded_as_base64() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8, 1, 2]))
            .mount(&server)
            .await;

        let payload = json!({
            "user_id": 1,
            "attachments": [
                {"name": "a.png", "url": format!("{}/a.png", server.uri())},
                {"name": "b.txt", "url": format!("{}/b.txt", server.uri())},
            ]
        });
        let out = AttachmentLoader::new(reqwest::Client::new())
            .apply(payload)
            .await
            .unwrap();

        assert_eq!(
            out,
            json!({
                "user_id": 1,
                "attachments": {"a.png": "aGVsbG8=", "b.txt": "AAEC"}
            })
        );
    }

    #[tokio::test]
    async fn test_missing_or_null_attachments_become_empty() {
        let loader = AttachmentLoader::new(reqwest::Client::new());

        let out = loader.apply(json!({"user_id": 1})).await.unwrap();
        assert_eq!(out["attachments"], json!({}));

        let out = loader.apply(json!({"attachments": null})).await.unwrap();
        assert_eq!(out["attachments"], json!({}));

        let out = loader.apply(json!({"attachments": []})).await.unwrap();
        assert_eq!(out["attachments"], json!({}));
    }

    #[tokio::test]
    async fn test_one_failed_download_fails_the_stage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let payload = json!({
            "attachments": [
                {"name": "ok", "url": format!("{}/ok", server.uri())},
                {"name": "missing", "url": format!("{}/missing", server.uri())},
            ]
        });
        let err = AttachmentLoader::new(reqwest::Client::new())
            .apply(payload)
            .await
            .unwrap_err();

        match err {
            StageError::Retryable { kind, message } => {
                assert_eq!(kind, RetryableKind::Download);
                assert!(message.contains("'missing'"), "unexpected message: {message}");
            }
            other => panic!("expected retryable error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_entry_is_fatal() {
        let err = AttachmentLoader::new(reqwest::Client::new())
            .apply(json!({"attachments": [{"name": "no-url"}]}))
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
    }
}
