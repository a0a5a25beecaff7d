//! HTTP-backed pipeline stages
//!
//! - [`AuthRefresh`] verifies the payload's `auth_key`, issuing a new one when needed
//! - [`AttachmentLoader`] downloads attachments and embeds them base64-encoded
//! - [`MessageSender`] posts the finished payload to the delivery endpoint
//!
//! All three share one [`reqwest::Client`] built from [`HttpConfig`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::{Payload, Stage, StageError};

mod attachments;
mod auth;
mod sender;

pub use attachments::AttachmentLoader;
pub use auth::AuthRefresh;
pub use sender::MessageSender;

/// Collaborator endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoints {
    /// `GET ?auth_key=`; 200 means the key is valid
    pub check_auth_url: String,

    /// `POST` form `user_id`; 200 with `{"auth_key": ...}`
    pub issue_auth_url: String,

    /// `POST` JSON payload; 200/201 with `{"status": "ok"}`
    pub send_message_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            check_auth_url: "http://127.0.0.1:9090/check_auth_key".to_string(),
            issue_auth_url: "http://127.0.0.1:9090/get_auth_key".to_string(),
            send_message_url: "http://127.0.0.1:9090/send_message".to_string(),
        }
    }
}

impl Endpoints {
    /// All three endpoints under one base URL, at the default paths
    pub fn with_base_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            check_auth_url: format!("{base}/check_auth_key"),
            issue_auth_url: format!("{base}/get_auth_key"),
            send_message_url: format!("{base}/send_message"),
        }
    }
}

/// HTTP client settings shared by the stages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    /// Total per-request timeout
    #[serde(with = "crate::duration_millis")]
    pub timeout: Duration,

    #[serde(with = "crate::duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl HttpConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
    }
}

/// The delivery stages in processing order: auth, attachments, send
pub fn delivery_stages(client: &reqwest::Client, endpoints: &Endpoints) -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(AuthRefresh::new(
            client.clone(),
            &endpoints.check_auth_url,
            &endpoints.issue_auth_url,
        )),
        Arc::new(AttachmentLoader::new(client.clone())),
        Arc::new(MessageSender::new(client.clone(), &endpoints.send_message_url)),
    ]
}

fn as_object(payload: &mut Payload) -> Result<&mut serde_json::Map<String, Payload>, StageError> {
    payload
        .as_object_mut()
        .ok_or_else(|| StageError::fatal("payload is not a JSON object"))
}
