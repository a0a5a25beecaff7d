//! Worker configuration from environment variables

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use courier_queue::pipeline::{PipelineConfig, PollerConfig, ProcessorConfig};
use courier_queue::reliability::RetryPolicy;
use courier_queue::stages::{Endpoints, HttpConfig};

/// Worker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub database_url: String,
    pub queue_name: String,
    pub claim_batch_size: usize,
    /// Longest wait between claims while the store is empty
    pub idle_backoff: Duration,
    pub stage_timeout: Duration,
    pub max_attempts: u32,
    pub http_timeout: Duration,
    pub endpoints: Endpoints,
    /// Reclaim `RUNNING` tasks untouched for this long
    pub stale_threshold: Option<Duration>,
    /// Bound on waiting for the in-progress batch at shutdown
    pub shutdown_timeout: Option<Duration>,
}

impl WorkerConfig {
    /// Create config from environment variables
    ///
    /// Loads `.env` first when present.
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string (required)
    /// - `QUEUE_NAME`: Broker queue (default: "messages")
    /// - `CLAIM_BATCH_SIZE`: Tasks claimed per poll (default: 10)
    /// - `IDLE_BACKOFF_MS`: Longest idle wait between claims (default: 5000)
    /// - `STAGE_TIMEOUT_MS`: Per-stage deadline (default: 30000)
    /// - `MAX_ATTEMPTS`: Claims before a retryable failure becomes fatal (default: 5)
    /// - `HTTP_TIMEOUT_MS`: Per-request timeout for collaborators (default: 10000)
    /// - `CHECK_AUTH_URL`, `ISSUE_AUTH_URL`, `SEND_MESSAGE_URL`: Collaborator endpoints
    /// - `STALE_THRESHOLD_SECS`: Enables stale task reclamation
    /// - `SHUTDOWN_TIMEOUT_MS`: Bounds the shutdown drain (requires `STALE_THRESHOLD_SECS`)
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env from {:?}", path);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Endpoints::default();
        let parsed = |key: &str| -> Result<Option<u64>> { parse(&lookup, key) };

        let config = Self {
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            queue_name: lookup("QUEUE_NAME").unwrap_or_else(|| "messages".to_string()),
            claim_batch_size: parse(&lookup, "CLAIM_BATCH_SIZE")?.unwrap_or(10),
            idle_backoff: Duration::from_millis(parsed("IDLE_BACKOFF_MS")?.unwrap_or(5000)),
            stage_timeout: Duration::from_millis(parsed("STAGE_TIMEOUT_MS")?.unwrap_or(30_000)),
            max_attempts: parse(&lookup, "MAX_ATTEMPTS")?.unwrap_or(5),
            http_timeout: Duration::from_millis(parsed("HTTP_TIMEOUT_MS")?.unwrap_or(10_000)),
            endpoints: Endpoints {
                check_auth_url: lookup("CHECK_AUTH_URL").unwrap_or(defaults.check_auth_url),
                issue_auth_url: lookup("ISSUE_AUTH_URL").unwrap_or(defaults.issue_auth_url),
                send_message_url: lookup("SEND_MESSAGE_URL").unwrap_or(defaults.send_message_url),
            },
            stale_threshold: parsed("STALE_THRESHOLD_SECS")?.map(Duration::from_secs),
            shutdown_timeout: parsed("SHUTDOWN_TIMEOUT_MS")?.map(Duration::from_millis),
        };

        // Tasks abandoned by a bounded shutdown stay RUNNING until reclaimed
        if config.shutdown_timeout.is_some() && config.stale_threshold.is_none() {
            anyhow::bail!("SHUTDOWN_TIMEOUT_MS requires STALE_THRESHOLD_SECS to be set");
        }
        Ok(config)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new()
            .with_stage_timeout(self.stage_timeout)
            .with_retry(RetryPolicy::new(self.max_attempts))
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        let poller = PollerConfig::new()
            .with_batch_size(self.claim_batch_size)
            .with_min_interval(self.idle_backoff.min(Duration::from_millis(500)))
            .with_max_interval(self.idle_backoff);

        let config = ProcessorConfig::new().with_poller(poller);
        match self.stale_threshold {
            Some(threshold) => config.with_stale_threshold(threshold),
            None => config,
        }
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig::default().with_timeout(self.http_timeout)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("invalid value for {key}: {raw:?}"))
        })
        .transpose()
}
