//! Configuration for the pipelines and the AWS adapters.
//!
//! Settings are layered with the `config` crate:
//!  1. An optional YAML file
//!  2. Environment variables prefixed `QC__` with `__` as the nesting
//!     separator, e.g. `QC__PUBLISHER__BATCH_SIZE=5`
//!  3. The conventional `AWS_QUEUE_URL`, `AWS_TOPIC_ARN` and `AWS_REGION`
//!     variables
//!
//! Every field has a default, so an empty environment yields a usable
//! configuration apart from credentials.

use crate::error::{ConfigurationError, QueueError};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Largest batch the queue service accepts for receive and send
pub const MAX_BATCH_SIZE: u32 = 10;

/// Longest long-poll the queue service allows
pub const MAX_WAIT_TIME_SECONDS: u64 = 20;

/// Longest per-message delivery delay the queue service allows
pub const MAX_DELAY_SECONDS: u32 = 900;

/// Longest publisher flush interval accepted, one hour
pub const MAX_FLUSH_INTERVAL_MS: u64 = 3_600_000;

const ENV_ACCESS_KEY: &str = "AWS_ACCESS_KEY_ID";
const ENV_SECRET_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
const ENV_REGION: &str = "AWS_REGION";
const ENV_QUEUE_URL: &str = "AWS_QUEUE_URL";
const ENV_TOPIC_ARN: &str = "AWS_TOPIC_ARN";

// ============================================================================
// Credentials
// ============================================================================

/// Static AWS credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub token: Option<String>,
    pub region: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

impl Credentials {
    fn has_keys(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }

    /// Keys from the standard AWS environment variables, region kept from
    /// `self` unless the environment provides one
    fn from_env(region: &str) -> Option<Self> {
        let access_key = std::env::var(ENV_ACCESS_KEY).ok().filter(|v| !v.is_empty())?;
        let secret_key = std::env::var(ENV_SECRET_KEY).ok().filter(|v| !v.is_empty())?;
        let region = if region.is_empty() {
            std::env::var(ENV_REGION).unwrap_or_default()
        } else {
            region.to_string()
        };

        Some(Self {
            access_key,
            secret_key,
            token: std::env::var(ENV_SESSION_TOKEN).ok().filter(|v| !v.is_empty()),
            region,
        })
    }
}

// ============================================================================
// AWS adapter configuration
// ============================================================================

/// Connection and provisioning settings for the AWS adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Owner account of the queue, for cross-account lookups
    pub account_id: Option<String>,
    /// Create the queue instead of looking it up
    pub create_queue: bool,
    pub queue_name: Option<String>,
    /// Skips the lookup entirely when set
    pub queue_url: Option<String>,
    /// Topic to publish to, or to subscribe the queue to
    pub topic_arn: Option<String>,
    /// Override for the SQS endpoint (local emulators, tests)
    pub sqs_endpoint: Option<String>,
    /// Override for the SNS endpoint
    pub sns_endpoint: Option<String>,
    pub credentials: Option<Credentials>,
    pub request_timeout_seconds: u64,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            create_queue: false,
            queue_name: None,
            queue_url: None,
            topic_arn: None,
            sqs_endpoint: None,
            sns_endpoint: None,
            credentials: None,
            request_timeout_seconds: 30,
        }
    }
}

impl AwsConfig {
    /// Credentials to sign requests with.
    ///
    /// Explicit keys win; otherwise the standard AWS environment variables
    /// are consulted. No credentials block at all is an error.
    pub fn resolve_credentials(&self) -> Result<Credentials, QueueError> {
        let configured = self.credentials.as_ref().ok_or(QueueError::NoCredentials)?;
        if configured.has_keys() {
            return Ok(configured.clone());
        }

        Credentials::from_env(&configured.region).ok_or(QueueError::CredentialsExpired)
    }

    /// Region from the resolved credentials
    pub fn region(&self) -> Option<&str> {
        self.credentials
            .as_ref()
            .map(|c| c.region.as_str())
            .filter(|r| !r.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        // Must outlast the longest receive long-poll
        Duration::from_secs(self.request_timeout_seconds.max(MAX_WAIT_TIME_SECONDS + 5))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_QUEUE_URL) {
            if !url.is_empty() {
                self.queue_url = Some(url);
            }
        }
        if let Ok(arn) = std::env::var(ENV_TOPIC_ARN) {
            if !arn.is_empty() {
                self.topic_arn = Some(arn);
            }
        }
        if self.credentials.is_none() {
            if let Ok(region) = std::env::var(ENV_REGION) {
                self.credentials = Some(Credentials {
                    region,
                    ..Credentials::default()
                });
            }
        }
    }
}

// ============================================================================
// Pipeline configuration
// ============================================================================

/// Settings for a [`crate::Consumer`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Messages requested per receive; also the capacity of the message and
    /// acknowledgement channels
    pub batch_size: u32,
    /// Long-poll duration of each receive
    pub wait_time_seconds: u64,
    /// Spacing of receive retries and number of delete retries
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            wait_time_seconds: MAX_WAIT_TIME_SECONDS,
            retry: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_seconds)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.batch_size.max(1) as usize
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "consumer batch_size must be between 1 and {}, got {}",
                    MAX_BATCH_SIZE, self.batch_size
                ),
            });
        }
        if self.wait_time_seconds > MAX_WAIT_TIME_SECONDS {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "consumer wait_time_seconds must be at most {}, got {}",
                    MAX_WAIT_TIME_SECONDS, self.wait_time_seconds
                ),
            });
        }
        self.retry.validate()
    }
}

/// Settings for a [`crate::Publisher`] or [`crate::TopicPublisher`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Messages per batch send; zero or negative sends one at a time
    pub batch_size: i32,
    /// How long a partial batch may wait before it is flushed
    pub flush_interval_ms: u64,
    /// Delivery delay applied to every published message
    pub delay_seconds: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE as i32,
            flush_interval_ms: 1_000,
            delay_seconds: 0,
        }
    }
}

impl PublisherConfig {
    pub fn batching_enabled(&self) -> bool {
        self.batch_size > 0
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub(crate) fn batch_capacity(&self) -> usize {
        self.batch_size.max(1) as usize
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch_size > MAX_BATCH_SIZE as i32 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "publisher batch_size must be at most {}, got {}",
                    MAX_BATCH_SIZE, self.batch_size
                ),
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "publisher flush_interval_ms must be greater than zero".to_string(),
            });
        }
        if self.flush_interval_ms > MAX_FLUSH_INTERVAL_MS {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "publisher flush_interval_ms cannot exceed {}, got {}",
                    MAX_FLUSH_INTERVAL_MS, self.flush_interval_ms
                ),
            });
        }
        if self.delay_seconds > MAX_DELAY_SECONDS {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "publisher delay_seconds must be at most {}, got {}",
                    MAX_DELAY_SECONDS, self.delay_seconds
                ),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Top-level settings
// ============================================================================

/// Everything needed to wire consumers and publishers to AWS
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub aws: AwsConfig,
    pub consumer: ConsumerConfig,
    pub publisher: PublisherConfig,
}

impl Settings {
    /// Load settings from an optional YAML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("QC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.aws.apply_env_overrides();
        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.consumer.validate()?;
        self.publisher.validate()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
