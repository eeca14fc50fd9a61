//! Error types for consumer, publisher and backend operations.

use crate::backend::BatchResultErrorEntry;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue channel operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("consumer/publisher not started")]
    NotStarted,

    #[error("no credentials configured")]
    NoCredentials,

    #[error("environment credentials invalid/expired")]
    CredentialsExpired,

    #[error("topic ARN must be set")]
    MissingTopic,

    #[error("queue name or queue URL must be set")]
    MissingQueue,

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Receipt handle is invalid or expired: {receipt}")]
    InvalidReceipt { receipt: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Malformed backend response: {message}")]
    MalformedResponse { message: String },

    #[error("Failed to wrap received message {message_id}: {reason}")]
    WrapFailed { message_id: String, reason: String },

    #[error("Failed to marshal message: {reason}")]
    MarshalFailed { reason: String },

    #[error(transparent)]
    BatchEntry(#[from] BatchEntryError),

    #[error("No result returned for batch entry {correlation_id}")]
    MissingBatchResult { correlation_id: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotStarted => false,
            Self::NoCredentials => false,
            Self::CredentialsExpired => false,
            Self::MissingTopic => false,
            Self::MissingQueue => false,
            Self::QueueNotFound { .. } => false,
            Self::InvalidReceipt { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ProviderError { .. } => true,
            Self::MalformedResponse { .. } => false,
            Self::WrapFailed { .. } => false,
            Self::MarshalFailed { .. } => false,
            Self::BatchEntry(entry) => !entry.sender_fault(),
            Self::MissingBatchResult { .. } => false,
            Self::ConfigurationError(_) => false,
        }
    }
}

/// A single failed entry of a batch send.
///
/// Keeps two renderings of the backend failure: the compact display form
/// (`code - message`) used by `{}` and the backend-native structured form,
/// appended by the alternate `{:#}` format and available through
/// [`BatchEntryError::native`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntryError {
    code: String,
    message: String,
    sender_fault: bool,
    native: String,
    display: String,
}

impl BatchEntryError {
    pub fn new(entry: &BatchResultErrorEntry) -> Self {
        Self {
            code: entry.code.clone(),
            message: entry.message.clone(),
            sender_fault: entry.sender_fault,
            native: format!("{:?}", entry),
            display: format!("{} - {}", entry.code, entry.message),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the backend blames the request rather than itself
    pub fn sender_fault(&self) -> bool {
        self.sender_fault
    }

    /// Full structured rendering of the backend entry, for diagnostics
    pub fn native(&self) -> &str {
        &self.native
    }

    /// Compact `code - message` rendering
    pub fn display(&self) -> &str {
        &self.display
    }
}

impl fmt::Display for BatchEntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{} ({})", self.display, self.native)
        } else {
            f.write_str(&self.display)
        }
    }
}

impl std::error::Error for BatchEntryError {}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Parsing {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
