//! Error taxonomy for the delivery pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request or recipient shape errors. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Notification has no recipients")]
    NoRecipients,

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Invalid {label}: {address} ({reason})")]
    InvalidAddress {
        label: &'static str,
        address: String,
        reason: String,
    },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// Coarse category of a dispatch failure, used by the retry allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Timeout,
    Transport,
    ServerError,
    RateLimited,
    CircuitOpen,
    Rejected,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Transport => "transport",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Rejected => "rejected",
            ErrorCategory::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Provider server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Provider rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Provider request timed out after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Circuit breaker is open for {0}")]
    CircuitOpen(String),

    #[error("Unexpected provider response: {0}")]
    UnexpectedResponse(String),

    #[error("Provider configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::InvalidRecipient(_) => ErrorCategory::Validation,
            ProviderError::Rejected { .. } => ErrorCategory::Rejected,
            ProviderError::Server { .. } => ErrorCategory::ServerError,
            ProviderError::RateLimited(_) => ErrorCategory::RateLimited,
            ProviderError::Timeout(_) => ErrorCategory::Timeout,
            ProviderError::Transport(_) => ErrorCategory::Transport,
            ProviderError::CircuitOpen(_) => ErrorCategory::CircuitOpen,
            ProviderError::UnexpectedResponse(_) => ErrorCategory::Transport,
            ProviderError::Config(_) => ErrorCategory::Internal,
        }
    }

    /// Maps a reqwest failure, keeping timeouts distinguishable from other transport faults.
    pub fn from_reqwest(err: reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(timeout_ms)
        } else {
            ProviderError::Transport(err.to_string())
        }
    }

    /// Maps a non-success HTTP status and body into a classified error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            429 => ProviderError::RateLimited(message),
            500..=599 => ProviderError::Server { status, message },
            _ => ProviderError::Rejected { status, message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Invalid template '{id}': {reason}")]
    InvalidTemplate { id: String, reason: String },

    #[error("Missing variable '{variable}' for template '{template}'")]
    MissingVariable { template: String, variable: String },

    #[error("Template rendering failed: {0}")]
    Render(String),

    #[error("Template cache unavailable: {0}")]
    Cache(String),
}

impl RenderError {
    /// Configuration defects are permanent; a broken cache is assumed recoverable.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, RenderError::Cache(_))
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Delivery status not found: {0}")]
    NotFound(String),

    #[error("Concurrent update conflict on {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for TrackerError {
    fn from(err: redis::RedisError) -> Self {
        TrackerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Serialization(err.to_string())
    }
}

/// Internal failures that leave a message unacknowledged so it is redelivered.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Queue error: {0}")]
    Queue(String),
}
