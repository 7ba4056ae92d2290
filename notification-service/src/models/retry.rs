use std::time::Duration;

use serde::Deserialize;

use crate::error::ErrorCategory;

fn default_retryable() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::Timeout,
        ErrorCategory::Transport,
        ErrorCategory::ServerError,
        ErrorCategory::RateLimited,
        ErrorCategory::CircuitOpen,
        ErrorCategory::Rejected,
        ErrorCategory::Internal,
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,

    #[serde(default = "default_retryable")]
    pub retryable: Vec<ErrorCategory>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            retryable: default_retryable(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (0-based), capped at `max_delay_ms`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let delay_ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        self.retryable.contains(&category)
    }

    /// Whether a failure on attempt number `attempt` (1-based) may be retried.
    ///
    /// The first attempt is not a retry, so `max_retries + 1` attempts are allowed overall.
    pub fn should_retry(&self, category: ErrorCategory, attempt: u32) -> bool {
        self.is_retryable(category) && attempt.saturating_sub(1) < self.max_retries
    }
}
