//! Error taxonomy and retry primitives
//!
//! Every failure raised below the task manager is a [`DownloadError`]. Its category
//! decides who may try again:
//! - `Network` errors are retried by the fetch executor, the segment pool and the orchestrator
//! - `Format`, `Storage` and `Decryption` errors fail the run immediately
//! - `Capacity` never surfaces as a failure, the caller simply does not start

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Upper bound accepted for any configured retry budget
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Base delay between task-level restarts (3 seconds, multiplied by the attempt number)
pub const DEFAULT_TASK_RETRY_DELAY: Duration = Duration::from_millis(3000);

/// Base delay between attempts of a single fetch call (500ms, multiplied by the attempt number)
pub const DEFAULT_FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Error categories used for retry decisions and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Malformed manifest or unusable input, never retried
    Format,
    /// Connection, timeout and HTTP status failures
    Network,
    /// Disk full, unwritable destination, missing staging files on merge
    Storage,
    /// AES key or padding problems
    Decryption,
    /// Worker pool saturation
    Capacity,
}

/// Failure raised by fetchers, the HTTP layer and the manifest parser
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum DownloadError {
    #[error("Format error: {message}")]
    Format { message: String },

    #[error("Network error: {message}")]
    Network {
        message: String,
        status: Option<u16>,
        is_retryable: bool,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        path: Option<String>,
    },

    #[error("Decryption error: {message}")]
    Decryption { message: String },

    #[error("Capacity error: {message}")]
    Capacity { message: String },
}

impl DownloadError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { is_retryable, .. } => *is_retryable,
            Self::Format { .. } => false,
            Self::Storage { .. } => false,
            Self::Decryption { .. } => false,
            Self::Capacity { .. } => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Format { .. } => ErrorCategory::Format,
            Self::Network { .. } => ErrorCategory::Network,
            Self::Storage { .. } => ErrorCategory::Storage,
            Self::Decryption { .. } => ErrorCategory::Decryption,
            Self::Capacity { .. } => ErrorCategory::Capacity,
        }
    }

    /// Bare message without the category prefix
    pub fn message(&self) -> &str {
        match self {
            Self::Format { message }
            | Self::Network { message, .. }
            | Self::Storage { message, .. }
            | Self::Decryption { message }
            | Self::Capacity { message } => message,
        }
    }

    /// HTTP status that caused a network error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Network { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(error: std::io::Error) -> Self {
        errors::storage_error(error.to_string(), None)
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        let status = error.status().map(|s| s.as_u16());
        let is_retryable = match status {
            Some(code) => errors::is_retryable_status(code),
            None => true,
        };
        errors::network_error(error.to_string(), status, is_retryable)
    }
}

impl From<url::ParseError> for DownloadError {
    fn from(error: url::ParseError) -> Self {
        errors::format_error(format!("invalid URL: {}", error))
    }
}

/// Linear backoff policy: the n-th retry waits `base_delay * n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (task level: restarts after the first run)
    pub max_attempts: u32,
    /// Delay unit multiplied by the attempt number
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::task_level()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.min(MAX_RETRY_ATTEMPTS),
            base_delay,
        }
    }

    /// Orchestrator restarts: 3 retries, 3s, 6s, 9s
    pub fn task_level() -> Self {
        Self::new(3, DEFAULT_TASK_RETRY_DELAY)
    }

    /// Single request retries inside a segment or key fetch: 3 tries, 500ms, 1s
    pub fn fetch_level() -> Self {
        Self::new(3, DEFAULT_FETCH_RETRY_DELAY)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// True while `attempt` (1-based) is still inside the budget
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// Context handed to each attempt of a retried operation
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Identifier shared by every attempt of one execution, for log correlation
    pub attempt_id: String,
    /// 1-based attempt number
    pub attempt_number: u32,
    pub total_elapsed: Duration,
    pub previous_error: Option<String>,
}

/// Runs an async operation until it succeeds, fails permanently or exhausts the policy
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, DownloadError>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        self.execute_with_abort(|| false, f).await
    }

    /// Same as [`execute`](Self::execute) but stops scheduling new attempts once `abort` returns true
    pub async fn execute_with_abort<A, F, Fut, T>(&self, abort: A, mut f: F) -> Result<T, DownloadError>
    where
        A: Fn() -> bool,
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let start_time = Instant::now();
        let attempt_id = Uuid::new_v4().to_string();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<DownloadError> = None;

        for attempt in 1..=max_attempts {
            let context = RetryContext {
                attempt_id: attempt_id.clone(),
                attempt_number: attempt,
                total_elapsed: start_time.elapsed(),
                previous_error: last_error.as_ref().map(|e| e.to_string()),
            };

            match f(context).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Attempt {} succeeded for {}", attempt, attempt_id);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !error.is_retryable() || attempt >= max_attempts || abort() {
                        return Err(error);
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {}/{} failed for {}: {} (retrying in {:?})",
                        attempt, max_attempts, attempt_id, error, delay
                    );
                    last_error = Some(error);
                    sleep(delay).await;

                    if abort() {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| errors::network_error("retry aborted", None, true)))
    }
}

/// Convenience constructors for [`DownloadError`]
pub mod errors {
    use super::*;

    pub fn format_error(message: impl Into<String>) -> DownloadError {
        DownloadError::Format {
            message: message.into(),
        }
    }

    pub fn network_error(
        message: impl Into<String>,
        status: Option<u16>,
        is_retryable: bool,
    ) -> DownloadError {
        DownloadError::Network {
            message: message.into(),
            status,
            is_retryable,
        }
    }

    pub fn storage_error(message: impl Into<String>, path: Option<String>) -> DownloadError {
        DownloadError::Storage {
            message: message.into(),
            path,
        }
    }

    pub fn decryption_error(message: impl Into<String>) -> DownloadError {
        DownloadError::Decryption {
            message: message.into(),
        }
    }

    pub fn capacity_error(message: impl Into<String>) -> DownloadError {
        DownloadError::Capacity {
            message: message.into(),
        }
    }

    /// Server errors, request timeouts and rate limiting are worth another try
    pub fn is_retryable_status(status: u16) -> bool {
        status >= 500 || status == 408 || status == 429
    }

    pub fn http_status_error(url: &str, status: u16) -> DownloadError {
        network_error(
            format!("HTTP {} for {}", status, url),
            Some(status),
            is_retryable_status(status),
        )
    }
}
