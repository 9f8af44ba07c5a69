//! Retry logic with exponential backoff
//!
//! Used for transient failures on outward-facing operations (GitHub API,
//! branch push). Task execution is never retried here: a failed task stays
//! failed until the user restarts the plan.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Patterns that indicate a retryable error
/// Note: All patterns must be lowercase since we lowercase the error before matching
pub const RETRYABLE_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "timeout",
    "network",
    "connection",
    "econnreset",
    "etimedout",
    "enotfound",
    "overloaded",
    "capacity",
    "temporarily unavailable",
    "service unavailable",
    "503",
    "502",
    "500",
];

/// Configuration for retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial delay in milliseconds (default: 1000)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds (default: 30000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff multiplier (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub struct RetryResult<T> {
    /// The successful result (if any)
    pub result: Result<T, String>,
    /// Number of attempts made
    pub attempts: u32,
    /// Total time spent retrying (including delays)
    pub total_retry_time_ms: u64,
    /// Whether the final attempt was a retry (not the first attempt)
    pub was_retried: bool,
}

/// Check if an error message indicates a retryable condition
pub fn is_retryable_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify an error into a category
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Can be retried (rate limit, timeout, network)
    Retryable,
    /// Should not be retried (auth error, invalid input)
    Fatal,
    /// Unknown error type
    Unknown,
}

/// Classify an error based on its message
pub fn classify_error(error: &str) -> ErrorCategory {
    if is_retryable_error(error) {
        ErrorCategory::Retryable
    } else if error.to_lowercase().contains("auth")
        || error.to_lowercase().contains("permission")
        || error.to_lowercase().contains("invalid")
        || error.to_lowercase().contains("not found")
    {
        ErrorCategory::Fatal
    } else {
        ErrorCategory::Unknown
    }
}

/// Execute an async operation with retry logic
///
/// # Arguments
/// * `operation` - A closure that returns a Future with Result<T, String>
/// * `config` - Retry configuration
/// * `on_retry` - Optional callback invoked before each retry attempt
///
/// # Returns
/// RetryResult containing the final result and retry statistics
pub async fn with_retry<F, Fut, T, R>(
    operation: F,
    config: &RetryConfig,
    mut on_retry: Option<R>,
) -> RetryResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, String>>,
    R: FnMut(u32, &str, u64),
{
    let mut attempts = 0u32;
    let mut total_retry_time_ms = 0u64;
    let mut current_delay_ms = config.initial_delay_ms;

    loop {
        attempts += 1;
        let result = operation().await;

        match result {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts,
                    total_retry_time_ms,
                    was_retried: attempts > 1,
                };
            }
            Err(error) => {
                // Check if we should retry
                let should_retry = attempts < config.max_attempts && is_retryable_error(&error);

                if !should_retry {
                    return RetryResult {
                        result: Err(error),
                        attempts,
                        total_retry_time_ms,
                        was_retried: attempts > 1,
                    };
                }

                // Log retry attempt
                log::warn!(
                    "[Retry] Retryable error on attempt {}/{}: {}. Retrying in {}ms...",
                    attempts,
                    config.max_attempts,
                    error,
                    current_delay_ms
                );

                // Invoke callback if provided
                if let Some(ref mut callback) = on_retry {
                    callback(attempts, &error, current_delay_ms);
                }

                // Wait before retrying
                tokio::time::sleep(Duration::from_millis(current_delay_ms)).await;
                total_retry_time_ms += current_delay_ms;

                // Calculate next delay with exponential backoff
                current_delay_ms = ((current_delay_ms as f64 * config.backoff_multiplier) as u64)
                    .min(config.max_delay_ms);
            }
        }
    }
}
