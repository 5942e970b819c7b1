//! Retry-with-backoff wrapper for flaky external calls.
//!
//! Transient failures are retried with an exponentially doubling delay up to
//! `max_retries` extra attempts. Permanent failures return immediately. The
//! wrapper never panics or propagates past its boundary: callers always get a
//! typed [`RetryError`] they can skip, log, or abort on.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{env_millis, env_parse};
use crate::error::{ConfigError, ServiceError};

/// Classification hook for retryable errors.
pub trait Retryable {
    /// Whether the failure is likely to succeed on retry.
    fn is_transient(&self) -> bool;
}

impl Retryable for ServiceError {
    fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient { .. })
    }
}

/// Typed failure of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Non-transient failure; no retries were attempted after it.
    Permanent { attempts: u32, error: E },
    /// Transient failures persisted through every allowed attempt.
    Exhausted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    /// Total attempts made, including the first call.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The last error observed.
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            Self::Permanent { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permanent { attempts, error } => {
                write!(f, "permanent failure after {attempts} attempt(s): {error}")
            }
            Self::Exhausted { attempts, error } => {
                write!(f, "retries exhausted after {attempts} attempt(s): {error}")
            }
        }
    }
}

/// Retry policy: attempt budget and starting delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each subsequent one.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self::new(
            env_parse("INTAKE_RETRY_MAX", defaults.max_retries)?,
            env_millis(
                "INTAKE_RETRY_INITIAL_MS",
                defaults.initial_delay.as_millis() as u64,
            )?,
        ))
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(op = label, attempts, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => {
                    return Err(RetryError::Permanent { attempts, error });
                }
                Err(error) => {
                    let retry = attempts;
                    if retry > self.max_retries {
                        warn!(op = label, attempts, error = %error, "Retries exhausted");
                        return Err(RetryError::Exhausted { attempts, error });
                    }
                    let delay = self.delay_for(retry);
                    warn!(
                        op = label,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
