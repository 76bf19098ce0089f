//! Retry logic with exponential backoff for handling transient failures.
//!
//! The publisher wraps every produce call in [`retry_with_backoff`]. The default
//! policy makes one initial attempt plus three retries, waiting 1s, 2s and 4s
//! before them. There is no jitter.
//!
//! Retrying stops as soon as the `cancelled` future resolves (the bus was
//! disconnected). That covers an attempt still in flight as well as a backoff
//! wait, so a dead broker never holds a caller until its timeouts run out.
//!
//! # Example
//!
//! ```rust
//! use waypoint_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::future;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .build();
//!
//! let value = retry_with_backoff(&policy, future::pending::<()>(), || async {
//!     Ok::<_, String>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 1 second
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Total attempts this policy allows (initial attempt plus retries).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry + 1`.
    ///
    /// `initial_delay * multiplier ^ retry`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let seconds = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        Duration::try_from_secs_f64(seconds)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every allowed attempt failed
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        error: E,
    },
    /// Cancelled during an attempt or while waiting to retry
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts started, including one cut off mid-flight
        attempts: u32,
        /// Error from the last attempt that completed, if any did
        last_error: Option<E>,
    },
}

/// Retry an async operation with exponential backoff.
///
/// Attempts run strictly one after another; a retry starts only once the previous
/// attempt has definitively failed.
///
/// # Arguments
///
/// * `policy` - Retry policy configuration
/// * `cancelled` - Retrying stops as soon as this resolves, dropping any attempt in flight
/// * `operation` - Async operation to retry (must be `FnMut` to allow multiple calls)
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the final error once all attempts fail,
/// or [`RetryError::Cancelled`] if `cancelled` resolves first.
pub async fn retry_with_backoff<C, F, Fut, T, E>(
    policy: &RetryPolicy,
    cancelled: C,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    C: Future<Output = ()>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    tokio::pin!(cancelled);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            () = &mut cancelled => {
                tracing::debug!(attempts, "Attempt cancelled in flight");
                return Err(RetryError::Cancelled { attempts, last_error: None });
            }
            outcome = operation() => outcome,
        };

        match outcome {
            Ok(result) => {
                if attempts > 1 {
                    tracing::info!(attempts, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if attempts >= policy.max_attempts() {
                    tracing::error!(attempts, error = %error, "Operation failed after max retries");
                    return Err(RetryError::Exhausted { attempts, error });
                }

                let delay = policy.delay_for_retry(attempts - 1);
                tracing::warn!(
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Operation failed, retrying"
                );

                tokio::select! {
                    biased;
                    () = &mut cancelled => {
                        tracing::debug!(attempts, "Retry cancelled while backing off");
                        return Err(RetryError::Cancelled { attempts, last_error: Some(error) });
                    }
                    () = sleep(delay) => {}
                }
            }
        }
    }
}
