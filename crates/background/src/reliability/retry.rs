//! Retry policy implementation

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::duration_millis;

/// Maximum number of recorded failures before a task is given up on.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay between a failed attempt and the next one under the default policy.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Policy evaluated by an [`ErrorRecord`](super::ErrorRecord)
///
/// # Example
///
/// ```
/// use dicom_background::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::bounded()
///     .with_max_attempts(5)
///     .with_retry_delay(Duration::from_millis(250));
///
/// assert!(policy.allows_retry(4));
/// assert!(!policy.allows_retry(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of recorded failures after which retrying stops
    ///
    /// `None` means retries are never exhausted.
    pub max_attempts: Option<u32>,

    /// Minimum wait between a failure and the next attempt
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded()
    }
}

impl RetryPolicy {
    /// Bounded policy used in production
    ///
    /// - 3 recorded failures exhaust the task
    /// - 1 second between attempts
    pub fn bounded() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// The "instant repeater": never exhausted and never waits
    pub fn instant() -> Self {
        Self {
            max_attempts: None,
            retry_delay: Duration::ZERO,
        }
    }

    /// Set the maximum number of recorded failures
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Remove the attempt bound
    pub fn unbounded(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Set the delay between attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Whether a task with `recorded_errors` failures may run again
    pub fn allows_retry(&self, recorded_errors: usize) -> bool {
        match self.max_attempts {
            Some(max) => recorded_errors < max as usize,
            None => true,
        }
    }

    /// Create a policy from environment variables
    ///
    /// Environment variables:
    /// - `BACKGROUND_MAX_ATTEMPTS`: failure count that exhausts a task, or `unbounded` (default: 3)
    /// - `BACKGROUND_RETRY_DELAY_MS`: delay between attempts in milliseconds (default: 1000)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut policy = Self::bounded();

        if let Some(raw) = lookup("BACKGROUND_MAX_ATTEMPTS") {
            if raw.trim().eq_ignore_ascii_case("unbounded") {
                policy.max_attempts = None;
            } else {
                match raw.trim().parse::<u32>() {
                    Ok(max) => policy.max_attempts = Some(max),
                    Err(_) => warn!(value = %raw, "Ignoring invalid BACKGROUND_MAX_ATTEMPTS"),
                }
            }
        }

        if let Some(raw) = lookup("BACKGROUND_RETRY_DELAY_MS") {
            match raw.trim().parse::<u64>() {
                Ok(millis) => policy.retry_delay = Duration::from_millis(millis),
                Err(_) => warn!(value = %raw, "Ignoring invalid BACKGROUND_RETRY_DELAY_MS"),
            }
        }

        policy
    }
}
