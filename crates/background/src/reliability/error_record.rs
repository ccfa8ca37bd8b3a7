//! Per-task failure history

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::retry::RetryPolicy;

/// One failed processing attempt
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    error: Arc<anyhow::Error>,
    occurred_at: DateTime<Utc>,
}

impl ErrorEntry {
    /// The error raised by the attempt
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// When the failure was recorded
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:#}", self.occurred_at.to_rfc3339(), self.error)
    }
}

/// Accumulated failures of one logical task
///
/// Clones are handles to the same history: a retried task carries the record
/// it failed with, so entries accumulate across attempts. The list only grows.
///
/// # Example
///
/// ```
/// use dicom_background::ErrorRecord;
///
/// let record = ErrorRecord::default();
/// assert!(record.should_retry());
///
/// for attempt in 1..=3 {
///     record.add_exception(anyhow::anyhow!("upload attempt {attempt} refused"));
/// }
/// assert!(!record.should_retry());
/// assert_eq!(record.len(), 3);
/// ```
#[derive(Clone)]
pub struct ErrorRecord {
    entries: Arc<Mutex<Vec<ErrorEntry>>>,
    policy: RetryPolicy,
}

impl Default for ErrorRecord {
    fn default() -> Self {
        Self::new(RetryPolicy::bounded())
    }
}

impl ErrorRecord {
    /// Create an empty record governed by `policy`
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            policy,
        }
    }

    /// Create an empty record that retries immediately and without bound
    pub fn instant_repeater() -> Self {
        Self::new(RetryPolicy::instant())
    }

    /// Record a failed attempt at the current time
    pub fn add_exception(&self, error: impl Into<anyhow::Error>) {
        let entry = ErrorEntry {
            error: Arc::new(error.into()),
            occurred_at: Utc::now(),
        };
        self.entries.lock().push(entry);
    }

    /// Whether the owning task may be attempted again
    pub fn should_retry(&self) -> bool {
        self.policy.allows_retry(self.len())
    }

    /// Recorded failures, oldest first
    pub fn error_list(&self) -> Vec<ErrorEntry> {
        self.entries.lock().clone()
    }

    /// Most recent failure, if any
    pub fn last_error(&self) -> Option<ErrorEntry> {
        self.entries.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The policy this record is evaluated against
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Time left before the owning task may run again
    ///
    /// Zero for a record without failures and for zero-delay policies.
    pub fn retry_delay(&self) -> Duration {
        if self.policy.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let Some(last) = self.last_error() else {
            return Duration::ZERO;
        };

        let delay = match chrono::Duration::from_std(self.policy.retry_delay) {
            Ok(delay) => delay,
            Err(_) => return self.policy.retry_delay,
        };
        (last.occurred_at + delay - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether `other` is a handle to the same history
    pub fn shares_history_with(&self, other: &ErrorRecord) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl fmt::Debug for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRecord")
            .field("errors", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}
