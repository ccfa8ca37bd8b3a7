//! Lifecycle and attempt events, plus running counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::task::RetryDecision;

/// Event published by a [`BackgroundService`](super::BackgroundService)
///
/// Delivered over a broadcast channel; a subscriber that falls behind sees
/// `RecvError::Lagged` and misses events, the engine never waits for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    /// The engine loop started
    Started { service: String },

    /// A processing attempt succeeded
    AttemptSucceeded {
        service: String,
        sequence: u64,
        /// Failures recorded before this attempt
        failed_attempts: usize,
    },

    /// A processing attempt failed
    AttemptFailed {
        service: String,
        sequence: u64,
        error: String,
        /// Failures recorded including this one
        failed_attempts: usize,
        decision: RetryDecision,
    },

    /// The engine loop found the list empty and exited
    Drained { service: String },

    /// The engine loop exited because `stop` was called
    Stopped { service: String },
}

/// Running totals of a service, shared with its engine loop
#[derive(Debug, Default)]
pub struct ServiceStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failed_attempts: AtomicU64,
    exhausted: AtomicU64,
}

impl ServiceStats {
    pub(crate) fn record_success(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, decision: RetryDecision) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        if decision == RetryDecision::Failed {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServiceStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Processing attempts finished
    pub attempts: u64,
    /// Attempts that succeeded
    pub successes: u64,
    /// Attempts that failed
    pub failed_attempts: u64,
    /// Tasks moved to the failure list
    pub exhausted: u64,
}
