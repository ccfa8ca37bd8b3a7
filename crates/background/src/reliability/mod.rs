//! Retry bookkeeping for background tasks
//!
//! This module provides:
//! - [`RetryPolicy`] - Attempt bound and delay between attempts
//! - [`ErrorRecord`] - Shared, append-only failure history of one task
//! - [`FailureList`] - Tasks whose retries were exhausted

mod error_record;
mod failure;
mod retry;

pub use error_record::{ErrorEntry, ErrorRecord};
pub use failure::{FailureList, FailureRecord};
pub use retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
