//! Task lists and the wrappers they hand out
//!
//! This module provides:
//! - [`TaskList`] - Admission/take/retry contract shared by all strategies
//! - [`TaskWrapper`] - A task with its output and failure history
//! - [`OrderedTaskList`] - Strict FIFO list without internal execution
//!
//! The worker-pool strategy lives in [`crate::worker`].

mod list;
mod ordered;
mod wrapper;

pub use list::{RetryDecision, TaskList, TaskListError};
pub use ordered::OrderedTaskList;
pub use wrapper::TaskWrapper;
