//! The task list contract shared by every admission strategy

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::wrapper::TaskWrapper;
use crate::reliability::{ErrorRecord, FailureList, FailureRecord, RetryPolicy};

/// Task list errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskListError {
    /// The list no longer admits or yields tasks
    #[error("task list is closed")]
    Closed,

    /// The strategy needs a tokio runtime and none was found
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Outcome of [`TaskList::retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    /// The task was admitted again
    Requeued,
    /// The task was moved to the failure list
    Failed,
}

impl std::fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requeued => write!(f, "requeued"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A queue of tasks waiting to be processed
///
/// Producers call [`add`](TaskList::add) from any thread; a single consumer
/// awaits [`take`](TaskList::take). Strategies differ in when a task becomes
/// ready and what its [`Output`](TaskList::Output) is.
#[async_trait]
pub trait TaskList: Send + Sync + 'static {
    /// Opaque task type
    type Task: Clone + Send + Sync + 'static;

    /// Value handed to the processor for each task
    type Output: Send + Sync + 'static;

    /// Policy given to the error record of newly added tasks
    fn retry_policy(&self) -> &RetryPolicy;

    /// Admit a task together with its existing failure history
    ///
    /// Used for first admission and for re-admission after a failed attempt.
    /// The task does not become ready before `errors.retry_delay()` elapses.
    fn add_with_errors(&self, task: Self::Task, errors: ErrorRecord)
        -> Result<(), TaskListError>;

    /// Admit a new task with a fresh error record
    fn add(&self, task: Self::Task) -> Result<(), TaskListError> {
        let errors = ErrorRecord::new(self.retry_policy().clone());
        self.add_with_errors(task, errors)
    }

    /// Wait for the next ready task
    ///
    /// Cancel-safe: dropping the future before it resolves loses no task.
    async fn take(&self) -> Result<TaskWrapper<Self::Task, Self::Output>, TaskListError>;

    /// Store of tasks whose retries are exhausted
    fn failure_list(&self) -> &FailureList<Self::Task>;

    /// Tasks admitted and not yet handed out by [`take`](TaskList::take)
    ///
    /// Includes tasks waiting out a retry delay. A wrapper already taken is
    /// not counted, even while the processor is still working on it. For the
    /// worker pool this covers jobs still executing, since their wrappers are
    /// only handed out once the job completes.
    fn pending(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Re-admit a failed task, or give up on it
    ///
    /// The decision is taken from the wrapper's error record. A task whose
    /// re-admission is refused is treated as failed.
    fn retry(&self, wrapper: &TaskWrapper<Self::Task, Self::Output>) -> RetryDecision {
        let task = wrapper.task().clone();
        let errors = wrapper.errors().clone();

        if !wrapper.should_retry() {
            debug!(
                sequence = wrapper.sequence(),
                attempts = errors.len(),
                "Retries exhausted, moving task to failure list"
            );
            self.failure_list().add_failure(task, errors);
            return RetryDecision::Failed;
        }

        match self.add_with_errors(task.clone(), errors.clone()) {
            Ok(()) => {
                debug!(
                    sequence = wrapper.sequence(),
                    attempts = errors.len(),
                    "Task requeued"
                );
                RetryDecision::Requeued
            }
            Err(e) => {
                warn!(
                    sequence = wrapper.sequence(),
                    error = %e,
                    "Re-admission refused, moving task to failure list"
                );
                self.failure_list().add_failure(task, errors);
                RetryDecision::Failed
            }
        }
    }

    /// Snapshot of permanently failed tasks
    fn failures(&self) -> Vec<FailureRecord<Self::Task>> {
        self.failure_list().failures()
    }
}
