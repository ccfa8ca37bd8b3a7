//! Envelope around a task admitted to a task list

use crate::reliability::ErrorRecord;

/// A task, its result and its failure history
///
/// `sequence` is the admission number assigned by the task list that produced
/// the wrapper; it only orders wrappers of the same list. A re-admitted task
/// gets a new wrapper and sequence but keeps its [`ErrorRecord`].
#[derive(Debug)]
pub struct TaskWrapper<T, R> {
    task: T,
    result: R,
    errors: ErrorRecord,
    sequence: u64,
}

impl<T, R> TaskWrapper<T, R> {
    pub(crate) fn new(task: T, result: R, errors: ErrorRecord, sequence: u64) -> Self {
        Self {
            task,
            result,
            errors,
            sequence,
        }
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    /// The value handed to the processor
    pub fn result(&self) -> &R {
        &self.result
    }

    pub fn errors(&self) -> &ErrorRecord {
        &self.errors
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of failed attempts recorded for this task so far
    pub fn attempts(&self) -> usize {
        self.errors.len()
    }

    pub fn should_retry(&self) -> bool {
        self.errors.should_retry()
    }

    /// Record a failed attempt on the shared history
    pub fn add_error(&self, error: impl Into<anyhow::Error>) {
        self.errors.add_exception(error);
    }

    pub fn into_parts(self) -> (T, R, ErrorRecord) {
        (self.task, self.result, self.errors)
    }
}
