//! Terminal store for tasks whose retries ran out

use parking_lot::Mutex;

use super::error_record::ErrorRecord;

/// A task that was given up on, with the failures that exhausted it
#[derive(Debug, Clone)]
pub struct FailureRecord<T> {
    task: T,
    errors: ErrorRecord,
}

impl<T> FailureRecord<T> {
    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn errors(&self) -> &ErrorRecord {
        &self.errors
    }

    pub fn into_parts(self) -> (T, ErrorRecord) {
        (self.task, self.errors)
    }
}

/// Append-only list of permanently failed tasks, in the order they failed
#[derive(Debug)]
pub struct FailureList<T> {
    records: Mutex<Vec<FailureRecord<T>>>,
}

impl<T> Default for FailureList<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<T> FailureList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task as permanently failed
    pub fn add_failure(&self, task: T, errors: ErrorRecord) {
        self.records.lock().push(FailureRecord { task, errors });
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

impl<T: Clone> FailureList<T> {
    /// Snapshot of all failures, oldest first
    pub fn failures(&self) -> Vec<FailureRecord<T>> {
        self.records.lock().clone()
    }
}
