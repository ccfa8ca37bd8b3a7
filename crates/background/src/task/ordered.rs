//! First-in, first-out task list
//!
//! Tasks are not executed on admission; the task itself is the output handed
//! to the processor. Admission never blocks and works outside a runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::list::{TaskList, TaskListError};
use super::wrapper::TaskWrapper;
use crate::reliability::{ErrorRecord, FailureList, RetryPolicy};

/// A retried task waiting out its delay
struct Delayed<T> {
    ready_at: Instant,
    wrapper: TaskWrapper<T, T>,
}

struct QueueState<T> {
    ready: VecDeque<TaskWrapper<T, T>>,
    /// Sorted by `ready_at`
    delayed: Vec<Delayed<T>>,
}

impl<T> QueueState<T> {
    fn promote_due(&mut self, now: Instant) {
        let due = self.delayed.partition_point(|d| d.ready_at <= now);
        for delayed in self.delayed.drain(..due) {
            self.ready.push_back(delayed.wrapper);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.first().map(|d| d.ready_at)
    }

    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}

/// Unbounded FIFO task list
///
/// # Example
///
/// ```
/// use dicom_background::{OrderedTaskList, TaskList};
///
/// # tokio_test::block_on(async {
/// let list = OrderedTaskList::new();
/// list.add("import /media/cdrom/DICOMDIR").unwrap();
/// list.add("import /home/user/scans").unwrap();
///
/// let first = list.take().await.unwrap();
/// assert_eq!(*first.result(), "import /media/cdrom/DICOMDIR");
/// # });
/// ```
pub struct OrderedTaskList<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
    sequence: AtomicU64,
    policy: RetryPolicy,
    failures: FailureList<T>,
}

impl<T> Default for OrderedTaskList<T> {
    fn default() -> Self {
        Self::with_policy(RetryPolicy::default())
    }
}

impl<T> OrderedTaskList<T> {
    /// Create a list using the bounded retry policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a list whose new tasks are governed by `policy`
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                delayed: Vec::new(),
            }),
            available: Notify::new(),
            sequence: AtomicU64::new(0),
            policy,
            failures: FailureList::new(),
        }
    }
}

#[async_trait]
impl<T> TaskList for OrderedTaskList<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Task = T;
    type Output = T;

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn add_with_errors(&self, task: T, errors: ErrorRecord) -> Result<(), TaskListError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let delay = errors.retry_delay();
        let wrapper = TaskWrapper::new(task.clone(), task, errors, sequence);

        {
            let mut state = self.state.lock();
            if delay.is_zero() {
                state.ready.push_back(wrapper);
            } else {
                let ready_at = Instant::now() + delay;
                let index = state.delayed.partition_point(|d| d.ready_at <= ready_at);
                state.delayed.insert(index, Delayed { ready_at, wrapper });
                trace!(sequence, delay_ms = delay.as_millis() as u64, "Task delayed");
            }
        }

        self.available.notify_one();
        Ok(())
    }

    async fn take(&self) -> Result<TaskWrapper<T, T>, TaskListError> {
        loop {
            let notified = self.available.notified();

            let deadline = {
                let mut state = self.state.lock();
                state.promote_due(Instant::now());
                if let Some(wrapper) = state.ready.pop_front() {
                    return Ok(wrapper);
                }
                state.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn failure_list(&self) -> &FailureList<T> {
        &self.failures
    }

    fn pending(&self) -> usize {
        self.state.lock().len()
    }
}
