//! Worker-pool task list
//!
//! Executes a caller-supplied job for every admitted task on at most
//! `pool_size` concurrent workers and hands out results in completion order.

use std::env;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use crate::reliability::{ErrorRecord, FailureList, RetryPolicy};
use crate::task::{TaskList, TaskListError, TaskWrapper};
use crate::unwind::panic_message;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent job executions
    pub pool_size: usize,

    /// Policy given to newly added tasks
    pub retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with `pool_size` workers
    pub fn new(pool_size: usize) -> Self {
        Self::default().with_pool_size(pool_size)
    }

    /// Set the number of workers (at least one)
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Set the retry policy for new tasks
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `BACKGROUND_POOL_SIZE`: number of workers (default: 4)
    /// - plus those read by [`RetryPolicy::from_env`]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self {
            retry: RetryPolicy::from_lookup(&lookup),
            ..Self::default()
        };

        if let Some(raw) = lookup("BACKGROUND_POOL_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(size) => config = config.with_pool_size(size),
                Err(_) => warn!(value = %raw, "Ignoring invalid BACKGROUND_POOL_SIZE"),
            }
        }

        config
    }
}

/// Why a job produced no value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The job returned an error
    #[error("job failed: {0}")]
    Failed(String),

    /// The job panicked
    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Completed value of one job execution
pub type JobOutcome<O> = Result<O, JobError>;

type Job<T, O> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;

/// Task list that runs every admitted task on a bounded pool
///
/// The processor receives a [`JobOutcome`]; returning the job's error from
/// `process_item` routes the task through the usual retry path, which runs
/// the job again.
///
/// # Example
///
/// ```
/// use dicom_background::worker::{WorkerPoolConfig, WorkerPoolTaskList};
/// use dicom_background::TaskList;
///
/// # tokio_test::block_on(async {
/// let uploads = WorkerPoolTaskList::new(WorkerPoolConfig::new(2), |file: String| async move {
///     Ok::<_, anyhow::Error>(file.len())
/// })
/// .unwrap();
///
/// uploads.add("IM000001.dcm".to_string()).unwrap();
/// let done = uploads.take().await.unwrap();
/// assert_eq!(done.result(), &Ok(12));
/// # });
/// ```
pub struct WorkerPoolTaskList<T, O> {
    config: WorkerPoolConfig,
    job: Job<T, O>,
    runtime: Handle,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    completed_tx: mpsc::UnboundedSender<TaskWrapper<T, JobOutcome<O>>>,
    completed_rx: Mutex<mpsc::UnboundedReceiver<TaskWrapper<T, JobOutcome<O>>>>,
    sequence: AtomicU64,
    pending: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    closed: AtomicBool,
    failures: FailureList<T>,
}

impl<T, O> WorkerPoolTaskList<T, O>
where
    T: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Create a pool on the current tokio runtime
    pub fn new<F, Fut>(config: WorkerPoolConfig, job: F) -> Result<Self, TaskListError>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let runtime =
            Handle::try_current().map_err(|e| TaskListError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(runtime, config, job))
    }

    /// Create a pool whose workers run on `runtime`
    pub fn with_handle<F, Fut>(runtime: Handle, config: WorkerPoolConfig, job: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let config = WorkerPoolConfig {
            pool_size: config.pool_size.max(1),
            ..config
        };
        let job: Job<T, O> = Arc::new(move |task| Box::pin(job(task)));
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();

        info!(pool_size = config.pool_size, "Worker pool task list created");

        Self {
            permits: Arc::new(Semaphore::new(config.pool_size)),
            config,
            job,
            runtime,
            tracker: TaskTracker::new(),
            completed_tx,
            completed_rx: Mutex::new(completed_rx),
            sequence: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            failures: FailureList::new(),
        }
    }

    /// Number of workers
    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// Jobs currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop admitting tasks and wait for submitted jobs to finish
    ///
    /// Results of those jobs remain available to `take`.
    #[instrument(skip(self), fields(pool_size = self.config.pool_size))]
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            submitted = self.tracker.len(),
            "Shutting down worker pool, waiting for submitted jobs"
        );
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Worker pool drained");
    }
}

#[async_trait]
impl<T, O> TaskList for WorkerPoolTaskList<T, O>
where
    T: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    type Task = T;
    type Output = JobOutcome<O>;

    fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    fn add_with_errors(&self, task: T, errors: ErrorRecord) -> Result<(), TaskListError> {
        if self.is_closed() {
            return Err(TaskListError::Closed);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::SeqCst);

        let delay = errors.retry_delay();
        let job = Arc::clone(&self.job);
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let completed = self.completed_tx.clone();

        let unit = async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            // The semaphore is never closed, so the permit is always granted
            let permit = permits.acquire_owned().await;
            in_flight.fetch_add(1, Ordering::SeqCst);
            trace!(sequence, "Job started");

            let input = task.clone();
            let outcome = match AssertUnwindSafe(async move { job(input).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(JobError::Failed(format!("{e:#}"))),
                Err(payload) => Err(JobError::Panicked(panic_message(payload.as_ref()))),
            };

            in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            trace!(sequence, ok = outcome.is_ok(), "Job finished");

            if completed
                .send(TaskWrapper::new(task, outcome, errors, sequence))
                .is_err()
            {
                debug!(sequence, "Task list dropped before job completed");
            }
        };

        self.tracker.spawn_on(unit, &self.runtime);
        Ok(())
    }

    async fn take(&self) -> Result<TaskWrapper<T, JobOutcome<O>>, TaskListError> {
        if self.is_closed() && self.pending() == 0 {
            return Err(TaskListError::Closed);
        }

        let mut completed = self.completed_rx.lock().await;
        match completed.recv().await {
            Some(wrapper) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Ok(wrapper)
            }
            None => Err(TaskListError::Closed),
        }
    }

    fn failure_list(&self) -> &FailureList<T> {
        &self.failures
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use anyhow::anyhow;

    use super::*;
    use crate::task::RetryDecision;

    fn instant_pool<F, Fut>(pool_size: usize, job: F) -> WorkerPoolTaskList<u32, u32>
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<u32>> + Send + 'static,
    {
        let config = WorkerPoolConfig::new(pool_size).with_retry_policy(RetryPolicy::instant());
        WorkerPoolTaskList::new(config, job).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.retry, RetryPolicy::bounded());
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new(0)
            .with_retry_policy(RetryPolicy::instant().with_max_attempts(2));
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.retry.max_attempts, Some(2));

        assert_eq!(WorkerPoolConfig::new(12).pool_size, 12);
    }

    #[test]
    fn test_config_from_lookup() {
        let config = WorkerPoolConfig::from_lookup(|key| match key {
            "BACKGROUND_POOL_SIZE" => Some("8".to_string()),
            "BACKGROUND_RETRY_DELAY_MS" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.retry.retry_delay, Duration::ZERO);
        assert_eq!(config.retry.max_attempts, Some(3));

        let fallback = WorkerPoolConfig::from_lookup(|_| Some("many".to_string()));
        assert_eq!(fallback.pool_size, 4);
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = WorkerPoolTaskList::<u32, u32>::new(WorkerPoolConfig::default(), |n| async move {
            Ok(n)
        });
        assert!(matches!(result, Err(TaskListError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_results_are_job_outputs() {
        let pool = instant_pool(3, |n| async move { Ok(n * 10) });
        for n in 1..=5 {
            pool.add(n).unwrap();
        }

        let mut outputs = HashSet::new();
        for _ in 0..5 {
            let wrapper = pool.take().await.unwrap();
            assert_eq!(wrapper.result(), &Ok(*wrapper.task() * 10));
            outputs.insert(*wrapper.task());
        }
        assert_eq!(outputs, (1..=5).collect::<HashSet<_>>());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_job_errors_and_panics_are_captured() {
        let pool = instant_pool(2, |n| async move {
            match n {
                0 => Err(anyhow!("archive rejected upload")),
                1 => panic!("decoder blew up"),
                _ => Ok(n),
            }
        });
        pool.add(0).unwrap();
        pool.add(1).unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let wrapper = pool.take().await.unwrap();
            outcomes.push((*wrapper.task(), wrapper.result().clone()));
        }
        outcomes.sort_by_key(|(task, _)| *task);

        assert_eq!(
            outcomes[0].1,
            Err(JobError::Failed("archive rejected upload".to_string()))
        );
        assert_eq!(
            outcomes[1].1,
            Err(JobError::Panicked("decoder blew up".to_string()))
        );
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pool = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            instant_pool(3, move |n| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
        };

        for n in 0..20 {
            pool.add(n).unwrap();
        }
        for _ in 0..20 {
            pool.take().await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_retry_runs_job_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = {
            let calls = Arc::clone(&calls);
            instant_pool(1, move |n| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(anyhow!("first attempt times out"))
                    } else {
                        Ok(n)
                    }
                }
            })
        };

        pool.add(9).unwrap();
        let first = pool.take().await.unwrap();
        assert!(first.result().is_err());
        first.add_error(anyhow!("first attempt times out"));

        assert_eq!(pool.retry(&first), RetryDecision::Requeued);
        assert_eq!(pool.pending(), 1);

        let second = pool.take().await.unwrap();
        assert_eq!(second.result(), &Ok(9));
        assert_eq!(second.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_tasks() {
        let pool = instant_pool(2, |n| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(n)
        });
        pool.add(1).unwrap();
        pool.add(2).unwrap();

        pool.shutdown().await;
        assert!(pool.is_closed());
        assert_eq!(pool.add(3), Err(TaskListError::Closed));

        // Work submitted before shutdown is still delivered
        pool.take().await.unwrap();
        pool.take().await.unwrap();
        assert_eq!(pool.take().await.err(), Some(TaskListError::Closed));
    }

    #[tokio::test]
    async fn test_retry_after_shutdown_fails_task() {
        let pool = instant_pool(1, |_| async move { Err(anyhow!("offline")) });
        pool.add(4).unwrap();
        let wrapper = pool.take().await.unwrap();
        wrapper.add_error(anyhow!("offline"));

        pool.shutdown().await;
        assert_eq!(pool.retry(&wrapper), RetryDecision::Failed);
        assert_eq!(pool.failures().len(), 1);
    }
}
