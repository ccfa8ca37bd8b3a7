//! The background service: one engine loop draining a task list
//!
//! The engine loop is responsible for:
//! - Taking ready tasks from the task list
//! - Running the processor on each task's output, with panics isolated
//! - Routing failed attempts through the list's retry decision
//! - Calling the notification hooks and publishing events

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::config::{BackgroundThreadTermination, ServiceConfig};
use super::events::{ServiceEvent, ServiceStats, StatsSnapshot};
use super::processor::TaskProcessor;
use crate::reliability::FailureRecord;
use crate::task::{RetryDecision, TaskList, TaskListError, TaskWrapper};
use crate::unwind::panic_message;

/// Background service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Task list error
    #[error("task list error: {0}")]
    TaskList(#[from] TaskListError),

    /// `start` was called outside a tokio runtime
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// The engine loop ended with a panic or was aborted
    #[error("engine loop terminated abnormally: {0}")]
    EngineFailed(String),
}

/// Background service status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// The engine loop is draining the task list
    Running,
    /// `stop` was requested; the attempt in progress is finishing
    Stopping,
    /// No engine loop is running
    Stopped,
}

struct EngineHandle {
    generation: u64,
    shutdown_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    join: JoinHandle<()>,
}

impl EngineHandle {
    fn is_running(&self) -> bool {
        !*self.done_rx.borrow() && !self.join.is_finished()
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Single-consumer engine over a [`TaskList`]
///
/// Producers add tasks from any thread; one engine loop, spawned by
/// [`start`](Self::start), takes them one at a time and runs the
/// [`TaskProcessor`]. A failed attempt is recorded on the task's error record
/// and handed to [`TaskList::retry`], which requeues the task or moves it to
/// the failure list.
///
/// Dropping the service signals its engine loop to exit.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use dicom_background::prelude::*;
///
/// struct Uploader;
///
/// #[async_trait]
/// impl TaskProcessor<String, String> for Uploader {
///     async fn process_item(&self, study: &String) -> anyhow::Result<()> {
///         println!("uploading {study}");
///         Ok(())
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let config = ServiceConfig::new("uploader")
///     .with_termination(BackgroundThreadTermination::DrainAndExit);
/// let service = BackgroundService::new(
///     Arc::new(OrderedTaskList::new()),
///     Arc::new(Uploader),
///     config,
/// );
///
/// service.add("1.2.840.113619.2.55.3".to_string()).unwrap();
/// service.start().unwrap();
/// service.wait_for_completion().await.unwrap();
///
/// assert_eq!(service.stats().successes, 1);
/// # });
/// ```
pub struct BackgroundService<L, P>
where
    L: TaskList,
    P: TaskProcessor<L::Task, L::Output>,
{
    list: Arc<L>,
    processor: Arc<P>,
    config: ServiceConfig,
    events: broadcast::Sender<ServiceEvent>,
    stats: Arc<ServiceStats>,
    engine: Mutex<Option<EngineHandle>>,
    generation: AtomicU64,
}

impl<L, P> BackgroundService<L, P>
where
    L: TaskList,
    P: TaskProcessor<L::Task, L::Output>,
{
    /// Create a stopped service over `list`
    pub fn new(list: Arc<L>, processor: Arc<P>, config: ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            list,
            processor,
            config,
            events,
            stats: Arc::new(ServiceStats::default()),
            engine: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Start the engine loop if it is not already running
    ///
    /// Tasks added before the call are drained once the loop runs. Called
    /// while a `stop` is still finishing, the new loop starts only after the
    /// old one has exited, so at most one loop takes tasks at any time.
    #[instrument(skip(self), fields(service = %self.config.name))]
    pub fn start(&self) -> Result<(), ServiceError> {
        let runtime = Handle::try_current().map_err(|e| ServiceError::NoRuntime(e.to_string()))?;

        let mut engine = self.engine.lock();
        let previous = match engine.take() {
            Some(handle) if handle.is_running() && !handle.is_stopping() => {
                debug!("Engine loop already running");
                *engine = Some(handle);
                return Ok(());
            }
            Some(handle) if handle.is_running() => {
                debug!("Engine loop still stopping, new loop will wait for it");
                Some(handle.join)
            }
            _ => None,
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let engine_loop = EngineLoop {
            list: Arc::clone(&self.list),
            processor: Arc::clone(&self.processor),
            name: self.config.name.clone(),
            termination: self.config.termination,
            events: self.events.clone(),
            stats: Arc::clone(&self.stats),
        };
        let run = engine_loop.run(shutdown_rx, done_tx);
        let join = match previous {
            Some(previous) => runtime.spawn(async move {
                if let Err(e) = previous.await {
                    warn!(error = %e, "Previous engine loop terminated abnormally");
                }
                run.await;
            }),
            None => runtime.spawn(run),
        };

        info!(
            termination = %self.config.termination,
            pending = self.list.pending(),
            "Background service started"
        );

        *engine = Some(EngineHandle {
            generation,
            shutdown_tx,
            done_rx,
            join,
        });
        Ok(())
    }

    /// Stop the engine loop and wait for it to exit
    ///
    /// The attempt in progress, if any, runs to completion. Queued tasks stay
    /// in the list and are drained after the next [`start`](Self::start).
    ///
    /// The loop stays registered until it has exited, so dropping this future
    /// early leaves the service [`Stopping`](ServiceStatus::Stopping), never
    /// with a second loop. A `start` issued meanwhile wins: `stop` then
    /// returns without touching the replacement loop.
    #[instrument(skip(self), fields(service = %self.config.name))]
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let signalled = self.engine.lock().as_ref().map(|handle| {
            let _ = handle.shutdown_tx.send(true);
            (handle.generation, handle.done_rx.clone())
        });
        let Some((generation, mut done_rx)) = signalled else {
            debug!("Background service not running");
            return Ok(());
        };

        // A dropped sender means the loop is gone as well
        let _ = done_rx.wait_for(|done| *done).await;

        let finished = {
            let mut engine = self.engine.lock();
            let current = engine.as_ref().is_some_and(|h| h.generation == generation);
            if current {
                engine.take()
            } else {
                None
            }
        };
        let Some(handle) = finished else {
            debug!("Engine loop replaced while stopping");
            return Ok(());
        };

        handle
            .join
            .await
            .map_err(|e| ServiceError::EngineFailed(e.to_string()))?;

        info!(pending = self.list.pending(), "Background service stopped");
        Ok(())
    }

    /// Wait for the engine loop to exit on its own
    ///
    /// With [`BackgroundThreadTermination::DrainAndExit`] this returns once the
    /// backlog is processed. A persistent loop only exits through `stop`.
    pub async fn wait_for_completion(&self) -> Result<(), ServiceError> {
        let done_rx = self.engine.lock().as_ref().map(|h| h.done_rx.clone());
        if let Some(mut done_rx) = done_rx {
            // A dropped sender means the loop is gone as well
            let _ = done_rx.wait_for(|done| *done).await;
        }

        let finished = {
            let mut engine = self.engine.lock();
            let exited = engine.as_ref().is_some_and(|h| !h.is_running());
            if exited {
                engine.take()
            } else {
                None
            }
        };
        if let Some(handle) = finished {
            handle
                .join
                .await
                .map_err(|e| ServiceError::EngineFailed(e.to_string()))?;
        }
        Ok(())
    }

    pub fn status(&self) -> ServiceStatus {
        match self.engine.lock().as_ref() {
            Some(handle) if handle.is_running() && handle.is_stopping() => {
                ServiceStatus::Stopping
            }
            Some(handle) if handle.is_running() => ServiceStatus::Running,
            _ => ServiceStatus::Stopped,
        }
    }

    /// Queue a task for processing
    pub fn add(&self, task: L::Task) -> Result<(), TaskListError> {
        self.list.add(task)
    }

    pub fn pending(&self) -> usize {
        self.list.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Tasks whose retries were exhausted
    pub fn failures(&self) -> Vec<FailureRecord<L::Task>> {
        self.list.failures()
    }

    /// Receive lifecycle and attempt events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn list(&self) -> &Arc<L> {
        &self.list
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

/// Why the engine loop exited
enum Exit {
    Stopped,
    Drained,
    ListClosed,
}

struct EngineLoop<L, P> {
    list: Arc<L>,
    processor: Arc<P>,
    name: String,
    termination: BackgroundThreadTermination,
    events: broadcast::Sender<ServiceEvent>,
    stats: Arc<ServiceStats>,
}

impl<L, P> EngineLoop<L, P>
where
    L: TaskList,
    P: TaskProcessor<L::Task, L::Output>,
{
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>, done_tx: watch::Sender<bool>) {
        debug!(service = %self.name, "Engine loop started");
        self.publish(ServiceEvent::Started {
            service: self.name.clone(),
        });

        let exit = loop {
            if *shutdown_rx.borrow() {
                break Exit::Stopped;
            }
            if self.termination == BackgroundThreadTermination::DrainAndExit
                && self.list.is_empty()
            {
                break Exit::Drained;
            }

            let taken = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => None,
                taken = self.list.take() => Some(taken),
            };

            let wrapper = match taken {
                None => break Exit::Stopped,
                Some(Ok(wrapper)) => wrapper,
                Some(Err(e)) => {
                    error!(service = %self.name, error = %e, "Task list failed, engine loop exiting");
                    break Exit::ListClosed;
                }
            };

            self.process(wrapper).await;
        };

        match exit {
            Exit::Stopped => {
                debug!(service = %self.name, "Engine loop: shutdown requested");
                self.publish(ServiceEvent::Stopped {
                    service: self.name.clone(),
                });
            }
            Exit::Drained => {
                info!(service = %self.name, "Backlog drained, engine loop exiting");
                self.publish(ServiceEvent::Drained {
                    service: self.name.clone(),
                });
            }
            Exit::ListClosed => {}
        }

        let _ = done_tx.send(true);
        debug!(service = %self.name, "Engine loop exited");
    }

    async fn process(&self, wrapper: TaskWrapper<L::Task, L::Output>) {
        let sequence = wrapper.sequence();

        let outcome = AssertUnwindSafe(self.processor.process_item(wrapper.result()))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => Some(anyhow!(
                "processor panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        let Some(error) = failure else {
            self.stats.record_success();
            debug!(
                service = %self.name,
                sequence,
                failed_attempts = wrapper.attempts(),
                "Task processed"
            );
            self.guard_hook("notify_success", || self.processor.notify_success(&wrapper));
            self.publish(ServiceEvent::AttemptSucceeded {
                service: self.name.clone(),
                sequence,
                failed_attempts: wrapper.attempts(),
            });
            return;
        };

        let message = format!("{error:#}");
        wrapper.add_error(error);
        let decision = self.list.retry(&wrapper);
        self.stats.record_failure(decision);

        match decision {
            RetryDecision::Requeued => warn!(
                service = %self.name,
                sequence,
                failed_attempts = wrapper.attempts(),
                error = %message,
                "Task failed, will retry"
            ),
            RetryDecision::Failed => error!(
                service = %self.name,
                sequence,
                failed_attempts = wrapper.attempts(),
                error = %message,
                "Task failed permanently"
            ),
        }

        self.guard_hook("notify_failure", || {
            self.processor.notify_failure(&wrapper, decision)
        });
        self.publish(ServiceEvent::AttemptFailed {
            service: self.name.clone(),
            sequence,
            error: message,
            failed_attempts: wrapper.attempts(),
            decision,
        });
    }

    /// Run a notification hook; a panicking hook must not end the loop
    fn guard_hook(&self, hook: &str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            error!(
                service = %self.name,
                hook,
                panic = %panic_message(payload.as_ref()),
                "Notification hook panicked"
            );
        }
    }

    fn publish(&self, event: ServiceEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::reliability::RetryPolicy;
    use crate::task::OrderedTaskList;

    /// Fails each task a configured number of times, then succeeds
    #[derive(Default)]
    struct FlakyProcessor {
        failures_before_success: HashMap<u32, usize>,
        attempts: Mutex<HashMap<u32, usize>>,
        processed: Mutex<Vec<u32>>,
        panic_on: Option<u32>,
    }

    #[async_trait::async_trait]
    impl TaskProcessor<u32, u32> for FlakyProcessor {
        async fn process_item(&self, task: &u32) -> anyhow::Result<()> {
            if self.panic_on == Some(*task) {
                panic!("corrupt pixel data in {task}");
            }
            let attempt = {
                let mut attempts = self.attempts.lock();
                let entry = attempts.entry(*task).or_default();
                *entry += 1;
                *entry
            };
            let allowed = self.failures_before_success.get(task).copied().unwrap_or(0);
            if attempt <= allowed {
                anyhow::bail!("attempt {attempt} of {task} failed");
            }
            self.processed.lock().push(*task);
            Ok(())
        }
    }

    fn instant_list() -> Arc<OrderedTaskList<u32>> {
        Arc::new(OrderedTaskList::with_policy(
            RetryPolicy::bounded().with_retry_delay(Duration::ZERO),
        ))
    }

    fn drain_config() -> ServiceConfig {
        ServiceConfig::new("test").with_termination(BackgroundThreadTermination::DrainAndExit)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_start_requires_runtime() {
        let service = BackgroundService::new(
            instant_list(),
            Arc::new(FlakyProcessor::default()),
            ServiceConfig::default(),
        );
        assert!(matches!(service.start(), Err(ServiceError::NoRuntime(_))));
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_drains_tasks_queued_before_start() {
        let list = instant_list();
        for n in 0..5 {
            list.add(n).unwrap();
        }

        let processor = Arc::new(FlakyProcessor::default());
        let service = BackgroundService::new(list, Arc::clone(&processor), drain_config());
        service.start().unwrap();
        service.wait_for_completion().await.unwrap();

        assert_eq!(*processor.processed.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let service = BackgroundService::new(
            instant_list(),
            Arc::new(FlakyProcessor::default()),
            ServiceConfig::new("idempotent"),
        );
        let mut events = service.subscribe();

        service.start().unwrap();
        service.start().unwrap();
        assert_eq!(service.status(), ServiceStatus::Running);

        service.add(1).unwrap();
        wait_until(|| service.stats().successes == 1).await;
        service.stop().await.unwrap();

        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ServiceEvent::Started { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_stop_then_start_resumes() {
        let processor = Arc::new(FlakyProcessor::default());
        let service = BackgroundService::new(
            instant_list(),
            Arc::clone(&processor),
            ServiceConfig::new("restart"),
        );

        service.start().unwrap();
        service.add(1).unwrap();
        wait_until(|| processor.processed.lock().len() == 1).await;

        service.stop().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Stopped);
        service.stop().await.unwrap();

        service.add(2).unwrap();
        service.add(3).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.pending(), 2);

        service.start().unwrap();
        wait_until(|| processor.processed.lock().len() == 3).await;
        service.stop().await.unwrap();

        assert_eq!(*processor.processed.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_panicking_processor_does_not_kill_loop() {
        let processor = Arc::new(FlakyProcessor {
            panic_on: Some(13),
            ..Default::default()
        });
        let list = instant_list();
        list.add(13).unwrap();
        list.add(14).unwrap();

        let service = BackgroundService::new(list, Arc::clone(&processor), drain_config());
        service.start().unwrap();
        service.wait_for_completion().await.unwrap();

        assert_eq!(*processor.processed.lock(), vec![14]);
        let failures = service.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(*failures[0].task(), 13);
        assert!(failures[0]
            .errors()
            .error_list()
            .iter()
            .all(|e| e.error().to_string().contains("corrupt pixel data")));
    }

    #[tokio::test]
    async fn test_persistent_loop_waits_for_work() {
        let processor = Arc::new(FlakyProcessor::default());
        let service = BackgroundService::new(
            instant_list(),
            Arc::clone(&processor),
            ServiceConfig::new("persistent"),
        );
        service.start().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.status(), ServiceStatus::Running);

        service.add(5).unwrap();
        wait_until(|| processor.processed.lock().len() == 1).await;
        assert_eq!(service.status(), ServiceStatus::Running);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_and_stats() {
        let processor = Arc::new(FlakyProcessor {
            failures_before_success: HashMap::from([(8, 1)]),
            ..Default::default()
        });
        let list = instant_list();
        list.add(8).unwrap();

        let service = BackgroundService::new(list, processor, drain_config());
        let mut events = service.subscribe();
        service.start().unwrap();
        service.wait_for_completion().await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        assert!(matches!(received[0], ServiceEvent::Started { .. }));
        assert!(matches!(
            received[1],
            ServiceEvent::AttemptFailed {
                failed_attempts: 1,
                decision: RetryDecision::Requeued,
                ..
            }
        ));
        assert!(matches!(
            received[2],
            ServiceEvent::AttemptSucceeded {
                failed_attempts: 1,
                ..
            }
        ));
        assert!(matches!(received[3], ServiceEvent::Drained { .. }));

        assert_eq!(
            service.stats(),
            StatsSnapshot {
                attempts: 2,
                successes: 1,
                failed_attempts: 1,
                exhausted: 0,
            }
        );
    }
}
