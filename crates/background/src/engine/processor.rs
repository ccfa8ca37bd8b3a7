//! Caller-supplied processing logic and notification hooks

use async_trait::async_trait;

use crate::task::{RetryDecision, TaskWrapper};

/// Work performed by a [`BackgroundService`](super::BackgroundService) on each task
///
/// `process_item` runs on the engine task. Any error it returns, or any panic
/// it raises, counts as a failed attempt and is routed through the task
/// list's retry decision.
///
/// The notification hooks are called once per attempt, also on the engine
/// task, so they must return promptly: hand UI updates off to another thread
/// or channel instead of doing them inline.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use dicom_background::{RetryDecision, TaskProcessor, TaskWrapper};
///
/// struct Importer;
///
/// #[async_trait]
/// impl TaskProcessor<String, String> for Importer {
///     async fn process_item(&self, path: &String) -> anyhow::Result<()> {
///         anyhow::ensure!(path.ends_with(".dcm"), "not a DICOM file: {path}");
///         Ok(())
///     }
///
///     fn notify_failure(&self, wrapper: &TaskWrapper<String, String>, decision: RetryDecision) {
///         eprintln!("{} {decision} after {} failures", wrapper.task(), wrapper.attempts());
///     }
/// }
/// ```
#[async_trait]
pub trait TaskProcessor<T, R>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Perform the unit of work for one task
    async fn process_item(&self, result: &R) -> anyhow::Result<()>;

    /// Called after a successful attempt
    fn notify_success(&self, _wrapper: &TaskWrapper<T, R>) {}

    /// Called after a failed attempt, once the retry decision was made
    fn notify_failure(&self, _wrapper: &TaskWrapper<T, R>, _decision: RetryDecision) {}
}
