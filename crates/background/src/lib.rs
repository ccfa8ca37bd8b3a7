//! # Background Processing Engine
//!
//! A task-queue-with-retry engine that moves slow, failure-prone work
//! (network uploads, file imports, DICOM retrieves) off the caller.
//!
//! ## Features
//!
//! - **Per-task failure history**: every failed attempt is recorded with its timestamp
//! - **Retry policies**: bounded with a delay for production, unbounded and immediate for tests
//! - **Two task list strategies**: strict FIFO, or a bounded worker pool yielding in completion order
//! - **Single-consumer engine**: start/stop/restart without losing queued work
//! - **Notifications**: per-attempt hooks, broadcast events and running counters
//!
//! ## Architecture
//!
//! ```text
//!   producers (any thread)
//!          │ add(task)
//!          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TaskList                             │
//! │   OrderedTaskList (FIFO)  |  WorkerPoolTaskList (N jobs)     │
//! └─────────────────────────────────────────────────────────────┘
//!          │ take()                          ▲ retry(wrapper)
//!          ▼                                 │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BackgroundService                         │
//! │  (one engine loop: process_item → notify_success/failure)   │
//! └─────────────────────────────────────────────────────────────┘
//!                                            │ retries exhausted
//!                                            ▼
//!                                      FailureList
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use dicom_background::prelude::*;
//!
//! let uploads = WorkerPoolTaskList::new(WorkerPoolConfig::from_env(), |study: Study| async move {
//!     client.upload(&study).await
//! })?;
//!
//! let service = BackgroundService::new(
//!     Arc::new(uploads),
//!     Arc::new(UploadProgress::new(ui_sender)),
//!     ServiceConfig::new("uploader"),
//! );
//! service.start()?;
//! service.add(study)?;
//!
//! // ... at application shutdown
//! service.stop().await?;
//! for failure in service.failures() {
//!     report(failure.task(), failure.errors());
//! }
//! ```

mod duration_millis;
mod unwind;

pub mod engine;
pub mod reliability;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        BackgroundService, BackgroundThreadTermination, ServiceConfig, ServiceError,
        ServiceEvent, ServiceStatus, StatsSnapshot, TaskProcessor,
    };
    pub use crate::reliability::{ErrorEntry, ErrorRecord, FailureList, FailureRecord, RetryPolicy};
    pub use crate::task::{OrderedTaskList, RetryDecision, TaskList, TaskListError, TaskWrapper};
    pub use crate::worker::{JobError, JobOutcome, WorkerPoolConfig, WorkerPoolTaskList};
}

// Re-export key types at crate root
pub use engine::{
    BackgroundService, BackgroundThreadTermination, ConfigError, ServiceConfig, ServiceError,
    ServiceEvent, ServiceStats, ServiceStatus, StatsSnapshot, TaskProcessor,
};
pub use reliability::{ErrorEntry, ErrorRecord, FailureList, FailureRecord, RetryPolicy};
pub use task::{OrderedTaskList, RetryDecision, TaskList, TaskListError, TaskWrapper};
pub use worker::{JobError, JobOutcome, WorkerPoolConfig, WorkerPoolTaskList};
