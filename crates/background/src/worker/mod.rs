//! Worker-pool task list
//!
//! This module provides:
//! - [`WorkerPoolTaskList`] - Runs a job per task on a bounded pool
//! - [`WorkerPoolConfig`] - Pool size and retry policy
//! - [`JobOutcome`] / [`JobError`] - What a completed job hands the processor
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkerPoolTaskList                         │
//! │                                                              │
//! │  add(task) ──► spawn unit ──► [retry delay] ──► Semaphore    │
//! │                                                  (N permits) │
//! │                                                     │        │
//! │         ┌───────────────────────────────────────────┘        │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │  [Job 1] [Job 2] ... [Job N]   (TaskTracker)        │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │ completion order                                   │
//! │         ▼                                                    │
//! │  unbounded channel ──► take()                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod pool;

pub use pool::{JobError, JobOutcome, WorkerPoolConfig, WorkerPoolTaskList};
