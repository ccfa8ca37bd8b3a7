//! Background service engine
//!
//! The engine module provides the [`BackgroundService`], which runs a single
//! consumer loop over a [`TaskList`](crate::task::TaskList) and reports every
//! processing attempt to a [`TaskProcessor`].

mod config;
mod events;
mod processor;
mod service;

pub use config::{BackgroundThreadTermination, ConfigError, ServiceConfig};
pub use events::{ServiceEvent, ServiceStats, StatsSnapshot};
pub use processor::TaskProcessor;
pub use service::{BackgroundService, ServiceError, ServiceStatus};
