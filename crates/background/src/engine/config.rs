//! Background service configuration

use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// What the engine loop does once the task list is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundThreadTermination {
    /// Keep waiting for work until `stop` is called
    #[default]
    Persistent,
    /// Exit as soon as the backlog is drained
    DrainAndExit,
}

impl fmt::Display for BackgroundThreadTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persistent => write!(f, "persistent"),
            Self::DrainAndExit => write!(f, "drain_and_exit"),
        }
    }
}

impl FromStr for BackgroundThreadTermination {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "persistent" | "continue" => Ok(Self::Persistent),
            "drain" | "drain_and_exit" | "terminate" => Ok(Self::DrainAndExit),
            other => Err(ConfigError::InvalidTermination(other.to_string())),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown termination mode: {0} (expected `persistent` or `drain`)")]
    InvalidTermination(String),
}

/// Background service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Name used in log fields and events
    pub name: String,

    /// Engine loop behaviour on an empty task list
    pub termination: BackgroundThreadTermination,

    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: format!("background-{}", Uuid::now_v7()),
            termination: BackgroundThreadTermination::Persistent,
            event_capacity: 256,
        }
    }
}

impl ServiceConfig {
    /// Create a configuration with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the termination mode
    pub fn with_termination(mut self, termination: BackgroundThreadTermination) -> Self {
        self.termination = termination;
        self
    }

    /// Set the per-subscriber event buffer (at least one)
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `BACKGROUND_SERVICE_NAME`: service name (default: generated)
    /// - `BACKGROUND_TERMINATION`: `persistent` or `drain` (default: persistent)
    /// - `BACKGROUND_EVENT_CAPACITY`: events buffered per subscriber (default: 256)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = lookup("BACKGROUND_SERVICE_NAME").filter(|n| !n.trim().is_empty()) {
            config.name = name;
        }

        if let Some(raw) = lookup("BACKGROUND_TERMINATION") {
            match raw.parse() {
                Ok(termination) => config.termination = termination,
                Err(e) => warn!(error = %e, "Ignoring BACKGROUND_TERMINATION"),
            }
        }

        if let Some(raw) = lookup("BACKGROUND_EVENT_CAPACITY") {
            match raw.trim().parse::<usize>() {
                Ok(capacity) => config = config.with_event_capacity(capacity),
                Err(_) => warn!(value = %raw, "Ignoring invalid BACKGROUND_EVENT_CAPACITY"),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert!(config.name.starts_with("background-"));
        assert_eq!(config.termination, BackgroundThreadTermination::Persistent);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_config_builder() {
        let config = ServiceConfig::new("dicom-import")
            .with_termination(BackgroundThreadTermination::DrainAndExit)
            .with_event_capacity(0);

        assert_eq!(config.name, "dicom-import");
        assert_eq!(config.termination, BackgroundThreadTermination::DrainAndExit);
        assert_eq!(config.event_capacity, 1);
    }

    #[test]
    fn test_termination_parsing() {
        assert_eq!(
            "persistent".parse::<BackgroundThreadTermination>(),
            Ok(BackgroundThreadTermination::Persistent)
        );
        assert_eq!(
            " Drain ".parse::<BackgroundThreadTermination>(),
            Ok(BackgroundThreadTermination::DrainAndExit)
        );
        assert_eq!(
            "sometimes".parse::<BackgroundThreadTermination>(),
            Err(ConfigError::InvalidTermination("sometimes".to_string()))
        );
    }

    #[test]
    fn test_from_lookup() {
        let config = ServiceConfig::from_lookup(|key| match key {
            "BACKGROUND_SERVICE_NAME" => Some("uploader".to_string()),
            "BACKGROUND_TERMINATION" => Some("drain_and_exit".to_string()),
            "BACKGROUND_EVENT_CAPACITY" => Some("not-a-number".to_string()),
            _ => None,
        });

        assert_eq!(config.name, "uploader");
        assert_eq!(config.termination, BackgroundThreadTermination::DrainAndExit);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_serialization() {
        let config = ServiceConfig::new("query")
            .with_termination(BackgroundThreadTermination::DrainAndExit);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"termination\":\"drain_and_exit\""));

        let parsed: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
