//! Error types for agent-scheduler operations.
//!
//! Defines error types for the major subsystems:
//! - Coordination store access and Lua scripts
//! - Configuration loading and validation
//! - Scheduler lifecycle

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the coordination store and its script layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store refused or could not be reached (used by non-Redis stores).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Scripts have not been initialized")]
    ScriptsNotInitialized,

    #[error("Unexpected result from script '{script}': {detail}")]
    UnexpectedResult { script: &'static str, detail: String },

    #[error("Invalid store argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// True when the error means the store is unreachable rather than that
    /// a single command misbehaved.
    pub fn is_connection_error(&self) -> bool {
        match self {
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            StoreError::Unavailable(_) => true,
            _ => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            StoreError::Redis(_) if self.is_connection_error() => "redis_connection",
            StoreError::Redis(_) => "redis",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::ScriptsNotInitialized => "scripts_not_initialized",
            StoreError::UnexpectedResult { .. } => "unexpected_result",
            StoreError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("Invalid pattern '{field}': {source}")]
    Pattern {
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the scheduler's public lifecycle operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}
