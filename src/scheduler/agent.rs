//! Agent definitions and the callback contracts the scheduler drives.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named, recurring unit of work.
///
/// The scheduler does not own agent identity; callers register agents and
/// the scheduler only tracks their scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    agent_type: String,
    provider_name: String,
    interval: Duration,
    timeout: Duration,
    error_interval: Duration,
}

impl Agent {
    /// Creates an agent whose error interval equals its interval.
    pub fn new(
        agent_type: impl Into<String>,
        provider_name: impl Into<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            provider_name: provider_name.into(),
            interval,
            timeout,
            error_interval: interval,
        }
    }

    pub fn with_error_interval(mut self, error_interval: Duration) -> Self {
        self.error_interval = error_interval;
        self
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn error_interval(&self) -> Duration {
        self.error_interval
    }

    pub(crate) fn interval_ms(&self) -> i64 {
        self.interval.as_millis() as i64
    }

    pub(crate) fn timeout_ms(&self) -> i64 {
        self.timeout.as_millis() as i64
    }

    pub(crate) fn timeout_secs(&self) -> i64 {
        self.timeout.as_secs() as i64
    }

    pub(crate) fn error_interval_ms(&self) -> i64 {
        self.error_interval.as_millis() as i64
    }
}

/// Coarse category of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentErrorKind {
    /// Execution was cancelled before or while running.
    Interrupted,
    /// Network or file I/O failure.
    Io,
    /// The process ran out of a local resource (memory, handles).
    ResourceExhausted,
    /// A remote service returned an error; see `status` and `code`.
    Service,
    Other,
}

/// Terminal error of an agent execution.
///
/// Executions fill in whatever they know; the failure classifier reads
/// `kind`, `status`, `retryable`, `code` and `message` to pick a backoff.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub status: Option<u16>,
    pub retryable: Option<bool>,
    pub code: Option<String>,
    pub message: String,
}

impl AgentError {
    pub fn new(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            retryable: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Interrupted, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Other, message)
    }

    /// A service error carrying an HTTP-style status code.
    pub fn service(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(AgentErrorKind::Service, message)
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::new(AgentErrorKind::Io, e.to_string())
    }
}

/// The work an agent performs. `Ok` is success, `Err` is a failure that
/// feeds the backoff policy.
#[async_trait]
pub trait AgentExecution: Send + Sync {
    async fn execute(&self, agent: &Agent) -> Result<(), AgentError>;
}

/// Observability hooks around each execution. All methods default to no-ops.
pub trait ExecutionInstrumentation: Send + Sync {
    fn execution_started(&self, _agent: &Agent) {}
    fn execution_completed(&self, _agent: &Agent, _elapsed: Duration) {}
    fn execution_failed(&self, _agent: &Agent, _error: &AgentError, _elapsed: Duration) {}
}

/// Instrumentation that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstrumentation;

impl ExecutionInstrumentation for NoopInstrumentation {}

/// Instrumentation that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInstrumentation;

impl ExecutionInstrumentation for LoggingInstrumentation {
    fn execution_started(&self, agent: &Agent) {
        tracing::debug!(agent = %agent.agent_type(), "Agent execution started");
    }

    fn execution_completed(&self, agent: &Agent, elapsed: Duration) {
        tracing::debug!(
            agent = %agent.agent_type(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Agent execution completed"
        );
    }

    fn execution_failed(&self, agent: &Agent, error: &AgentError, elapsed: Duration) {
        tracing::warn!(
            agent = %agent.agent_type(),
            elapsed_ms = elapsed.as_millis() as u64,
            error = %error,
            "Agent execution failed"
        );
    }
}

#[derive(Debug, Clone, Error)]
#[error("Shard ownership check failed: {0}")]
pub struct ShardingError(pub String);

/// Decides whether this pod owns an agent.
pub trait ShardingFilter: Send + Sync {
    fn owns(&self, agent_type: &str) -> Result<bool, ShardingError>;
}

/// Single-shard deployments: this pod owns everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnAllShards;

impl ShardingFilter for OwnAllShards {
    fn owns(&self, _agent_type: &str) -> Result<bool, ShardingError> {
        Ok(true)
    }
}

/// Whether this node should schedule at all (e.g. out of service).
pub trait NodeStatusProvider: Send + Sync {
    fn is_node_enabled(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEnabled;

impl NodeStatusProvider for AlwaysEnabled {
    fn is_node_enabled(&self) -> bool {
        true
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_name, self.agent_type)
    }
}
