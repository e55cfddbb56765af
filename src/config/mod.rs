//! Scheduler configuration.
//!
//! All tunables for the scheduler live in [`SchedulerConfig`]. The struct is
//! deserialized from YAML (every field has a default, so a partial file is
//! fine), validated once at startup, and then shared read-only behind an
//! `Arc` by every component.
//!
//! ```yaml
//! interval_ms: 1000
//! max_concurrent_agents: 20
//! batch_operations:
//!   batch_size: 50
//! zombie_cleanup:
//!   threshold_ms: 30000
//!   exceptional_agents:
//!     pattern: "^slow-.*"
//!     threshold_ms: 3600000
//! keys:
//!   prefix: "prod:"
//!   hash_tag: "sched"
//! ```

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::scheduler::agent::Agent;

/// Minimum margin between the orphan leadership TTL and the orphan run budget.
const LEADERSHIP_MARGIN_MS: i64 = 60_000;

/// Circuit breaker thresholds shared by the acquisition and store breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub failure_window_ms: i64,
    pub cooldown_ms: i64,
    pub half_open_duration_ms: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            failure_window_ms: 10_000,
            cooldown_ms: 30_000,
            half_open_duration_ms: 5_000,
        }
    }
}

/// Batched store operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOperationsConfig {
    pub enabled: bool,
    /// Entries per chunk/batch. 0 means a single unbounded chunk.
    pub batch_size: usize,
    /// Expected over-scan factor when sharding filters out most candidates.
    pub chunk_attempt_multiplier: f64,
}

impl Default for BatchOperationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 0,
            chunk_attempt_multiplier: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottledBackoffConfig {
    pub base_ms: i64,
    pub multiplier: f64,
    pub cap_ms: i64,
}

impl Default for ThrottledBackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 30_000,
            multiplier: 2.0,
            cap_ms: 600_000,
        }
    }
}

/// Per-failure-class backoff policy. Disabled means every failure waits
/// the agent's error interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureBackoffConfig {
    pub enabled: bool,
    pub max_immediate_retries: u32,
    pub permanent_forbidden_backoff_ms: i64,
    pub throttled: ThrottledBackoffConfig,
}

impl Default for FailureBackoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_immediate_retries: 0,
            permanent_forbidden_backoff_ms: 1_800_000,
            throttled: ThrottledBackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Upper bound of the random delay given to newly registered agents.
    pub initial_registration_seconds: i64,
    /// Upper bound of the random delay used when requeueing on shutdown.
    pub shutdown_seconds: i64,
    /// Relative jitter applied to failure backoff offsets, in [0, 1].
    pub failure_backoff_ratio: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            initial_registration_seconds: 0,
            shutdown_seconds: 0,
            failure_backoff_ratio: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionalAgentsConfig {
    pub pattern: String,
    pub threshold_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZombieCleanupConfig {
    pub enabled: bool,
    pub threshold_ms: i64,
    pub interval_ms: i64,
    pub exceptional_agents: ExceptionalAgentsConfig,
    pub executor_shutdown_await_ms: i64,
    pub executor_shutdown_force_await_ms: i64,
    pub run_budget_ms: i64,
}

impl Default for ZombieCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: 30_000,
            interval_ms: 300_000,
            exceptional_agents: ExceptionalAgentsConfig {
                pattern: String::new(),
                threshold_ms: 3_600_000,
            },
            executor_shutdown_await_ms: 10_000,
            executor_shutdown_force_await_ms: 5_000,
            run_budget_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanCleanupConfig {
    pub enabled: bool,
    pub threshold_ms: i64,
    pub interval_ms: i64,
    pub leadership_ttl_ms: i64,
    pub force_all_pods: bool,
    pub executor_shutdown_await_ms: i64,
    pub executor_shutdown_force_await_ms: i64,
    pub run_budget_ms: i64,
    pub remove_numeric_only_agents: bool,
}

impl Default for OrphanCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: 600_000,
            interval_ms: 300_000,
            leadership_ttl_ms: 120_000,
            force_all_pods: false,
            executor_shutdown_await_ms: 10_000,
            executor_shutdown_force_await_ms: 5_000,
            run_budget_ms: 0,
            remove_numeric_only_agents: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub executor_shutdown_await_ms: i64,
    pub executor_shutdown_force_await_ms: i64,
    pub run_budget_ms: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            executor_shutdown_await_ms: 5_000,
            executor_shutdown_force_await_ms: 2_000,
            run_budget_ms: 0,
        }
    }
}

/// Store key names. See [`crate::scheduler::keys::SchedulerKeys`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub waiting_set: String,
    pub working_set: String,
    pub cleanup_leader_key: String,
    pub prefix: String,
    pub hash_tag: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            waiting_set: "waiting".to_string(),
            working_set: "working".to_string(),
            cleanup_leader_key: "cleanup-leader".to_string(),
            prefix: String::new(),
            hash_tag: String::new(),
        }
    }
}

/// An agent declared in the configuration file. Used by the CLI to drive
/// demo agents; library callers register [`Agent`]s directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub agent_type: String,
    #[serde(default = "default_provider")]
    pub provider_name: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    #[serde(default)]
    pub error_interval_ms: Option<u64>,
    /// Simulated run time for demo executions.
    #[serde(default)]
    pub work_ms: u64,
}

fn default_provider() -> String {
    "config".to_string()
}

impl AgentDefinition {
    pub fn to_agent(&self) -> Agent {
        Agent::new(
            &self.agent_type,
            &self.provider_name,
            Duration::from_millis(self.interval_ms),
            Duration::from_millis(self.timeout_ms),
        )
        .with_error_interval(Duration::from_millis(
            self.error_interval_ms.unwrap_or(self.interval_ms),
        ))
    }
}

/// Complete scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick period of the orchestrator.
    pub interval_ms: i64,
    pub refresh_period_seconds: i64,
    /// 0 disables the periodic health line.
    pub health_summary_period_seconds: i64,
    pub time_cache_duration_ms: i64,
    /// Values <= 0 run without a concurrency limit.
    pub max_concurrent_agents: i64,
    pub enabled_pattern: String,
    pub disabled_pattern: String,
    /// Maximum in-flight executions the pool accepts. 0 means unbounded.
    pub pool_capacity: usize,
    pub batch_operations: BatchOperationsConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub failure_backoff: FailureBackoffConfig,
    pub jitter: JitterConfig,
    pub zombie_cleanup: ZombieCleanupConfig,
    pub orphan_cleanup: OrphanCleanupConfig,
    pub reconcile: ReconcileConfig,
    pub keys: KeysConfig,
    pub agents: Vec<AgentDefinition>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            refresh_period_seconds: 30,
            health_summary_period_seconds: 600,
            time_cache_duration_ms: 10_000,
            max_concurrent_agents: 100,
            enabled_pattern: ".*".to_string(),
            disabled_pattern: String::new(),
            pool_capacity: 0,
            batch_operations: BatchOperationsConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            failure_backoff: FailureBackoffConfig::default(),
            jitter: JitterConfig::default(),
            zombie_cleanup: ZombieCleanupConfig::default(),
            orphan_cleanup: OrphanCleanupConfig::default(),
            reconcile: ReconcileConfig::default(),
            keys: KeysConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Loads and validates a YAML configuration file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parses and validates YAML configuration text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Sets the maximum number of concurrently executing agents.
    pub fn with_max_concurrent_agents(mut self, max: i64) -> Self {
        self.max_concurrent_agents = max;
        self
    }

    /// Sets the chunk/batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_operations.batch_size = batch_size;
        self
    }

    /// Enables or disables batched store operations.
    pub fn with_batch_operations(mut self, enabled: bool) -> Self {
        self.batch_operations.enabled = enabled;
        self
    }

    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys.prefix = prefix.into();
        self
    }

    /// Sets the pattern agents must fully match to be scheduled here.
    pub fn with_enabled_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.enabled_pattern = pattern.into();
        self
    }

    /// Sets the pattern that excludes agents even when enabled.
    pub fn with_disabled_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.disabled_pattern = pattern.into();
        self
    }

    pub fn with_zombie_threshold(mut self, threshold: Duration) -> Self {
        self.zombie_cleanup.threshold_ms = threshold.as_millis() as i64;
        self
    }

    pub fn with_orphan_threshold(mut self, threshold: Duration) -> Self {
        self.orphan_cleanup.threshold_ms = threshold.as_millis() as i64;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1) as u64)
    }

    /// Refresh period in milliseconds, never below one second.
    pub fn refresh_period_ms(&self) -> i64 {
        self.refresh_period_seconds.max(1) * 1000
    }

    /// Validates every field, returning the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_positive(self.interval_ms, "interval_ms")?;
        validate_positive(self.refresh_period_seconds, "refresh_period_seconds")?;
        validate_non_negative(
            self.health_summary_period_seconds,
            "health_summary_period_seconds",
        )?;
        validate_non_negative(self.time_cache_duration_ms, "time_cache_duration_ms")?;

        let multiplier = self.batch_operations.chunk_attempt_multiplier;
        if multiplier < 0.0 || !multiplier.is_finite() {
            return Err(ConfigError::invalid(
                "batch_operations.chunk_attempt_multiplier",
                format!("must be >= 0 and finite (was {})", multiplier),
            ));
        }

        for (field, value) in [
            ("keys.waiting_set", &self.keys.waiting_set),
            ("keys.working_set", &self.keys.working_set),
            ("keys.cleanup_leader_key", &self.keys.cleanup_leader_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
        }

        validate_non_negative(
            self.jitter.initial_registration_seconds,
            "jitter.initial_registration_seconds",
        )?;
        validate_non_negative(self.jitter.shutdown_seconds, "jitter.shutdown_seconds")?;
        let ratio = self.jitter.failure_backoff_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::invalid(
                "jitter.failure_backoff_ratio",
                format!("must be in [0.0, 1.0] (was {})", ratio),
            ));
        }

        let throttled = &self.failure_backoff.throttled;
        validate_non_negative(throttled.base_ms, "failure_backoff.throttled.base_ms")?;
        validate_non_negative(throttled.cap_ms, "failure_backoff.throttled.cap_ms")?;
        if throttled.multiplier < 0.0 || !throttled.multiplier.is_finite() {
            return Err(ConfigError::invalid(
                "failure_backoff.throttled.multiplier",
                format!("must be >= 0 and finite (was {})", throttled.multiplier),
            ));
        }

        let zombie = &self.zombie_cleanup;
        validate_non_negative(zombie.threshold_ms, "zombie_cleanup.threshold_ms")?;
        validate_non_negative(
            zombie.exceptional_agents.threshold_ms,
            "zombie_cleanup.exceptional_agents.threshold_ms",
        )?;
        validate_shutdown_timeouts(
            zombie.executor_shutdown_await_ms,
            zombie.executor_shutdown_force_await_ms,
            "zombie_cleanup",
        )?;
        validate_non_negative(zombie.run_budget_ms, "zombie_cleanup.run_budget_ms")?;

        let orphan = &self.orphan_cleanup;
        validate_non_negative(orphan.threshold_ms, "orphan_cleanup.threshold_ms")?;
        validate_positive(orphan.leadership_ttl_ms, "orphan_cleanup.leadership_ttl_ms")?;
        validate_shutdown_timeouts(
            orphan.executor_shutdown_await_ms,
            orphan.executor_shutdown_force_await_ms,
            "orphan_cleanup",
        )?;
        validate_non_negative(orphan.run_budget_ms, "orphan_cleanup.run_budget_ms")?;
        if orphan.run_budget_ms > 0
            && orphan.leadership_ttl_ms < orphan.run_budget_ms + LEADERSHIP_MARGIN_MS
        {
            warn!(
                leadership_ttl_ms = orphan.leadership_ttl_ms,
                run_budget_ms = orphan.run_budget_ms,
                recommended_ms = orphan.run_budget_ms + LEADERSHIP_MARGIN_MS,
                "Orphan leadership TTL is shorter than run budget plus margin; duplicate cleanup passes are possible"
            );
        }

        validate_shutdown_timeouts(
            self.reconcile.executor_shutdown_await_ms,
            self.reconcile.executor_shutdown_force_await_ms,
            "reconcile",
        )?;
        validate_non_negative(self.reconcile.run_budget_ms, "reconcile.run_budget_ms")?;

        compile_full_match("enabled_pattern", &self.enabled_pattern)?;
        compile_optional("disabled_pattern", &self.disabled_pattern)?;
        compile_optional(
            "zombie_cleanup.exceptional_agents.pattern",
            &zombie.exceptional_agents.pattern,
        )?;

        for def in &self.agents {
            if def.agent_type.trim().is_empty() {
                return Err(ConfigError::invalid("agents.agent_type", "must not be empty"));
            }
            if def.timeout_ms == 0 {
                return Err(ConfigError::invalid(
                    "agents.timeout_ms",
                    format!("must be > 0 for agent '{}'", def.agent_type),
                ));
            }
        }

        Ok(())
    }
}

/// Compiled name filters derived from the configuration.
#[derive(Debug, Clone)]
pub struct AgentPatterns {
    pub enabled: Regex,
    pub disabled: Option<Regex>,
    pub exceptional: Option<Regex>,
}

impl AgentPatterns {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: compile_full_match("enabled_pattern", &config.enabled_pattern)?,
            disabled: compile_optional("disabled_pattern", &config.disabled_pattern)?,
            exceptional: compile_optional(
                "zombie_cleanup.exceptional_agents.pattern",
                &config.zombie_cleanup.exceptional_agents.pattern,
            )?,
        })
    }

    /// Enabled pattern matches and disabled pattern does not.
    pub fn allows(&self, agent_type: &str) -> bool {
        self.enabled.is_match(agent_type)
            && !self
                .disabled
                .as_ref()
                .is_some_and(|disabled| disabled.is_match(agent_type))
    }

    pub fn is_exceptional(&self, agent_type: &str) -> bool {
        self.exceptional
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(agent_type))
    }
}

/// Compiles `pattern` anchored at both ends so `is_match` is a full match.
fn compile_full_match(field: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| ConfigError::Pattern {
        field: field.to_string(),
        source,
    })
}

fn compile_optional(field: &str, pattern: &str) -> Result<Option<Regex>, ConfigError> {
    if pattern.trim().is_empty() {
        return Ok(None);
    }
    compile_full_match(field, pattern).map(Some)
}

fn validate_positive(value: i64, name: &str) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::invalid(
            name,
            format!("must be > 0 (was {})", value),
        ));
    }
    Ok(())
}

fn validate_non_negative(value: i64, name: &str) -> Result<(), ConfigError> {
    if value < 0 {
        return Err(ConfigError::invalid(
            name,
            format!("must be >= 0 (was {})", value),
        ));
    }
    Ok(())
}

fn validate_shutdown_timeouts(await_ms: i64, force_ms: i64, section: &str) -> Result<(), ConfigError> {
    if await_ms < 0 || force_ms < 0 {
        return Err(ConfigError::invalid(
            &format!("{}.executor_shutdown_*", section),
            "shutdown timeouts must be >= 0",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.keys.waiting_set, "waiting");
        assert_eq!(config.zombie_cleanup.threshold_ms, 30_000);
        assert_eq!(config.orphan_cleanup.threshold_ms, 600_000);
        assert!(!config.failure_backoff.enabled);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
interval_ms: 500
max_concurrent_agents: 4
batch_operations:
  batch_size: 25
keys:
  prefix: "test:"
"#;
        let config = SchedulerConfig::from_yaml_str(yaml).expect("valid yaml");
        assert_eq!(config.interval_ms, 500);
        assert_eq!(config.max_concurrent_agents, 4);
        assert_eq!(config.batch_operations.batch_size, 25);
        assert!(config.batch_operations.enabled);
        assert_eq!(config.keys.prefix, "test:");
        assert_eq!(config.keys.working_set, "working");
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = SchedulerConfig {
            interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().expect_err("zero interval must fail");
        assert!(err.to_string().contains("interval_ms"));
    }

    #[test]
    fn test_rejects_non_finite_multiplier() {
        let mut config = SchedulerConfig::default();
        config.batch_operations.chunk_attempt_multiplier = f64::INFINITY;
        assert!(config.validate().is_err());
        config.batch_operations.chunk_attempt_multiplier = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_blank_keys_and_bad_jitter() {
        let mut config = SchedulerConfig::default();
        config.keys.working_set = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.jitter.failure_backoff_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.jitter.shutdown_seconds = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_invalid_pattern() {
        let config = SchedulerConfig::default().with_disabled_pattern("(unclosed");
        let err = config.validate().expect_err("bad regex must fail");
        assert!(matches!(err, ConfigError::Pattern { .. }));
    }

    #[test]
    fn test_patterns_are_full_match() {
        let config = SchedulerConfig::default()
            .with_enabled_pattern("aws/.*")
            .with_disabled_pattern("aws/legacy.*");
        let patterns = AgentPatterns::from_config(&config).expect("patterns compile");
        assert!(patterns.allows("aws/ec2"));
        assert!(!patterns.allows("gcp/aws/ec2"));
        assert!(!patterns.allows("aws/legacy-s3"));
        assert!(!patterns.is_exceptional("aws/ec2"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "refresh_period_seconds: 10\nagents:\n  - agent_type: demo\n    interval_ms: 10000\n    timeout_ms: 5000"
        )
        .expect("write config");

        let config = SchedulerConfig::from_yaml_file(file.path()).expect("load config");
        assert_eq!(config.refresh_period_seconds, 10);
        assert_eq!(config.agents.len(), 1);
        let agent = config.agents[0].to_agent();
        assert_eq!(agent.agent_type(), "demo");
        assert_eq!(agent.error_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_yaml_round_trip_preserves_values() {
        let config = SchedulerConfig::default().with_max_concurrent_agents(7);
        let yaml = config.to_yaml().expect("serialize");
        let parsed = SchedulerConfig::from_yaml_str(&yaml).expect("parse");
        assert_eq!(parsed.max_concurrent_agents, 7);
    }
}
