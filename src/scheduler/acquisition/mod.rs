//! Acquisition service: the waiting → working → waiting state machine.
//!
//! This service owns everything a pod knows about its own executions:
//!
//! - the registry of locally enabled agents;
//! - the active map (`agent_type → deadline`) of executions it owns;
//! - one [`RunState`] per active execution and the abort handle of its task;
//! - the concurrency limiter and the execution pool;
//! - the recovery queue for store writes that exhausted their retries.
//!
//! The acquire cycle lives in `saturate`, completion and every release path
//! in `completion`, the differential resync in `repopulate` and backlog
//! health in `diagnostics`.

mod completion;
mod diagnostics;
mod repopulate;
mod saturate;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngExt;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::agent::{Agent, AgentExecution, ExecutionInstrumentation, ShardingFilter};
use super::circuit_breaker::{BreakerSettings, BreakerState, CircuitBreaker};
use super::clock::{ClockSource, StoreClock};
use super::failure::FailurePolicy;
use super::pool::{ExecutionPool, PoolStats};
use super::run_state::{ConcurrencyLimiter, RunState};
use super::store::AgentStore;
use crate::config::{AgentPatterns, SchedulerConfig};
use crate::error::{ConfigError, StoreError};
use crate::metrics::SchedulerMetrics;

pub use self::completion::RecoveryOp;
pub use self::diagnostics::{BacklogSnapshot, ConsistencyReport};

/// Attempts for a single store write before it goes to the recovery queue.
const STORE_WRITE_ATTEMPTS: u32 = 3;
const STORE_RETRY_STEP_MS: u64 = 100;

/// An agent together with the callbacks that run it.
#[derive(Clone)]
pub struct Registration {
    pub agent: Agent,
    pub execution: Arc<dyn AgentExecution>,
    pub instrumentation: Arc<dyn ExecutionInstrumentation>,
}

impl Registration {
    pub fn new(
        agent: Agent,
        execution: Arc<dyn AgentExecution>,
        instrumentation: Arc<dyn ExecutionInstrumentation>,
    ) -> Self {
        Self {
            agent,
            execution,
            instrumentation,
        }
    }

    pub fn agent_type(&self) -> &str {
        self.agent.agent_type()
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

/// A store write waiting for another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryEntry {
    pub agent_type: String,
    pub op: RecoveryOp,
    pub offset_ms: i64,
    pub attempts: u32,
}

/// Result of the most recent acquire cycle, read by the watchdog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Free slots at cycle start; `None` when unbounded.
    pub capacity: Option<usize>,
    pub acquired: usize,
    /// Whether the cycle was skipped by a breaker gate.
    pub blocked: bool,
}

/// Snapshot of acquisition bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionStats {
    pub registered: usize,
    pub active: usize,
    pub run_states: usize,
    pub run_states_with_permit: usize,
    pub executions: usize,
    pub recovery_queue_depth: usize,
    pub max_concurrent: usize,
    pub available_permits: Option<usize>,
    pub held_permits: usize,
    pub acquired_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub submission_failures: u64,
    pub last_cycle: CycleOutcome,
    pub pool: PoolStats,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    submission_failures: AtomicU64,
}

/// Acquires ready agents, runs them and reschedules them on completion.
pub struct AcquisitionService {
    store: Arc<dyn AgentStore>,
    config: SchedulerConfig,
    patterns: AgentPatterns,
    sharding: Arc<dyn ShardingFilter>,
    clock: Arc<StoreClock>,
    limiter: ConcurrencyLimiter,
    pool: ExecutionPool,
    acquisition_breaker: CircuitBreaker,
    store_breaker: CircuitBreaker,
    failure_policy: FailurePolicy,
    metrics: SchedulerMetrics,
    registry: Mutex<HashMap<String, Registration>>,
    active: Mutex<HashMap<String, i64>>,
    run_states: Mutex<HashMap<String, Arc<RunState>>>,
    executions: Mutex<HashMap<String, AbortHandle>>,
    recovery: Mutex<VecDeque<RecoveryEntry>>,
    repopulate_state: Mutex<repopulate::RepopulateState>,
    backlog: Mutex<BacklogSnapshot>,
    last_cycle: Mutex<CycleOutcome>,
    shutting_down: AtomicBool,
    counters: Counters,
}

impl AcquisitionService {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn AgentStore>,
        sharding: Arc<dyn ShardingFilter>,
        local_clock: Arc<dyn ClockSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let patterns = AgentPatterns::from_config(config)?;
        let settings = BreakerSettings::from_config(&config.circuit_breaker);

        Ok(Self {
            store,
            patterns,
            sharding,
            clock: Arc::new(StoreClock::new(
                Arc::clone(&local_clock),
                config.time_cache_duration_ms,
            )),
            limiter: ConcurrencyLimiter::new(config.max_concurrent_agents),
            pool: ExecutionPool::new(config.pool_capacity),
            acquisition_breaker: CircuitBreaker::new(
                "acquisition",
                settings,
                Arc::clone(&local_clock),
            ),
            store_breaker: CircuitBreaker::new("store", settings.stricter(), local_clock),
            failure_policy: FailurePolicy::new(config.failure_backoff.clone(), &config.jitter),
            metrics: SchedulerMetrics::new(),
            registry: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            run_states: Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            recovery: Mutex::new(VecDeque::new()),
            repopulate_state: Mutex::new(repopulate::RepopulateState::default()),
            backlog: Mutex::new(BacklogSnapshot::default()),
            last_cycle: Mutex::new(CycleOutcome::default()),
            shutting_down: AtomicBool::new(false),
            counters: Counters::default(),
            config: config.clone(),
        })
    }

    pub fn store(&self) -> &Arc<dyn AgentStore> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn clock(&self) -> &StoreClock {
        &self.clock
    }

    pub fn patterns(&self) -> &AgentPatterns {
        &self.patterns
    }

    pub fn acquisition_breaker(&self) -> &CircuitBreaker {
        &self.acquisition_breaker
    }

    pub fn store_breaker(&self) -> &CircuitBreaker {
        &self.store_breaker
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    /// Pattern and shard filter both accept the agent. A shard lookup
    /// error counts as not owned.
    pub fn is_enabled(&self, agent_type: &str) -> bool {
        if !self.patterns.allows(agent_type) {
            return false;
        }
        match self.sharding.owns(agent_type) {
            Ok(owned) => owned,
            Err(e) => {
                debug!(agent = %agent_type, error = %e, "Shard check failed; treating as not owned");
                false
            }
        }
    }

    /// Raw shard ownership, for callers that must distinguish errors.
    pub fn owns_shard(&self, agent_type: &str) -> Result<bool, super::agent::ShardingError> {
        self.sharding.owns(agent_type)
    }

    pub fn is_registered(&self, agent_type: &str) -> bool {
        self.registry.lock().contains_key(agent_type)
    }

    pub fn registration(&self, agent_type: &str) -> Option<Registration> {
        self.registry.lock().get(agent_type).cloned()
    }

    pub fn registered_agents(&self) -> Vec<Agent> {
        self.registry
            .lock()
            .values()
            .map(|r| r.agent.clone())
            .collect()
    }

    pub fn registered_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_active(&self, agent_type: &str) -> bool {
        self.active.lock().contains_key(agent_type)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// `(agent_type, deadline)` of every locally owned execution.
    pub fn active_snapshot(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .active
            .lock()
            .iter()
            .map(|(name, deadline)| (name.clone(), *deadline))
            .collect();
        entries.sort();
        entries
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn last_cycle(&self) -> CycleOutcome {
        *self.last_cycle.lock()
    }

    pub fn backlog(&self) -> BacklogSnapshot {
        self.backlog.lock().clone()
    }

    /// Minimum interval, in seconds, among registered agents. 0 when none.
    pub fn min_interval_secs(&self) -> i64 {
        self.registry
            .lock()
            .values()
            .map(|r| r.agent.interval().as_secs() as i64)
            .filter(|secs| *secs > 0)
            .min()
            .unwrap_or(0)
    }

    /// Registers an agent and adds it to the waiting set unless it is
    /// already present in either set.
    ///
    /// A store failure after retries hands the add to the recovery queue;
    /// registration itself always succeeds locally.
    pub async fn register(&self, registration: Registration) {
        let agent_type = registration.agent_type().to_string();
        self.registry
            .lock()
            .insert(agent_type.clone(), registration);
        self.metrics
            .update_agent_counts(self.registered_count(), self.active_count());

        let offset_ms = self.initial_offset_ms();
        let score = self.clock.score(offset_ms);
        let store = Arc::clone(&self.store);
        let result = self
            .with_store_retries("add_agent", || {
                let store = Arc::clone(&store);
                let agent_type = agent_type.clone();
                async move { store.add_agent(&agent_type, score).await }
            })
            .await;

        match result {
            Ok(added) => {
                debug!(agent = %agent_type, score, added, "Registered agent");
            }
            Err(e) => {
                warn!(agent = %agent_type, error = %e, "Failed to add agent to store; queued for recovery");
                self.metrics.record_retry_exhausted();
                self.enqueue_recovery(RecoveryEntry {
                    agent_type,
                    op: RecoveryOp::Add,
                    offset_ms,
                    attempts: 0,
                });
            }
        }
    }

    /// Forgets an agent locally and cancels any local execution. With
    /// `remove_from_store` the agent is also removed from both sets.
    pub async fn unregister(&self, agent_type: &str, remove_from_store: bool) {
        let removed = self.registry.lock().remove(agent_type).is_some();
        self.failure_policy.forget(agent_type);
        self.abort_execution(agent_type);
        self.metrics
            .update_agent_counts(self.registered_count(), self.active_count());

        if removed {
            info!(agent = %agent_type, remove_from_store, "Unregistered agent");
        }
        if !remove_from_store {
            return;
        }

        let store = Arc::clone(&self.store);
        let owned = agent_type.to_string();
        let result = self
            .with_store_retries("remove_agent", || {
                let store = Arc::clone(&store);
                let agent_type = owned.clone();
                async move { store.remove_agent(&agent_type).await }
            })
            .await;
        if let Err(e) = result {
            warn!(agent = %agent_type, error = %e, "Failed to remove unregistered agent from store");
        }
    }

    /// Cancels the local execution task, if any. Cleanup runs on the
    /// execution's supervisor.
    pub fn abort_execution(&self, agent_type: &str) -> bool {
        match self.executions.lock().get(agent_type) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels the execution only while it is still the one that owns
    /// `agent_type` at `deadline`. Returns false when a newer execution (or
    /// none) holds the agent.
    pub fn abort_execution_current(&self, agent_type: &str, deadline: i64) -> bool {
        let active = self.active.lock();
        if active.get(agent_type) != Some(&deadline) {
            return false;
        }
        if let Some(handle) = self.executions.lock().get(agent_type) {
            handle.abort();
        }
        true
    }

    /// Releases the permit (if this caller wins the CAS) and clears every
    /// local trace of the execution, whatever its deadline. Used by
    /// reconcile for entries with no live execution.
    pub fn force_release(&self, agent_type: &str) -> bool {
        self.teardown(agent_type, None).unwrap_or(false)
    }

    /// [`force_release`](Self::force_release) limited to the execution
    /// that owns `agent_type` at `deadline`. `None` when the entry has been
    /// replaced or already cleared; otherwise whether this call released
    /// the permit.
    pub fn force_release_current(&self, agent_type: &str, deadline: i64) -> Option<bool> {
        self.teardown(agent_type, Some(deadline))
    }

    fn teardown(&self, agent_type: &str, expected_deadline: Option<i64>) -> Option<bool> {
        // Lock order: run_states, active, executions.
        let (run_state, handle) = {
            let mut run_states = self.run_states.lock();
            let mut active = self.active.lock();
            if let Some(expected) = expected_deadline {
                if active.get(agent_type) != Some(&expected) {
                    return None;
                }
            }
            active.remove(agent_type);
            let handle = self.executions.lock().remove(agent_type);
            (run_states.remove(agent_type), handle)
        };

        if let Some(handle) = handle {
            handle.abort();
        }
        let released = match &run_state {
            Some(state) => {
                let won = state.try_release();
                if won {
                    self.limiter.release();
                } else {
                    self.metrics.record_cas_contention();
                }
                won
            }
            None => false,
        };
        self.metrics
            .update_agent_counts(self.registered_count(), self.active_count());
        Some(released)
    }

    /// Active entries that no longer correspond to a live execution:
    /// unregistered agents, or entries without a run state and without a
    /// running task.
    pub fn inconsistent_active(&self) -> Vec<String> {
        let active: Vec<String> = self.active.lock().keys().cloned().collect();
        let registry = self.registry.lock();
        let run_states = self.run_states.lock();
        let executions = self.executions.lock();
        active
            .into_iter()
            .filter(|name| {
                let unregistered = !registry.contains_key(name);
                let orphaned_local = !run_states.contains_key(name)
                    && !executions.get(name).is_some_and(|h| !h.is_finished());
                unregistered || orphaned_local
            })
            .collect()
    }

    pub fn stats(&self) -> AcquisitionStats {
        let registered = self.registered_count();
        let active = self.active_count();
        let (run_states, with_permit) = {
            let run_states = self.run_states.lock();
            let with_permit = run_states.values().filter(|s| s.holds_permit()).count();
            (run_states.len(), with_permit)
        };
        AcquisitionStats {
            registered,
            active,
            run_states,
            run_states_with_permit: with_permit,
            executions: self.executions.lock().len(),
            recovery_queue_depth: self.recovery.lock().len(),
            max_concurrent: self.limiter.max(),
            available_permits: self.limiter.available(),
            held_permits: self.limiter.held(),
            acquired_total: self.counters.acquired.load(Ordering::SeqCst),
            completed_total: self.counters.completed.load(Ordering::SeqCst),
            failed_total: self.counters.failed.load(Ordering::SeqCst),
            submission_failures: self.counters.submission_failures.load(Ordering::SeqCst),
            last_cycle: self.last_cycle(),
            pool: self.pool.stats(),
        }
    }

    /// Random offset for a newly registered agent, in
    /// `[1, initial_registration_seconds]` seconds.
    fn initial_offset_ms(&self) -> i64 {
        let max_secs = self.config.jitter.initial_registration_seconds;
        if max_secs <= 0 {
            return 0;
        }
        rand::rng().random_range(1..=max_secs) * 1000
    }

    /// Runs a store write up to three times with linear backoff.
    ///
    /// Writes are never blocked by the store breaker: a completion must
    /// still try to hand its agent back. Their outcomes only feed the
    /// breaker while it is CLOSED, so OPEN and HALF_OPEN transitions are
    /// decided by the probes the acquire cycle admits.
    async fn with_store_retries<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            let counted = self.store_breaker.state() == BreakerState::Closed;
            match call().await {
                Ok(value) => {
                    if counted {
                        self.store_breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if counted && e.is_connection_error() {
                        self.store_breaker.record_failure(&e);
                    }
                    if attempt >= STORE_WRITE_ATTEMPTS {
                        return Err(e);
                    }
                    debug!(op, attempt, error = %e, "Store write failed; retrying");
                    tokio::time::sleep(Duration::from_millis(STORE_RETRY_STEP_MS * attempt as u64))
                        .await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
