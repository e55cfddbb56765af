//! The scheduler driver.
//!
//! [`PriorityAgentScheduler`] ties the acquisition service, the cleanup
//! passes, the watchdog and the health summary together behind a single
//! periodic [`tick`](PriorityAgentScheduler::tick). `run_forever` drives the
//! tick on an interval until told to stop.
//!
//! Zombie, orphan and reconcile passes each own a single background slot:
//! a pass is submitted only when the previous one finished, and a pass that
//! overruns its budget by more than [`SLOT_GRACE_MS`] is aborted.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::acquisition::{AcquisitionService, AcquisitionStats, Registration};
use super::agent::{
    Agent, AgentExecution, AlwaysEnabled, ExecutionInstrumentation, NodeStatusProvider,
    OwnAllShards, ShardingFilter,
};
use super::clock::{ClockSource, SystemClock};
use super::orphan::OrphanCleanupService;
use super::pool::{PoolError, PoolStats};
use super::store::AgentStore;
use super::watchdog::{Watchdog, WatchdogInputs};
use super::zombie::ZombieCleanupService;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::metrics::{CleanupKind, SchedulerMetrics};

/// Extra time a budgeted background pass gets before it is aborted.
const SLOT_GRACE_MS: i64 = 30_000;
/// Abort limit for a background pass without a budget.
const UNBUDGETED_SLOT_LIMIT_MS: i64 = 60_000;
const POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Scheduler-level counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub run_count: u64,
    pub registered_agents: usize,
    pub active_agents: usize,
    pub zombies_cleaned: u64,
    pub orphans_cleaned: u64,
    pub running: bool,
    pub degraded: bool,
    pub degraded_reason: String,
    pub oldest_overdue_seconds: i64,
}

/// Result of a reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub registered: usize,
    pub unregistered: usize,
    pub inconsistent_released: usize,
    pub budget_exhausted: bool,
}

#[derive(Debug, Default)]
struct BackgroundSlot {
    handle: Option<JoinHandle<()>>,
    started_ms: i64,
}

impl BackgroundSlot {
    /// Clears a finished handle, aborts an overrunning one, and reports
    /// whether a new pass may be submitted.
    fn poll(&mut self, kind: CleanupKind, budget_ms: i64, now_ms: i64) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return true;
        };
        if handle.is_finished() {
            if let Some(Err(e)) = handle.now_or_never() {
                if e.is_panic() {
                    error!(pass = kind.label(), error = %e, "Background pass panicked");
                }
            }
            self.handle = None;
            return true;
        }

        let limit = if budget_ms > 0 {
            budget_ms + SLOT_GRACE_MS
        } else {
            UNBUDGETED_SLOT_LIMIT_MS
        };
        let running_for = now_ms - self.started_ms;
        if running_for > limit {
            warn!(
                pass = kind.label(),
                running_ms = running_for,
                limit_ms = limit,
                "Background pass overran its budget; cancelling"
            );
            handle.abort();
            SchedulerMetrics::new().record_cleanup_timeout(kind);
            self.handle = None;
            return true;
        }
        false
    }

    fn submit(&mut self, handle: JoinHandle<()>, now_ms: i64) {
        self.handle = Some(handle);
        self.started_ms = now_ms;
    }

    /// Waits for the running pass, aborting it after `await_ms` and giving
    /// it `force_ms` more to unwind.
    async fn drain(&mut self, kind: CleanupKind, await_ms: i64, force_ms: i64) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let patience = Duration::from_millis(await_ms.max(0) as u64);
        if tokio::time::timeout(patience, &mut handle).await.is_ok() {
            return;
        }
        handle.abort();
        let force = Duration::from_millis(force_ms.max(0) as u64);
        if tokio::time::timeout(force, handle).await.is_err() {
            warn!(pass = kind.label(), "Background pass did not stop after abort");
        }
    }
}

/// Builder for [`PriorityAgentScheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Arc<dyn AgentStore>,
    sharding: Option<Arc<dyn ShardingFilter>>,
    node_status: Option<Arc<dyn NodeStatusProvider>>,
    clock: Option<Arc<dyn ClockSource>>,
}

impl SchedulerBuilder {
    pub fn with_sharding(mut self, sharding: Arc<dyn ShardingFilter>) -> Self {
        self.sharding = Some(sharding);
        self
    }

    pub fn with_node_status(mut self, node_status: Arc<dyn NodeStatusProvider>) -> Self {
        self.node_status = Some(node_status);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the configuration and assembles the scheduler.
    pub fn build(self) -> Result<PriorityAgentScheduler, SchedulerError> {
        let sharding = self.sharding.unwrap_or_else(|| Arc::new(OwnAllShards));
        let node_status = self.node_status.unwrap_or_else(|| Arc::new(AlwaysEnabled));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let acquisition = Arc::new(AcquisitionService::new(
            &self.config,
            self.store,
            sharding,
            clock,
        )?);
        Ok(PriorityAgentScheduler {
            zombie: Arc::new(ZombieCleanupService::new(Arc::clone(&acquisition))),
            orphan: Arc::new(OrphanCleanupService::new(Arc::clone(&acquisition))),
            acquisition,
            node_status,
            config: self.config,
            metrics: SchedulerMetrics::new(),
            known: Mutex::new(HashMap::new()),
            run_count: AtomicU64::new(0),
            running: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            zombie_slot: Mutex::new(BackgroundSlot::default()),
            orphan_slot: Mutex::new(BackgroundSlot::default()),
            reconcile_slot: Mutex::new(BackgroundSlot::default()),
            watchdog: Mutex::new(Watchdog::new()),
            last_health_ms: Mutex::new(None),
            stop: Notify::new(),
        })
    }
}

/// Distributed agent scheduler with at-most-one owner per agent.
pub struct PriorityAgentScheduler {
    acquisition: Arc<AcquisitionService>,
    zombie: Arc<ZombieCleanupService>,
    orphan: Arc<OrphanCleanupService>,
    node_status: Arc<dyn NodeStatusProvider>,
    config: SchedulerConfig,
    metrics: SchedulerMetrics,
    /// Every scheduled agent, enabled or not. Reconcile registers the ones
    /// that become enabled.
    known: Mutex<HashMap<String, Registration>>,
    run_count: AtomicU64,
    running: AtomicBool,
    initialized: AtomicBool,
    zombie_slot: Mutex<BackgroundSlot>,
    orphan_slot: Mutex<BackgroundSlot>,
    reconcile_slot: Mutex<BackgroundSlot>,
    watchdog: Mutex<Watchdog>,
    last_health_ms: Mutex<Option<i64>>,
    stop: Notify,
}

impl PriorityAgentScheduler {
    pub fn builder(config: SchedulerConfig, store: Arc<dyn AgentStore>) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            store,
            sharding: None,
            node_status: None,
            clock: None,
        }
    }

    pub fn acquisition(&self) -> &Arc<AcquisitionService> {
        &self.acquisition
    }

    pub fn zombie_cleanup(&self) -> &Arc<ZombieCleanupService> {
        &self.zombie
    }

    pub fn orphan_cleanup(&self) -> &Arc<OrphanCleanupService> {
        &self.orphan
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Adds an agent to the schedule. It is registered with the store only
    /// while the pattern and shard filters accept it; otherwise reconcile
    /// picks it up once they do.
    pub async fn schedule(
        &self,
        agent: Agent,
        execution: Arc<dyn AgentExecution>,
        instrumentation: Arc<dyn ExecutionInstrumentation>,
    ) {
        let registration = Registration::new(agent, execution, instrumentation);
        let agent_type = registration.agent_type().to_string();
        self.known
            .lock()
            .insert(agent_type.clone(), registration.clone());

        match self.ensure_initialized().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(agent = %agent_type, "Store breaker open; registering without initialization");
            }
            Err(e) => {
                warn!(agent = %agent_type, error = %e, "Store not initialized while scheduling");
            }
        }
        if self.acquisition.is_enabled(&agent_type) {
            self.acquisition.register(registration).await;
        } else {
            debug!(agent = %agent_type, "Agent not enabled on this node; deferring registration");
        }
    }

    /// Removes an agent from the schedule and from the store.
    pub async fn unschedule(&self, agent_type: &str) {
        self.known.lock().remove(agent_type);
        self.acquisition.unregister(agent_type, true).await;
    }

    /// Loads scripts and runs one eager repopulate, once.
    /// Loads the scripts and runs the first repopulate once. Returns
    /// false, without touching the store, while the store breaker rejects
    /// calls.
    async fn ensure_initialized(&self) -> Result<bool, SchedulerError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let breaker = self.acquisition.store_breaker();
        if !breaker.allow_request() {
            debug!("Store breaker open; deferring store initialization");
            return Ok(false);
        }
        if let Err(e) = self.acquisition.store().initialize().await {
            if e.is_connection_error() {
                breaker.record_failure(&e);
            }
            return Err(e.into());
        }
        breaker.record_success();
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            scripts = self.acquisition.store().scripts_loaded(),
            "Scheduler store initialized"
        );
        if let Err(e) = self.acquisition.repopulate().await {
            warn!(error = %e, "Initial repopulate failed");
        }
        Ok(true)
    }

    /// Runs one scheduling cycle. Errors and panics are logged and counted;
    /// they never escape.
    pub async fn tick(&self) {
        if !self.node_status.is_node_enabled() {
            debug!("Node disabled; skipping scheduler tick");
            return;
        }
        let started = Instant::now();
        match AssertUnwindSafe(self.tick_inner()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics.record_run_failure();
                error!(error = %e, "Scheduler tick failed");
            }
            Err(_) => {
                self.metrics.record_run_failure();
                error!("Scheduler tick panicked");
            }
        }
        self.metrics.record_run_cycle(started.elapsed());
    }

    async fn tick_inner(&self) -> Result<(), SchedulerError> {
        if !self.ensure_initialized().await? {
            return Ok(());
        }

        let run_count = self.run_count.fetch_add(1, Ordering::SeqCst) + 1;
        let refresh = self.config.refresh_period_seconds;
        if refresh > 0 && run_count % refresh as u64 == 0 {
            self.submit_reconcile();
        }

        let repopulated = match self.acquisition.repopulate_if_due_now().await {
            Ok(ran) => ran,
            Err(e) => {
                warn!(error = %e, "Cadence repopulate failed");
                false
            }
        };
        if !repopulated {
            self.acquisition.saturate_pool().await;
        }

        self.evaluate_watchdog();
        self.submit_cleanup_passes();
        self.maybe_log_health().await;
        Ok(())
    }

    fn evaluate_watchdog(&self) {
        let cycle = self.acquisition.last_cycle();
        let backlog = self.acquisition.backlog();
        let limiter = self.acquisition.limiter();
        let inputs = WatchdogInputs {
            max_permits: limiter.max(),
            available_permits: limiter.available(),
            pool_active: self.acquisition.pool().active(),
            ready: backlog.ready_count,
            acquired: cycle.acquired,
            capacity: cycle.capacity,
            store_breaker: self.acquisition.store_breaker().state(),
            degraded: backlog.degraded,
        };
        let now_ms = self.acquisition.clock().local_ms();
        self.watchdog.lock().evaluate(&inputs, now_ms);
    }

    fn submit_cleanup_passes(&self) {
        let now_ms = self.acquisition.clock().local_ms();

        {
            let mut slot = self.zombie_slot.lock();
            let free = slot.poll(CleanupKind::Zombie, self.zombie.run_budget_ms(), now_ms);
            if self.zombie.is_due(now_ms) {
                if free {
                    let zombie = Arc::clone(&self.zombie);
                    slot.submit(
                        tokio::spawn(async move {
                            zombie.run_pass().await;
                        }),
                        now_ms,
                    );
                } else {
                    self.metrics.record_cleanup_skipped(CleanupKind::Zombie);
                }
            }
        }

        let mut slot = self.orphan_slot.lock();
        let free = slot.poll(CleanupKind::Orphan, self.orphan.run_budget_ms(), now_ms);
        if self.orphan.is_due(now_ms) {
            if free {
                let orphan = Arc::clone(&self.orphan);
                slot.submit(
                    tokio::spawn(async move {
                        if let Err(e) = orphan.run_pass().await {
                            warn!(error = %e, "Orphan cleanup pass failed");
                        }
                    }),
                    now_ms,
                );
            } else {
                self.metrics.record_cleanup_skipped(CleanupKind::Orphan);
            }
        }
    }

    fn submit_reconcile(&self) {
        let now_ms = self.acquisition.clock().local_ms();
        let budget_ms = self.config.reconcile.run_budget_ms;
        let mut slot = self.reconcile_slot.lock();
        if !slot.poll(CleanupKind::Reconcile, budget_ms, now_ms) {
            self.metrics.record_cleanup_skipped(CleanupKind::Reconcile);
            return;
        }
        let acquisition = Arc::clone(&self.acquisition);
        let known: Vec<Registration> = self.known.lock().values().cloned().collect();
        slot.submit(
            tokio::spawn(async move {
                reconcile(&acquisition, known, budget_ms).await;
            }),
            now_ms,
        );
    }

    /// Runs a reconcile pass inline.
    pub async fn reconcile_now(&self) -> ReconcileReport {
        let known: Vec<Registration> = self.known.lock().values().cloned().collect();
        reconcile(&self.acquisition, known, self.config.reconcile.run_budget_ms).await
    }

    /// Drives [`tick`](Self::tick) every `interval_ms` until `shutdown_rx`
    /// fires, its sender is dropped, or [`shutdown`](Self::shutdown) is
    /// called.
    pub async fn run_forever(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        info!(
            interval_ms = self.config.interval_ms,
            max_concurrent = self.config.max_concurrent_agents,
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = self.stop.notified() => break,
                _ = interval.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.tick().await;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Scheduler loop stopped");
        Ok(())
    }

    /// Stops the tick loop, hands every owned agent back to the waiting set
    /// and drains background passes and the execution pool.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ShutdownTimeout` if executions are still
    /// running when the pool deadline passes.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        info!("Initiating scheduler shutdown");
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_waiters();

        self.acquisition.shutdown_requeue().await;

        let zombie_cfg = &self.config.zombie_cleanup;
        let orphan_cfg = &self.config.orphan_cleanup;
        let reconcile_cfg = &self.config.reconcile;
        let slots = [
            (
                &self.zombie_slot,
                CleanupKind::Zombie,
                zombie_cfg.executor_shutdown_await_ms,
                zombie_cfg.executor_shutdown_force_await_ms,
            ),
            (
                &self.orphan_slot,
                CleanupKind::Orphan,
                orphan_cfg.executor_shutdown_await_ms,
                orphan_cfg.executor_shutdown_force_await_ms,
            ),
            (
                &self.reconcile_slot,
                CleanupKind::Reconcile,
                reconcile_cfg.executor_shutdown_await_ms,
                reconcile_cfg.executor_shutdown_force_await_ms,
            ),
        ];
        for (slot, kind, await_ms, force_ms) in slots {
            let mut taken = std::mem::take(&mut *slot.lock());
            taken.drain(kind, await_ms, force_ms).await;
        }

        match self.acquisition.pool().shutdown(POOL_SHUTDOWN_TIMEOUT).await {
            Ok(()) => {
                info!("Scheduler shutdown complete");
                Ok(())
            }
            Err(PoolError::ShutdownTimeout(timeout)) => {
                warn!(?timeout, "Executions still running after shutdown deadline");
                Err(SchedulerError::ShutdownTimeout(timeout))
            }
            Err(e) => {
                debug!(error = %e, "Execution pool already stopped");
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let backlog = self.acquisition.backlog();
        SchedulerStats {
            run_count: self.run_count.load(Ordering::SeqCst),
            registered_agents: self.acquisition.registered_count(),
            active_agents: self.acquisition.active_count(),
            zombies_cleaned: self.zombie.total_cleaned(),
            orphans_cleaned: self.orphan.total_cleaned(),
            running: self.is_running(),
            degraded: backlog.degraded,
            degraded_reason: backlog.degraded_reason,
            oldest_overdue_seconds: backlog.oldest_overdue_seconds,
        }
    }

    pub fn acquisition_stats(&self) -> AcquisitionStats {
        self.acquisition.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.acquisition.pool().stats()
    }

    async fn maybe_log_health(&self) {
        let period_ms = self.config.health_summary_period_seconds * 1000;
        if period_ms <= 0 {
            return;
        }
        let now_ms = self.acquisition.clock().local_ms();
        {
            let mut last = self.last_health_ms.lock();
            match *last {
                Some(previous) if now_ms - previous < period_ms => return,
                _ => *last = Some(now_ms),
            }
        }
        self.health_summary().await;
    }

    /// Builds and logs the one-line health summary, and returns it.
    pub async fn health_summary(&self) -> String {
        let acquisition = &self.acquisition;
        let stats = acquisition.stats();
        let backlog = acquisition.backlog();
        let now_ms = acquisition.clock().local_ms();

        let mismatch = stats.held_permits as i64 - stats.active as i64;
        self.metrics.update_permit_mismatch(mismatch);

        let (violations, sampled) = match acquisition.consistency_check().await {
            Ok(report) => (report.violations.to_string(), report.sampled.to_string()),
            Err(e) => {
                debug!(error = %e, "Consistency check failed");
                ("error".to_string(), "0".to_string())
            }
        };
        let has_violations = violations != "0" && violations != "error";

        let health = if backlog.degraded {
            format!("DEGRADED reason={}", backlog.degraded_reason)
        } else {
            "HEALTHY".to_string()
        };
        let capacity = backlog
            .capacity_per_cycle
            .map_or("unbounded".to_string(), |c| c.to_string());
        let permits = if acquisition.limiter().is_bounded() && stats.max_concurrent > 0 {
            format!(
                "{}/{} ({:.0}%)",
                stats.held_permits,
                stats.max_concurrent,
                stats.held_permits as f64 * 100.0 / stats.max_concurrent as f64
            )
        } else {
            "n/a".to_string()
        };
        let (watchdogs, starving) = {
            let watchdog = self.watchdog.lock();
            (watchdog.summary(now_ms), watchdog.is_starving())
        };
        let degraded_for = backlog
            .degraded_since_ms
            .map_or(0, |since| (now_ms - since).max(0) / 1000);

        let line = format!(
            "Scheduler health | health={} | agents registered={} active={} futures={} scripts={} \
             | backlog ready={} oldest_overdue={}s capacity_per_cycle={} | permits {} \
             | run_states={} with_permit={} held={} | cleanup zombies_cleaned={} orphans_cleaned={} \
             | consistency violations={} sampled={} | queue_depth={} | watchdogs={} starvation={} degraded_for={}s",
            health,
            stats.registered,
            stats.active,
            stats.executions,
            acquisition.store().scripts_loaded(),
            backlog.ready_count,
            backlog.oldest_overdue_seconds,
            capacity,
            permits,
            stats.run_states,
            stats.run_states_with_permit,
            stats.held_permits,
            self.zombie.total_cleaned(),
            self.orphan.total_cleaned(),
            violations,
            sampled,
            stats.recovery_queue_depth,
            watchdogs,
            starving,
            degraded_for,
        );

        if backlog.degraded || has_violations || mismatch != 0 {
            warn!("{}", line);
        } else {
            info!("{}", line);
        }
        line
    }
}

/// Aligns the registry with the filters and clears active entries that no
/// longer correspond to a live execution.
async fn reconcile(
    acquisition: &Arc<AcquisitionService>,
    known: Vec<Registration>,
    budget_ms: i64,
) -> ReconcileReport {
    let started = Instant::now();
    let over_budget = || {
        budget_ms > 0 && started.elapsed() >= Duration::from_millis(budget_ms as u64)
    };
    let metrics = SchedulerMetrics::new();
    let mut report = ReconcileReport::default();

    for registration in known {
        if over_budget() {
            report.budget_exhausted = true;
            break;
        }
        let agent_type = registration.agent_type().to_string();
        let enabled = acquisition.is_enabled(&agent_type);
        let registered = acquisition.is_registered(&agent_type);
        if enabled && !registered {
            info!(agent = %agent_type, "Agent became enabled; registering");
            acquisition.register(registration).await;
            report.registered += 1;
        } else if !enabled && registered {
            info!(agent = %agent_type, "Agent no longer enabled; unregistering");
            acquisition.unregister(&agent_type, false).await;
            report.unregistered += 1;
        }
    }

    if !report.budget_exhausted {
        for agent_type in acquisition.inconsistent_active() {
            warn!(agent = %agent_type, "Inconsistent active entry; releasing");
            metrics.record_validation("inconsistent_active");
            acquisition.force_release(&agent_type);
            report.inconsistent_released += 1;
        }
    }

    let changed = report.registered + report.unregistered + report.inconsistent_released;
    metrics.record_cleanup(CleanupKind::Reconcile, started.elapsed(), changed);
    if changed > 0 {
        debug!(
            registered = report.registered,
            unregistered = report.unregistered,
            released = report.inconsistent_released,
            "Reconcile pass finished"
        );
    }
    report
}
