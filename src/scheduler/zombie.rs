//! Zombie cleanup: locally owned executions that overran their deadline.
//!
//! Only the local active map is consulted. Each zombie is aborted, removed
//! from the working set if the stored deadline still matches ours, and its
//! local state is cleared (releasing the permit through the run-state CAS).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::acquisition::AcquisitionService;
use super::store::SetKind;
use crate::config::ZombieCleanupConfig;
use crate::metrics::{CleanupKind, SchedulerMetrics};

/// Outcome of one zombie pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZombiePassReport {
    pub scanned: usize,
    /// Zombies whose local state was cleared.
    pub cleaned: usize,
    /// Of those, entries the store removal actually matched.
    pub removed_from_store: usize,
    /// Entries with a corrupted local deadline.
    pub corrupted: usize,
    /// Entries whose execution finished or was replaced before cleanup.
    pub skipped: usize,
    pub budget_exhausted: bool,
}

pub struct ZombieCleanupService {
    acquisition: Arc<AcquisitionService>,
    config: ZombieCleanupConfig,
    batch_enabled: bool,
    batch_size: usize,
    metrics: SchedulerMetrics,
    total_cleaned: AtomicU64,
    last_run_ms: Mutex<Option<i64>>,
}

impl ZombieCleanupService {
    pub fn new(acquisition: Arc<AcquisitionService>) -> Self {
        let config = acquisition.config().zombie_cleanup.clone();
        let batching = acquisition.config().batch_operations.clone();
        Self {
            acquisition,
            config,
            batch_enabled: batching.enabled,
            batch_size: batching.batch_size,
            metrics: SchedulerMetrics::new(),
            total_cleaned: AtomicU64::new(0),
            last_run_ms: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn interval_ms(&self) -> i64 {
        self.config.interval_ms
    }

    pub fn run_budget_ms(&self) -> i64 {
        self.config.run_budget_ms
    }

    pub fn total_cleaned(&self) -> u64 {
        self.total_cleaned.load(Ordering::SeqCst)
    }

    /// Enabled and the interval since the last pass has elapsed.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.config.enabled
            && self
                .last_run_ms
                .lock()
                .is_none_or(|last| now_ms - last >= self.config.interval_ms)
    }

    /// Whether `(agent_type, deadline)` is a zombie at `now_ms`.
    pub fn is_zombie(&self, agent_type: &str, deadline: i64, now_ms: i64) -> bool {
        deadline <= 0
            || now_ms > deadline * 1000 + self.acquisition.zombie_threshold_ms(agent_type)
    }

    /// Runs one pass over the local active map.
    pub async fn run_pass(&self) -> ZombiePassReport {
        let active = self.acquisition.active_snapshot();
        self.clean_entries(active).await
    }

    /// Cleans the zombies among `entries`, a snapshot of the active map.
    ///
    /// The snapshot can go stale while store calls are awaited: an entry
    /// whose execution has since finished or been replaced by a newer run
    /// of the same agent is skipped, never torn down.
    pub async fn clean_entries(&self, entries: Vec<(String, i64)>) -> ZombiePassReport {
        let started = Instant::now();
        let now_ms = self.acquisition.clock().now_ms();
        *self.last_run_ms.lock() = Some(self.acquisition.clock().local_ms());

        let mut report = ZombiePassReport {
            scanned: entries.len(),
            ..Default::default()
        };

        let (corrupted, zombies): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .filter(|(name, deadline)| self.is_zombie(name, *deadline, now_ms))
            .partition(|(_, deadline)| *deadline <= 0);

        for (agent_type, deadline) in corrupted {
            if self.budget_exhausted(started) {
                report.budget_exhausted = true;
                break;
            }
            if !self.acquisition.abort_execution_current(&agent_type, deadline) {
                report.skipped += 1;
                continue;
            }
            warn!(agent = %agent_type, deadline, "Corrupted local deadline; force-cleaning");
            if let Err(e) = self.acquisition.store().remove_agent(&agent_type).await {
                warn!(agent = %agent_type, error = %e, "Failed to remove corrupted agent from store");
            }
            self.acquisition.force_release_current(&agent_type, deadline);
            report.corrupted += 1;
            report.cleaned += 1;
        }

        if !report.budget_exhausted && !zombies.is_empty() {
            if self.batch_enabled {
                self.clean_batched(&zombies, started, &mut report).await;
            } else {
                for (agent_type, deadline) in &zombies {
                    if self.budget_exhausted(started) {
                        report.budget_exhausted = true;
                        break;
                    }
                    self.clean_one(agent_type, *deadline, &mut report).await;
                }
            }
        }

        self.total_cleaned
            .fetch_add(report.cleaned as u64, Ordering::SeqCst);
        self.metrics
            .record_cleanup(CleanupKind::Zombie, started.elapsed(), report.cleaned);
        if report.cleaned > 0 {
            info!(
                cleaned = report.cleaned,
                removed = report.removed_from_store,
                corrupted = report.corrupted,
                skipped = report.skipped,
                "Zombie cleanup pass finished"
            );
        } else {
            debug!(scanned = report.scanned, skipped = report.skipped, "Zombie cleanup found nothing");
        }
        report
    }

    fn budget_exhausted(&self, started: Instant) -> bool {
        self.config.run_budget_ms > 0
            && started.elapsed() >= Duration::from_millis(self.config.run_budget_ms as u64)
    }

    async fn clean_batched(
        &self,
        zombies: &[(String, i64)],
        started: Instant,
        report: &mut ZombiePassReport,
    ) {
        let chunk_size = if self.batch_size == 0 {
            zombies.len()
        } else {
            self.batch_size
        };

        for chunk in zombies.chunks(chunk_size) {
            if self.budget_exhausted(started) {
                report.budget_exhausted = true;
                return;
            }
            let mut owned: Vec<(String, i64)> = Vec::with_capacity(chunk.len());
            for (agent_type, deadline) in chunk {
                if self.acquisition.abort_execution_current(agent_type, *deadline) {
                    warn!(agent = %agent_type, deadline, "Zombie execution detected; cancelling");
                    owned.push((agent_type.clone(), *deadline));
                } else {
                    report.skipped += 1;
                }
            }
            if owned.is_empty() {
                continue;
            }

            let removed = match self
                .acquisition
                .store()
                .remove_agents_conditional(SetKind::Working, &owned)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!(error = %e, "Batch zombie removal failed; falling back to per-item");
                    Default::default()
                }
            };

            for (agent_type, deadline) in &owned {
                if removed.contains(agent_type) {
                    self.acquisition.force_release_current(agent_type, *deadline);
                    report.removed_from_store += 1;
                    report.cleaned += 1;
                } else {
                    if self.budget_exhausted(started) {
                        report.budget_exhausted = true;
                        return;
                    }
                    self.finish_one(agent_type, *deadline, report).await;
                }
            }
        }
    }

    async fn clean_one(&self, agent_type: &str, deadline: i64, report: &mut ZombiePassReport) {
        if !self.acquisition.abort_execution_current(agent_type, deadline) {
            debug!(agent = %agent_type, deadline, "Zombie entry replaced before cleanup; skipping");
            report.skipped += 1;
            return;
        }
        warn!(agent = %agent_type, deadline, "Zombie execution detected; cancelling");
        self.finish_one(agent_type, deadline, report).await;
    }

    /// Store removal and local teardown for an already cancelled zombie.
    async fn finish_one(&self, agent_type: &str, deadline: i64, report: &mut ZombiePassReport) {
        let pair = [(agent_type.to_string(), deadline)];
        match self
            .acquisition
            .store()
            .remove_agents_conditional(SetKind::Working, &pair)
            .await
        {
            Ok(outcome) if outcome.contains(agent_type) => report.removed_from_store += 1,
            Ok(_) => {
                debug!(agent = %agent_type, deadline, "Zombie no longer owned in store; clearing locally");
            }
            Err(e) => {
                warn!(agent = %agent_type, error = %e, "Failed to remove zombie from store");
            }
        }
        self.acquisition.force_release_current(agent_type, deadline);
        report.cleaned += 1;
    }
}
