//! Orphan cleanup: working entries abandoned by crashed pods and invalid
//! waiting entries.
//!
//! Unlike zombie cleanup this pass reads only the shared store. It runs on
//! whichever pod wins the cleanup-leader key (unless forced on all pods)
//! and never touches permits: an entry with a local run state is skipped.
//!
//! Working entries past `deadline + threshold`:
//!
//! | registered & enabled | shard owned | action                               |
//! |----------------------|-------------|--------------------------------------|
//! | yes                  | yes         | move back to waiting at `deadline − timeout` |
//! | no                   | yes         | remove                               |
//! | any                  | no / error  | preserve                             |
//!
//! Waiting entries are only ever deleted when invalid, and only when this
//! shard owns them. Age alone never deletes a waiting entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::acquisition::AcquisitionService;
use super::store::{SetKind, StoredScore};
use crate::config::OrphanCleanupConfig;
use crate::error::StoreError;
use crate::metrics::{CleanupKind, SchedulerMetrics};

const FULL_SCAN_LIMIT: usize = i32::MAX as usize;

/// Identity written to the leader key: `<hostname>::<uuid>`.
pub fn instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{}::{}", host, Uuid::new_v4())
}

/// Nine to eleven ASCII digits: a bare account id stored as an agent name.
fn is_account_id_like(name: &str) -> bool {
    (9..=11).contains(&name.len()) && name.bytes().all(|b| b.is_ascii_digit())
}

/// Outcome of one orphan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanPassReport {
    /// False when another pod held leadership and nothing was scanned.
    pub ran: bool,
    pub scanned: usize,
    pub working_moved: usize,
    pub working_removed: usize,
    pub waiting_removed: usize,
    pub preserved: usize,
    pub budget_exhausted: bool,
}

impl OrphanPassReport {
    pub fn cleaned(&self) -> usize {
        self.working_moved + self.working_removed + self.waiting_removed
    }
}

enum Ownership {
    Owned,
    NotOwned,
    Unknown,
}

pub struct OrphanCleanupService {
    acquisition: Arc<AcquisitionService>,
    config: OrphanCleanupConfig,
    batch_size: usize,
    batch_enabled: bool,
    instance_id: String,
    metrics: SchedulerMetrics,
    total_cleaned: AtomicU64,
    last_run_ms: Mutex<Option<i64>>,
}

impl OrphanCleanupService {
    pub fn new(acquisition: Arc<AcquisitionService>) -> Self {
        let config = acquisition.config().orphan_cleanup.clone();
        let batching = acquisition.config().batch_operations.clone();
        Self {
            acquisition,
            config,
            batch_size: batching.batch_size,
            batch_enabled: batching.enabled,
            instance_id: instance_id(),
            metrics: SchedulerMetrics::new(),
            total_cleaned: AtomicU64::new(0),
            last_run_ms: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
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

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.config.enabled
            && self
                .last_run_ms
                .lock()
                .is_none_or(|last| now_ms - last >= self.config.interval_ms)
    }

    /// Runs a pass if this pod wins leadership (or `force_all_pods` is set),
    /// releasing leadership afterwards.
    pub async fn run_pass(&self) -> Result<OrphanPassReport, StoreError> {
        *self.last_run_ms.lock() = Some(self.acquisition.clock().local_ms());
        if self.config.force_all_pods {
            return self.force_cleanup_orphaned_agents().await;
        }

        let store = self.acquisition.store();
        let leader = store
            .try_acquire_leadership(&self.instance_id, self.config.leadership_ttl_ms)
            .await?;
        if !leader {
            debug!("Another pod holds cleanup leadership; skipping orphan pass");
            self.metrics.record_cleanup_skipped(CleanupKind::Orphan);
            return Ok(OrphanPassReport::default());
        }

        let result = self.scan().await;
        match store.release_leadership(&self.instance_id).await {
            Ok(true) => {}
            Ok(false) => debug!("Cleanup leadership expired before release"),
            Err(e) => warn!(error = %e, "Failed to release cleanup leadership"),
        }
        result
    }

    /// Runs a pass without leadership.
    pub async fn force_cleanup_orphaned_agents(&self) -> Result<OrphanPassReport, StoreError> {
        self.scan().await
    }

    async fn scan(&self) -> Result<OrphanPassReport, StoreError> {
        let started = Instant::now();
        let now_ms = self.acquisition.clock().now_ms();
        let cutoff = (now_ms - self.config.threshold_ms).div_euclid(1000);
        let mut report = OrphanPassReport {
            ran: true,
            ..Default::default()
        };

        self.scan_working(cutoff, started, &mut report).await?;
        if report.budget_exhausted {
            debug!("Orphan budget exhausted after working scan; skipping waiting scan");
        } else if self.acquisition.registered_count() == 0 {
            debug!("No registered agents; skipping waiting scan");
        } else {
            self.scan_waiting(started, &mut report).await?;
        }

        let cleaned = report.cleaned();
        self.total_cleaned.fetch_add(cleaned as u64, Ordering::SeqCst);
        self.metrics
            .record_cleanup(CleanupKind::Orphan, started.elapsed(), cleaned);
        if cleaned > 0 {
            info!(
                moved = report.working_moved,
                removed = report.working_removed,
                waiting_removed = report.waiting_removed,
                preserved = report.preserved,
                "Orphan cleanup pass finished"
            );
        }
        Ok(report)
    }

    fn budget_exhausted(&self, started: Instant) -> bool {
        self.config.run_budget_ms > 0
            && started.elapsed() >= Duration::from_millis(self.config.run_budget_ms as u64)
    }

    fn page_size(&self) -> usize {
        match self.batch_size {
            0 => FULL_SCAN_LIMIT,
            size => size,
        }
    }

    fn ownership(&self, agent_type: &str) -> Ownership {
        match self.acquisition.owns_shard(agent_type) {
            Ok(true) => Ownership::Owned,
            Ok(false) => Ownership::NotOwned,
            Err(e) => {
                debug!(agent = %agent_type, error = %e, "Shard check failed; preserving entry");
                Ownership::Unknown
            }
        }
    }

    /// Registered here and allowed by the name patterns.
    fn is_valid(&self, agent_type: &str) -> bool {
        self.acquisition.is_registered(agent_type)
            && self.acquisition.patterns().allows(agent_type)
    }

    async fn scan_working(
        &self,
        cutoff: i64,
        started: Instant,
        report: &mut OrphanPassReport,
    ) -> Result<(), StoreError> {
        let store = self.acquisition.store();
        let limit = self.page_size();
        let mut offset = 0;

        loop {
            let page = store
                .range_by_score(SetKind::Working, cutoff, offset, limit)
                .await?;
            if page.is_empty() {
                break;
            }
            report.scanned += page.len();
            let mut cleaned = 0;

            for (agent_type, score) in &page {
                if self.budget_exhausted(started) {
                    report.budget_exhausted = true;
                    return Ok(());
                }
                if self.acquisition.is_active(agent_type) {
                    report.preserved += 1;
                    continue;
                }
                if !matches!(self.ownership(agent_type), Ownership::Owned) {
                    report.preserved += 1;
                    continue;
                }

                let valid = self.is_valid(agent_type);
                let done = match (score, valid) {
                    (StoredScore::Valid(deadline), true) => {
                        let ready_at = self.original_ready_time(agent_type, *deadline);
                        let moved = store
                            .move_agent_conditional(agent_type, *deadline, ready_at)
                            .await?;
                        if moved {
                            info!(agent = %agent_type, deadline, ready_at, "Recovered orphaned agent");
                            report.working_moved += 1;
                        }
                        moved
                    }
                    (StoredScore::Valid(deadline), false) => {
                        let pair = [(agent_type.clone(), *deadline)];
                        let removed = store
                            .remove_agents_conditional(SetKind::Working, &pair)
                            .await?
                            .contains(agent_type);
                        if removed {
                            info!(agent = %agent_type, "Removed orphan of unconfigured agent");
                            report.working_removed += 1;
                        }
                        removed
                    }
                    (StoredScore::Invalid, _) => {
                        warn!(agent = %agent_type, "Corrupted working score; removing orphan");
                        store.remove_agent(agent_type).await?;
                        report.working_removed += 1;
                        true
                    }
                };
                if done {
                    cleaned += 1;
                } else {
                    report.preserved += 1;
                }
            }

            offset += page.len() - cleaned;
            if page.len() < limit {
                break;
            }
        }
        Ok(())
    }

    /// `deadline − timeout` for a registered agent, floored at 0; the
    /// current time when the timeout is unknown.
    fn original_ready_time(&self, agent_type: &str, deadline: i64) -> i64 {
        match self.acquisition.registration(agent_type) {
            Some(registration) => (deadline - registration.agent.timeout_secs()).max(0),
            None => self.acquisition.clock().score(0),
        }
    }

    fn is_invalid_waiting(&self, agent_type: &str) -> bool {
        if self.config.remove_numeric_only_agents && is_account_id_like(agent_type) {
            return true;
        }
        !self.is_valid(agent_type)
    }

    async fn scan_waiting(
        &self,
        started: Instant,
        report: &mut OrphanPassReport,
    ) -> Result<(), StoreError> {
        let store = self.acquisition.store();
        let limit = self.page_size();
        let mut offset = 0;

        loop {
            let page = store
                .range_by_score(SetKind::Waiting, i64::MAX, offset, limit)
                .await?;
            if page.is_empty() {
                break;
            }
            report.scanned += page.len();

            let mut conditional: Vec<(String, i64)> = Vec::new();
            let mut unconditional: Vec<String> = Vec::new();
            for (agent_type, score) in &page {
                if self.budget_exhausted(started) {
                    report.budget_exhausted = true;
                    break;
                }
                if !self.is_invalid_waiting(agent_type) {
                    continue;
                }
                if !matches!(self.ownership(agent_type), Ownership::Owned) {
                    report.preserved += 1;
                    continue;
                }
                match score {
                    StoredScore::Valid(s) => conditional.push((agent_type.clone(), *s)),
                    StoredScore::Invalid => unconditional.push(agent_type.clone()),
                }
            }

            let mut cleaned = self.remove_waiting(&conditional).await?;
            for agent_type in &unconditional {
                store.remove_agent(agent_type).await?;
                cleaned += 1;
            }
            report.waiting_removed += cleaned;
            if cleaned > 0 {
                info!(removed = cleaned, "Removed invalid waiting entries");
            }

            if report.budget_exhausted {
                break;
            }
            offset += page.len() - cleaned.min(page.len());
            if page.len() < limit {
                break;
            }
        }
        Ok(())
    }

    /// Conditional batch remove with per-item fallback.
    async fn remove_waiting(&self, pairs: &[(String, i64)]) -> Result<usize, StoreError> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let store = self.acquisition.store();

        let mut unresolved: Vec<&(String, i64)> = pairs.iter().collect();
        let mut removed = 0;
        if self.batch_enabled {
            match store.remove_agents_conditional(SetKind::Waiting, pairs).await {
                Ok(outcome) => {
                    removed += outcome.count();
                    unresolved.retain(|(name, _)| !outcome.contains(name));
                }
                Err(e) => debug!(error = %e, "Batch waiting removal failed; falling back to per-item"),
            }
        }

        for (agent_type, score) in unresolved {
            let pair = [(agent_type.clone(), *score)];
            if store
                .remove_agents_conditional(SetKind::Waiting, &pair)
                .await?
                .contains(agent_type)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
