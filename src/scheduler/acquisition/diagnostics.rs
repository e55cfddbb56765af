//! Backlog health, stall detection and the store consistency spot-check.

use rand::RngExt;
use tracing::{debug, warn};

use super::AcquisitionService;
use crate::error::StoreError;
use crate::scheduler::store::SetKind;

const DIAGNOSTIC_WINDOW_MIN: usize = 8;
const DIAGNOSTIC_WINDOW_MAX: usize = 64;
const STALL_LOOKAHEAD: usize = 256;
const DEGRADED_WARN_INTERVAL_MS: i64 = 10 * 60 * 1000;
const STALL_WARN_INTERVAL_MS: i64 = 5 * 60 * 1000;
const CONSISTENCY_SAMPLE: usize = 50;

/// Backlog view from the most recent acquire cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacklogSnapshot {
    /// Ready entries this pod could run.
    pub ready_count: usize,
    pub oldest_overdue_seconds: i64,
    pub min_interval_seconds: i64,
    /// Free slots this cycle; `None` when unbounded.
    pub capacity_per_cycle: Option<usize>,
    pub degraded: bool,
    pub degraded_reason: String,
    /// Local ms when the current degraded streak began.
    pub degraded_since_ms: Option<i64>,
    pub stalled: bool,
    last_degraded_warn_ms: Option<i64>,
    last_stall_warn_ms: Option<i64>,
}

/// Result of sampling waiting members against the working set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Agents found in both sets.
    pub violations: usize,
    pub sampled: usize,
}

fn rate_limited(last: &mut Option<i64>, now_ms: i64, interval_ms: i64) -> bool {
    if last.is_some_and(|previous| now_ms - previous < interval_ms) {
        return false;
    }
    *last = Some(now_ms);
    true
}

fn diagnostic_window(batch_size: usize) -> usize {
    if batch_size == 0 {
        DIAGNOSTIC_WINDOW_MAX
    } else {
        batch_size.clamp(DIAGNOSTIC_WINDOW_MIN, DIAGNOSTIC_WINDOW_MAX)
    }
}

impl AcquisitionService {
    /// Samples the head of the waiting set and refreshes the backlog
    /// snapshot. Errors leave the previous snapshot in place.
    ///
    /// Degradation looks only at locally runnable entries; entries filtered
    /// out by sharding never count against this pod.
    pub(super) async fn run_backlog_diagnostics(&self, capacity: Option<usize>) {
        let window = diagnostic_window(self.config.batch_operations.batch_size);
        let now = self.clock.score(0);
        let page = match self
            .store
            .range_by_score(SetKind::Waiting, now, 0, window)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                debug!(error = %e, "Backlog diagnostics skipped");
                return;
            }
        };

        let mut ready_count = 0;
        let mut oldest_score: Option<i64> = None;
        for (name, score) in &page {
            if !self.is_registered(name) || !self.is_enabled(name) {
                continue;
            }
            ready_count += 1;
            if let Some(score) = score.value() {
                oldest_score = Some(oldest_score.map_or(score, |o| o.min(score)));
            }
        }
        let oldest_overdue = oldest_score.map_or(0, |s| (now - s).max(0));
        let min_interval = self.min_interval_secs();
        let degraded = min_interval > 0 && oldest_overdue > min_interval;
        let capacity_label = capacity.map_or("unbounded".to_string(), |c| c.to_string());
        let reason = if degraded {
            format!(
                "oldest_overdue={}s > min_interval={}s; ready={} capacity_per_cycle={}",
                oldest_overdue, min_interval, ready_count, capacity_label
            )
        } else {
            String::new()
        };

        let stalled = if !page.is_empty() && ready_count == 0 && min_interval > 0 {
            self.next_local_score(now)
                .await
                .is_some_and(|next| next - now > min_interval)
        } else {
            false
        };

        let local_now = self.clock.local_ms();
        let (warn_degraded, warn_stall) = {
            let mut snapshot = self.backlog.lock();
            snapshot.ready_count = ready_count;
            snapshot.oldest_overdue_seconds = oldest_overdue;
            snapshot.min_interval_seconds = min_interval;
            snapshot.capacity_per_cycle = capacity;
            snapshot.degraded = degraded;
            snapshot.degraded_reason = reason.clone();
            snapshot.stalled = stalled;
            if degraded {
                snapshot.degraded_since_ms.get_or_insert(local_now);
            } else {
                snapshot.degraded_since_ms = None;
            }
            let warn_degraded = degraded
                && rate_limited(
                    &mut snapshot.last_degraded_warn_ms,
                    local_now,
                    DEGRADED_WARN_INTERVAL_MS,
                );
            let warn_stall = stalled
                && rate_limited(&mut snapshot.last_stall_warn_ms, local_now, STALL_WARN_INTERVAL_MS);
            (warn_degraded, warn_stall)
        };

        self.metrics.update_backlog(ready_count, oldest_overdue);
        if warn_degraded {
            warn!(
                oldest_overdue_seconds = oldest_overdue,
                min_interval_seconds = min_interval,
                ready = ready_count,
                active = self.active_count(),
                "Scheduler backlog degraded: {}",
                reason
            );
        }
        if stalled {
            self.metrics.record_stall_detected();
            if warn_stall {
                warn!(
                    backlog = page.len(),
                    min_interval_seconds = min_interval,
                    "Waiting backlog holds no locally runnable agent; next local agent is far out"
                );
            }
        }
    }

    /// Score of the next locally runnable waiting agent at or after `now`.
    async fn next_local_score(&self, now: i64) -> Option<i64> {
        let upcoming = self
            .store
            .range_from_score(SetKind::Waiting, now, STALL_LOOKAHEAD)
            .await
            .ok()?;
        upcoming
            .into_iter()
            .find(|(name, _)| self.is_registered(name) && self.is_enabled(name))
            .map(|(_, score)| score)
    }

    /// Checks a random sample of waiting members for presence in working.
    /// Falls back to a window at a random offset when random sampling is
    /// unsupported.
    pub async fn consistency_check(&self) -> Result<ConsistencyReport, StoreError> {
        let sample = match self
            .store
            .random_members(SetKind::Waiting, CONSISTENCY_SAMPLE)
            .await
        {
            Ok(sample) => sample,
            Err(e) => {
                debug!(error = %e, "Random sampling failed; using a range window");
                let total = self.store.cardinality(SetKind::Waiting).await?;
                let offset = if total > CONSISTENCY_SAMPLE {
                    rand::rng().random_range(0..=total - CONSISTENCY_SAMPLE)
                } else {
                    0
                };
                self.store
                    .range_by_score(SetKind::Waiting, i64::MAX, offset, CONSISTENCY_SAMPLE)
                    .await?
                    .into_iter()
                    .map(|(name, _)| name)
                    .collect()
            }
        };
        if sample.is_empty() {
            return Ok(ConsistencyReport::default());
        }

        let scores = self.store.scores(&sample).await?;
        let violations = scores
            .iter()
            .filter(|s| s.working.is_some() && s.waiting.is_some())
            .count();
        if violations > 0 {
            self.metrics.record_validation("both_sets");
        }
        Ok(ConsistencyReport {
            violations,
            sampled: sample.len(),
        })
    }
}
