//! The acquire cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::{AcquisitionService, CycleOutcome, Registration};
use crate::error::StoreError;
use crate::metrics::AcquireMode;
use crate::scheduler::store::{is_numeric_member, SetKind, StoredScore};

/// Upper bound on chunk scans per cycle.
const MAX_CHUNK_ATTEMPTS: usize = 100;
/// Stop scanning after this many consecutive chunks acquire nothing.
const MAX_ZERO_CHUNKS: usize = 2;
/// Scan width standing in for "unbounded" capacity.
const UNBOUNDED_CAPACITY: usize = i32::MAX as usize;

/// Number of chunk scans allowed for one cycle.
pub(crate) fn max_chunk_attempts(capacity: usize, chunk: usize, multiplier: f64) -> usize {
    let chunk = chunk.max(1);
    let base = capacity.div_ceil(chunk).max(1);
    let multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
    let scaled = (base as f64 * multiplier).ceil();
    if scaled >= MAX_CHUNK_ATTEMPTS as f64 {
        MAX_CHUNK_ATTEMPTS
    } else {
        (scaled as usize).max(1)
    }
}

impl AcquisitionService {
    /// Runs one acquire cycle and returns the number of agents started.
    ///
    /// Blocked by either breaker, the cycle returns 0 without touching the
    /// store. Store errors are absorbed here and recorded on the breakers.
    pub async fn saturate_pool(self: &Arc<Self>) -> usize {
        if !self.acquisition_breaker.allow_request() || !self.store_breaker.allow_request() {
            debug!("Acquire cycle blocked by circuit breaker");
            *self.last_cycle.lock() = CycleOutcome {
                capacity: self.available_capacity(),
                acquired: 0,
                blocked: true,
            };
            return 0;
        }

        self.clock.sync_if_due(self.store.as_ref()).await;

        let capacity = self.available_capacity();
        if capacity == Some(0) {
            debug!(active = self.active_count(), "No free permits; skipping acquisition");
            *self.last_cycle.lock() = CycleOutcome {
                capacity,
                acquired: 0,
                blocked: false,
            };
            return 0;
        }

        self.process_recovery_queue().await;
        if self.repopulate_due_and_tick() {
            if let Err(e) = self.repopulate().await {
                warn!(error = %e, "Periodic repopulate failed");
            }
        }
        self.run_backlog_diagnostics(capacity).await;

        let result = self.acquire_chunks(capacity).await;
        let acquired = match result {
            Ok(acquired) => {
                self.acquisition_breaker.record_success();
                self.store_breaker.record_success();
                acquired
            }
            Err(e) => {
                if e.is_connection_error() {
                    self.store_breaker.record_failure(&e);
                }
                self.acquisition_breaker.record_failure(&e);
                warn!(error = %e, kind = e.kind_label(), "Acquire cycle failed");
                0
            }
        };

        *self.last_cycle.lock() = CycleOutcome {
            capacity,
            acquired,
            blocked: false,
        };
        self.metrics
            .update_agent_counts(self.registered_count(), self.active_count());
        acquired
    }

    /// Free slots, or `None` when unbounded.
    pub fn available_capacity(&self) -> Option<usize> {
        if !self.limiter.is_bounded() {
            return None;
        }
        Some(self.limiter.max().saturating_sub(self.active_count()))
    }

    async fn acquire_chunks(self: &Arc<Self>, capacity: Option<usize>) -> Result<usize, StoreError> {
        let effective = capacity.unwrap_or(UNBOUNDED_CAPACITY);
        let batching = &self.config.batch_operations;
        let per_chunk = if batching.batch_size == 0 {
            effective
        } else {
            batching.batch_size
        };
        let max_attempts =
            max_chunk_attempts(effective, per_chunk, batching.chunk_attempt_multiplier);

        let mut attempted: HashSet<String> = HashSet::with_capacity(per_chunk.min(1024));
        let mut remaining = effective;
        let mut offset = 0;
        let mut attempts = 0;
        let mut zero_chunks = 0;
        let mut acquired_total = 0;

        while remaining > 0 && attempts < max_attempts {
            attempts += 1;
            let chunk = remaining.min(per_chunk);
            let now = self.clock.score(0);
            let page = self
                .store
                .range_by_score(SetKind::Waiting, now, offset, chunk)
                .await?;
            if page.is_empty() {
                break;
            }
            self.metrics.record_acquire_attempts(page.len());

            let acquired = if batching.enabled {
                self.acquire_batch(&page, &mut attempted).await?
            } else {
                self.acquire_individually(&page, &mut attempted).await?
            };

            if acquired == 0 {
                zero_chunks += 1;
                if zero_chunks >= MAX_ZERO_CHUNKS {
                    break;
                }
                offset += page.len();
                continue;
            }

            zero_chunks = 0;
            acquired_total += acquired;
            remaining = remaining.saturating_sub(acquired);
            offset = 0;
        }

        if attempts >= max_attempts && remaining > 0 && capacity.is_some() {
            debug!(
                attempts,
                remaining,
                acquired = acquired_total,
                "Chunk attempt bound reached with free slots"
            );
        }
        Ok(acquired_total)
    }

    /// Local eligibility for one scanned entry; marks it attempted.
    fn eligible(&self, agent_type: &str, attempted: &mut HashSet<String>) -> Option<Registration> {
        if !attempted.insert(agent_type.to_string()) {
            return None;
        }
        if self.is_active(agent_type) {
            return None;
        }
        let registration = self.registration(agent_type)?;
        if !self.is_enabled(agent_type) {
            return None;
        }
        Some(registration)
    }

    async fn acquire_batch(
        self: &Arc<Self>,
        page: &[(String, StoredScore)],
        attempted: &mut HashSet<String>,
    ) -> Result<usize, StoreError> {
        let started = Instant::now();
        let mut candidates: Vec<(Registration, i64)> = Vec::with_capacity(page.len());
        for (agent_type, _) in page {
            let Some(registration) = self.eligible(agent_type, attempted) else {
                continue;
            };
            if !self.limiter.try_acquire() {
                attempted.remove(agent_type);
                break;
            }
            let deadline = self.clock.score(registration.agent.timeout_ms());
            if is_numeric_member(agent_type) || deadline <= 0 {
                self.limiter.release();
                self.metrics.record_validation("invalid_pair");
                continue;
            }
            candidates.push((registration, deadline));
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        let pairs: Vec<(String, i64)> = candidates
            .iter()
            .map(|(r, deadline)| (r.agent_type().to_string(), *deadline))
            .collect();

        let outcome = match self.store.acquire_agents(&pairs).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, candidates = candidates.len(), "Batch acquire failed; falling back to individual");
                self.metrics.record_batch_fallback();
                for (registration, _) in &candidates {
                    self.limiter.release();
                    attempted.remove(registration.agent_type());
                }
                let retry: Vec<(String, StoredScore)> = candidates
                    .iter()
                    .map(|(r, _)| (r.agent_type().to_string(), StoredScore::Invalid))
                    .collect();
                return self.acquire_individually(&retry, attempted).await;
            }
        };

        let mut acquired = 0;
        for (registration, deadline) in candidates {
            if outcome.contains(registration.agent_type()) {
                if self.start_execution(registration, deadline).await {
                    acquired += 1;
                }
            } else {
                self.limiter.release();
            }
        }
        self.metrics
            .record_acquired(AcquireMode::Batch, acquired, started.elapsed());
        Ok(acquired)
    }

    async fn acquire_individually(
        self: &Arc<Self>,
        page: &[(String, StoredScore)],
        attempted: &mut HashSet<String>,
    ) -> Result<usize, StoreError> {
        let started = Instant::now();
        let mut acquired = 0;
        for (agent_type, _) in page {
            let Some(registration) = self.eligible(agent_type, attempted) else {
                continue;
            };
            if !self.limiter.try_acquire() {
                attempted.remove(agent_type);
                break;
            }
            let deadline = self.clock.score(registration.agent.timeout_ms());
            match self.store.acquire_agent(agent_type, deadline).await {
                Ok(Some(written)) => {
                    if self.start_execution(registration, written).await {
                        acquired += 1;
                    }
                }
                Ok(None) => {
                    self.limiter.release();
                }
                Err(e) => {
                    self.limiter.release();
                    self.metrics.record_acquired(
                        AcquireMode::Individual,
                        acquired,
                        started.elapsed(),
                    );
                    return Err(e);
                }
            }
        }
        self.metrics
            .record_acquired(AcquireMode::Individual, acquired, started.elapsed());
        Ok(acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_attempts_without_multiplier() {
        assert_eq!(max_chunk_attempts(10, 10, 0.0), 1);
        assert_eq!(max_chunk_attempts(25, 10, 0.0), 3);
        assert_eq!(max_chunk_attempts(1, 10, 0.0), 1);
    }

    #[test]
    fn test_chunk_attempts_scale_and_cap() {
        assert_eq!(max_chunk_attempts(25, 10, 2.5), 8);
        assert_eq!(max_chunk_attempts(1000, 1, 4.0), 100);
        assert_eq!(max_chunk_attempts(UNBOUNDED_CAPACITY, 50, 0.0), 100);
        assert_eq!(max_chunk_attempts(UNBOUNDED_CAPACITY, UNBOUNDED_CAPACITY, 0.0), 1);
    }
}
