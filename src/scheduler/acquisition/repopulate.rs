//! Differential resync of registered agents into the store.
//!
//! Adds registered agents missing from both sets and never removes
//! anything. Presence is read through the cheapest path that works:
//! batch presence, then batch scores, then a full scan of both sets. If
//! the differential path fails outright, a full rescore runs instead.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::AcquisitionService;
use crate::error::StoreError;
use crate::scheduler::store::SetKind;

const FULL_SCAN_LIMIT: usize = i32::MAX as usize;

#[derive(Debug, Default)]
pub(super) struct RepopulateState {
    last_run_ms: Option<i64>,
    cycles_since: i64,
}

impl AcquisitionService {
    fn repopulate_due(&self, state: &RepopulateState) -> bool {
        let Some(last) = state.last_run_ms else {
            return true;
        };
        let period_secs = self.config.refresh_period_seconds;
        state.cycles_since >= period_secs
            || self.clock.local_ms() - last >= self.config.refresh_period_ms()
    }

    /// Counts one acquire cycle and reports whether repopulate is due.
    pub(super) fn repopulate_due_and_tick(&self) -> bool {
        let mut state = self.repopulate_state.lock();
        state.cycles_since += 1;
        self.repopulate_due(&state)
    }

    /// Runs repopulate when its cadence has elapsed. Returns whether it ran.
    pub async fn repopulate_if_due_now(&self) -> Result<bool, StoreError> {
        let due = {
            let state = self.repopulate_state.lock();
            self.repopulate_due(&state)
        };
        if !due {
            return Ok(false);
        }
        self.repopulate().await?;
        Ok(true)
    }

    /// Adds every registered agent that is absent from both sets. Returns
    /// the number added.
    pub async fn repopulate(&self) -> Result<usize, StoreError> {
        {
            let mut state = self.repopulate_state.lock();
            state.last_run_ms = Some(self.clock.local_ms());
            state.cycles_since = 0;
        }

        let mut names: Vec<String> = self.registry.lock().keys().cloned().collect();
        names.sort();
        if names.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let result = match self.differential_repopulate(&names).await {
            Ok(added) => Ok(added),
            Err(e) => {
                warn!(error = %e, "Differential repopulate failed; running full rescore");
                self.metrics.record_repopulate_error("differential");
                self.full_rescore(&names).await.inspect_err(|_| {
                    self.metrics.record_repopulate_error("rescore");
                })
            }
        };

        if let Ok(added) = result {
            self.metrics.record_repopulate(started.elapsed(), added);
            if added > 0 {
                info!(added, registered = names.len(), "Repopulated missing agents");
            } else {
                debug!(registered = names.len(), "Repopulate found nothing missing");
            }
        }
        result
    }

    fn chunk_size(&self, total: usize) -> usize {
        match self.config.batch_operations.batch_size {
            0 => total.max(1),
            size => size,
        }
    }

    async fn differential_repopulate(&self, names: &[String]) -> Result<usize, StoreError> {
        let missing = self.missing_agents(names).await?;
        if missing.is_empty() {
            return Ok(0);
        }
        let pairs: Vec<(String, i64)> = missing
            .into_iter()
            .map(|name| {
                let score = self.clock.score(self.initial_offset_ms());
                (name, score)
            })
            .collect();
        self.add_pairs(&pairs).await
    }

    async fn missing_agents(&self, names: &[String]) -> Result<Vec<String>, StoreError> {
        let mut missing = Vec::new();
        for chunk in names.chunks(self.chunk_size(names.len())) {
            match self.store.presence(chunk).await {
                Ok(flags) if flags.len() == chunk.len() => {
                    missing.extend(
                        chunk
                            .iter()
                            .zip(flags)
                            .filter(|(_, present)| !present)
                            .map(|(name, _)| name.clone()),
                    );
                }
                Ok(flags) => {
                    debug!(expected = chunk.len(), got = flags.len(), "Presence result misaligned");
                    self.metrics.record_repopulate_error("presence_shape");
                    missing.extend(self.missing_by_scores(chunk).await?);
                }
                Err(e) => {
                    debug!(error = %e, "Batch presence failed; trying batch scores");
                    self.metrics.record_repopulate_error("presence");
                    missing.extend(self.missing_by_scores(chunk).await?);
                }
            }
        }
        Ok(missing)
    }

    async fn missing_by_scores(&self, chunk: &[String]) -> Result<Vec<String>, StoreError> {
        match self.store.scores(chunk).await {
            Ok(scores) if scores.len() == chunk.len() => Ok(chunk
                .iter()
                .zip(scores)
                .filter(|(_, s)| !s.is_present())
                .map(|(name, _)| name.clone())
                .collect()),
            Ok(_) | Err(_) => {
                debug!("Batch scores unavailable; scanning both sets");
                self.metrics.record_repopulate_error("scores");
                let present = self.scan_all_members().await?;
                Ok(chunk
                    .iter()
                    .filter(|name| !present.contains(*name))
                    .cloned()
                    .collect())
            }
        }
    }

    async fn scan_all_members(&self) -> Result<HashSet<String>, StoreError> {
        let mut present = HashSet::new();
        for set in [SetKind::Working, SetKind::Waiting] {
            let entries = self
                .store
                .range_by_score(set, i64::MAX, 0, FULL_SCAN_LIMIT)
                .await?;
            present.extend(entries.into_iter().map(|(name, _)| name));
        }
        Ok(present)
    }

    /// Reads both scores of every registered agent. Working agents keep
    /// running, waiting agents keep their score, absent agents are added
    /// as ready now.
    async fn full_rescore(&self, names: &[String]) -> Result<usize, StoreError> {
        let now = self.clock.score(0);
        let mut absent = Vec::new();
        for chunk in names.chunks(self.chunk_size(names.len())) {
            let scores = self.store.scores(chunk).await?;
            if scores.len() != chunk.len() {
                return Err(StoreError::UnexpectedResult {
                    script: "scores",
                    detail: format!("expected {} entries, got {}", chunk.len(), scores.len()),
                });
            }
            for (name, score) in chunk.iter().zip(scores) {
                if score.working.is_some() || score.waiting.is_some() {
                    continue;
                }
                absent.push((name.clone(), now));
            }
        }
        self.add_pairs(&absent).await
    }

    async fn add_pairs(&self, pairs: &[(String, i64)]) -> Result<usize, StoreError> {
        if pairs.is_empty() {
            return Ok(0);
        }
        if !self.config.batch_operations.enabled {
            let mut added = 0;
            for (name, score) in pairs {
                if self.store.add_agent(name, *score).await? {
                    added += 1;
                }
            }
            return Ok(added);
        }

        let mut added = 0;
        for chunk in pairs.chunks(self.chunk_size(pairs.len())) {
            let outcome = self.store.add_agents(chunk).await?;
            let skipped = chunk.len() - outcome.count().min(chunk.len());
            if skipped > 0 {
                debug!(skipped, "Batch add skipped present or invalid agents");
            }
            added += outcome.count();
        }
        Ok(added)
    }
}
