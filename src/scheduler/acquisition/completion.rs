//! Execution, completion and every path that releases a permit.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use rand::RngExt;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use super::{AcquisitionService, RecoveryEntry, Registration};
use crate::scheduler::agent::AgentError;
use crate::scheduler::failure::round_up_to_seconds;
use crate::scheduler::run_state::RunState;
use crate::scheduler::store::RescheduleOutcome;

const RECOVERY_QUEUE_CAPACITY: usize = 1024;
const RECOVERY_MAX_ATTEMPTS: u32 = 3;
const SHUTDOWN_ABORT_GRACE: Duration = Duration::from_millis(100);

/// Which store write a recovery entry replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOp {
    /// Conditional add after a failed registration.
    Add,
    /// Reschedule after a failed completion.
    Reschedule,
}

/// Releases the execution's local state if the supervisor is dropped
/// before it finished (runtime shutdown, supervisor abort).
struct CompletionGuard {
    service: Weak<AcquisitionService>,
    agent_type: String,
    deadline: i64,
    run_state: Arc<RunState>,
    armed: bool,
}

impl CompletionGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(service) = self.service.upgrade() {
            warn!(agent = %self.agent_type, "Execution supervisor dropped; releasing local state");
            service.release_local(&self.agent_type, self.deadline, &self.run_state);
        }
    }
}

impl AcquisitionService {
    /// Starts a freshly acquired agent: run state, dead-man timer, pool
    /// submission and supervisor. The caller already holds a permit.
    ///
    /// Returns false when the pool rejected the execution; the agent is
    /// then handed back to the waiting set.
    pub(super) async fn start_execution(
        self: &Arc<Self>,
        registration: Registration,
        deadline: i64,
    ) -> bool {
        let agent_type = registration.agent_type().to_string();
        let run_state = Arc::new(RunState::new(true));
        self.active.lock().insert(agent_type.clone(), deadline);
        self.run_states
            .lock()
            .insert(agent_type.clone(), Arc::clone(&run_state));
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);

        let slot = match self.pool.try_reserve() {
            Ok(slot) => slot,
            Err(e) => {
                warn!(agent = %agent_type, error = %e, "Execution pool rejected agent");
                self.counters
                    .submission_failures
                    .fetch_add(1, Ordering::SeqCst);
                self.metrics.record_submission_failure();
                self.requeue_rejected(&agent_type, deadline, &run_state).await;
                return false;
            }
        };

        if self.config.zombie_cleanup.enabled {
            self.arm_deadman(&agent_type, deadline, &run_state);
        }

        let agent = registration.agent.clone();
        let execution = Arc::clone(&registration.execution);
        let instrumentation = Arc::clone(&registration.instrumentation);
        let started_state = Arc::clone(&run_state);
        let started = Instant::now();
        let handle = self.pool.spawn(slot, async move {
            started_state.mark_started();
            instrumentation.execution_started(&agent);
            execution.execute(&agent).await
        });
        self.executions
            .lock()
            .insert(agent_type.clone(), handle.abort_handle());

        let guard = CompletionGuard {
            service: Arc::downgrade(self),
            agent_type: agent_type.clone(),
            deadline,
            run_state: Arc::clone(&run_state),
            armed: true,
        };
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = handle.await.map_err(join_error_to_agent_error).and_then(|r| r);
            service
                .finish_execution(&registration, deadline, &run_state, result, started.elapsed())
                .await;
            guard.disarm();
        });

        debug!(agent = %agent_type, deadline, "Submitted agent execution");
        true
    }

    /// Completion: reschedule, then release the permit, then clear local
    /// state. Reschedule always precedes release.
    async fn finish_execution(
        &self,
        registration: &Registration,
        deadline: i64,
        run_state: &Arc<RunState>,
        result: Result<(), AgentError>,
        elapsed: Duration,
    ) {
        run_state.cancel_deadman();
        let agent = &registration.agent;
        let agent_type = agent.agent_type();
        self.pool.record_outcome(result.is_ok(), elapsed);

        let computed_offset = match &result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
                registration
                    .instrumentation
                    .execution_completed(agent, elapsed);
                self.failure_policy.record_success(agent_type);
                self.cadence_offset_ms(deadline, agent.timeout_secs(), agent.interval_ms())
                    .unwrap_or(agent.interval_ms())
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                registration
                    .instrumentation
                    .execution_failed(agent, e, elapsed);
                let (class, offset) = self.failure_policy.failure_offset_ms(agent, e);
                debug!(agent = %agent_type, class = class.label(), offset_ms = offset, "Execution failed");
                offset
            }
        };

        if self.is_registered(agent_type) {
            let offset_ms = if self.is_shutting_down() {
                self.shutdown_offset_ms(agent_type, deadline)
            } else {
                computed_offset
            };
            self.reschedule_with_recovery(agent_type, offset_ms).await;
        } else {
            debug!(agent = %agent_type, "Agent unregistered during execution; not rescheduling");
        }

        self.release_local(agent_type, deadline, run_state);
    }

    /// Offset that puts the next run at `acquire_time + interval`, where
    /// `acquire_time = deadline − timeout`. Floored at 0, rounded up to
    /// whole seconds. `None` for a corrupted deadline.
    pub(crate) fn cadence_offset_ms(
        &self,
        deadline: i64,
        timeout_secs: i64,
        interval_ms: i64,
    ) -> Option<i64> {
        if deadline <= 0 {
            return None;
        }
        let acquired_ms = (deadline - timeout_secs) * 1000;
        let target_ms = acquired_ms + interval_ms;
        let offset = (target_ms - self.clock.now_ms()).max(0);
        Some(round_up_to_seconds(offset))
    }

    /// Offset used while shutting down: cadence-preserving when the agent
    /// is known, else a jitter in `[1, shutdown_seconds]` seconds, else 0.
    pub(crate) fn shutdown_offset_ms(&self, agent_type: &str, deadline: i64) -> i64 {
        if let Some(registration) = self.registration(agent_type) {
            let agent = &registration.agent;
            if let Some(offset) =
                self.cadence_offset_ms(deadline, agent.timeout_secs(), agent.interval_ms())
            {
                return offset;
            }
        }
        let max_secs = self.config.jitter.shutdown_seconds;
        if max_secs > 0 {
            return rand::rng().random_range(1..=max_secs) * 1000;
        }
        0
    }

    async fn reschedule_with_recovery(&self, agent_type: &str, offset_ms: i64) {
        let score = self.clock.score(offset_ms);
        let store = Arc::clone(&self.store);
        let owned = agent_type.to_string();
        let result = self
            .with_store_retries("reschedule_agent", || {
                let store = Arc::clone(&store);
                let agent_type = owned.clone();
                async move { store.reschedule_agent(&agent_type, score).await }
            })
            .await;

        match result {
            Ok(outcome) => {
                if outcome == RescheduleOutcome::Added {
                    debug!(agent = %agent_type, score, "Agent was absent at reschedule; re-added");
                }
            }
            Err(e) => {
                warn!(agent = %agent_type, error = %e, "Reschedule failed after retries; queued for recovery");
                self.metrics.record_reschedule_failure();
                self.metrics.record_retry_exhausted();
                self.enqueue_recovery(RecoveryEntry {
                    agent_type: agent_type.to_string(),
                    op: RecoveryOp::Reschedule,
                    offset_ms,
                    attempts: 0,
                });
            }
        }
    }

    /// Releases the permit through the run state's CAS and removes the
    /// local entries that still belong to this execution.
    pub(super) fn release_local(&self, agent_type: &str, deadline: i64, run_state: &Arc<RunState>) {
        if run_state.try_release() {
            self.limiter.release();
        } else {
            self.metrics.record_cas_contention();
        }

        {
            let mut run_states = self.run_states.lock();
            if run_states
                .get(agent_type)
                .is_some_and(|current| Arc::ptr_eq(current, run_state))
            {
                run_states.remove(agent_type);
                self.executions.lock().remove(agent_type);
            }
        }
        {
            let mut active = self.active.lock();
            if active.get(agent_type) == Some(&deadline) {
                active.remove(agent_type);
            }
        }
        self.metrics
            .update_agent_counts(self.registered_count(), self.active_count());
    }

    /// Pool rejection: return the agent to waiting (only if we still own
    /// it) and release the permit.
    async fn requeue_rejected(&self, agent_type: &str, deadline: i64, run_state: &Arc<RunState>) {
        let score = self.clock.score(0);
        match self
            .store
            .move_agent_conditional(agent_type, deadline, score)
            .await
        {
            Ok(true) => debug!(agent = %agent_type, "Requeued rejected agent"),
            Ok(false) => debug!(agent = %agent_type, "Rejected agent no longer owned; left in place"),
            Err(e) => {
                warn!(agent = %agent_type, error = %e, "Failed to requeue rejected agent");
            }
        }
        self.release_local(agent_type, deadline, run_state);
    }

    /// Arms a timer that aborts the execution at
    /// `deadline×1000 + zombie threshold`.
    fn arm_deadman(self: &Arc<Self>, agent_type: &str, deadline: i64, run_state: &Arc<RunState>) {
        let threshold_ms = self.zombie_threshold_ms(agent_type);
        let delay_ms = (deadline * 1000 + threshold_ms - self.clock.now_ms()).max(0) as u64;
        let service = Arc::downgrade(self);
        let owned = agent_type.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(service) = service.upgrade() {
                warn!(agent = %owned, deadline, "Dead-man timer fired; cancelling execution");
                service.abort_execution(&owned);
            }
        });
        run_state.arm_deadman(timer.abort_handle());
    }

    /// Grace period past the deadline before an execution counts as a
    /// zombie.
    pub fn zombie_threshold_ms(&self, agent_type: &str) -> i64 {
        let zombie = &self.config.zombie_cleanup;
        if self.patterns.is_exceptional(agent_type) {
            zombie.exceptional_agents.threshold_ms
        } else {
            zombie.threshold_ms
        }
    }

    pub(super) fn enqueue_recovery(&self, entry: RecoveryEntry) {
        if self.is_shutting_down() {
            debug!(agent = %entry.agent_type, "Shutting down; not queueing recovery");
            return;
        }
        let mut queue = self.recovery.lock();
        if queue.len() >= RECOVERY_QUEUE_CAPACITY {
            drop(queue);
            warn!(agent = %entry.agent_type, "Recovery queue full; dropping entry");
            self.metrics.record_recovery("overflow");
            return;
        }
        queue.push_back(entry);
        drop(queue);
        self.metrics.record_recovery("queued");
    }

    pub fn recovery_queue_depth(&self) -> usize {
        self.recovery.lock().len()
    }

    /// Replays a snapshot of the recovery queue once.
    pub(super) async fn process_recovery_queue(&self) {
        let pending: Vec<RecoveryEntry> = self.recovery.lock().drain(..).collect();
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Processing recovery queue");

        for mut entry in pending {
            if !self.is_registered(&entry.agent_type) {
                self.metrics.record_recovery("discarded");
                continue;
            }
            let score = self.clock.score(entry.offset_ms);
            let result = match entry.op {
                RecoveryOp::Add => self.store.add_agent(&entry.agent_type, score).await.map(|_| ()),
                RecoveryOp::Reschedule => self
                    .store
                    .reschedule_agent(&entry.agent_type, score)
                    .await
                    .map(|_| ()),
            };
            match result {
                Ok(()) => {
                    info!(agent = %entry.agent_type, "Recovered queued store write");
                    self.metrics.record_recovery("recovered");
                }
                Err(e) => {
                    entry.attempts += 1;
                    if entry.attempts >= RECOVERY_MAX_ATTEMPTS {
                        warn!(
                            agent = %entry.agent_type,
                            attempts = entry.attempts,
                            error = %e,
                            "Dropping recovery entry; periodic repopulate will restore it"
                        );
                        self.metrics.record_recovery("dropped");
                    } else {
                        self.enqueue_recovery(entry);
                    }
                }
            }
        }
    }

    /// Marks the service as shutting down, aborts every execution and moves
    /// each owned working entry back to waiting at the shutdown offset.
    /// Returns the number of entries requeued.
    pub async fn shutdown_requeue(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);

        let handles: Vec<_> = self.executions.lock().values().cloned().collect();
        if !handles.is_empty() {
            for handle in &handles {
                handle.abort();
            }
            tokio::time::sleep(SHUTDOWN_ABORT_GRACE).await;
        }

        let mut requeued = 0;
        for (agent_type, deadline) in self.active_snapshot() {
            let score = self.clock.score(self.shutdown_offset_ms(&agent_type, deadline));
            match self
                .store
                .move_agent_conditional(&agent_type, deadline, score)
                .await
            {
                Ok(true) => requeued += 1,
                Ok(false) => {}
                Err(e) => warn!(agent = %agent_type, error = %e, "Failed to requeue agent at shutdown"),
            }
            self.force_release_current(&agent_type, deadline);
        }
        info!(requeued, aborted = handles.len(), "Requeued active agents for shutdown");
        requeued
    }
}

fn join_error_to_agent_error(e: JoinError) -> AgentError {
    if e.is_cancelled() {
        AgentError::interrupted("execution cancelled")
    } else {
        AgentError::other(format!("execution panicked: {}", e))
    }
}
