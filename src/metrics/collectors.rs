//! High-level recording interface for scheduler metrics.
//!
//! [`SchedulerMetrics`] wraps the raw Prometheus statics so call sites never
//! deal with label arrays or initialization order. Every method is a no-op
//! until [`init_metrics`](super::init_metrics) has run, which keeps library
//! users who don't export metrics free of any setup.

use std::time::Duration;

use super::prometheus::{
    ACQUIRE_ACQUIRED, ACQUIRE_ATTEMPTS, ACQUIRE_BATCH_FALLBACKS, ACQUIRE_SECONDS,
    ACQUIRE_STALL_DETECTED, ACQUIRE_SUBMISSION_FAILURES, ACTIVE_AGENTS, CAS_CONTENTION,
    CIRCUIT_BREAKER_EVENTS, CLEANUP_CLEANED, CLEANUP_SECONDS, CLEANUP_SKIPPED, CLEANUP_TIMEOUTS,
    OLDEST_OVERDUE_SECONDS, PERMIT_MISMATCH, READY_AGENTS, REGISTERED_AGENTS, REPOPULATE_ADDED,
    REPOPULATE_ERRORS, REPOPULATE_SECONDS, RESCHEDULE_FAILURES, RUN_CYCLE_SECONDS, RUN_FAILURES,
    SCHEDULE_RECOVERY, SCHEDULE_RETRY_EXHAUSTED, SCRIPT_ERRORS, SCRIPT_EVALS,
    SCRIPT_LATENCY_SECONDS, SCRIPT_RELOADS, VALIDATION,
};

/// Acquisition path that produced an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    Batch,
    Individual,
}

impl AcquireMode {
    fn label(self) -> &'static str {
        match self {
            AcquireMode::Batch => "batch",
            AcquireMode::Individual => "individual",
        }
    }
}

/// Background pass kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupKind {
    Zombie,
    Orphan,
    Reconcile,
}

impl CleanupKind {
    pub fn label(self) -> &'static str {
        match self {
            CleanupKind::Zombie => "zombie",
            CleanupKind::Orphan => "orphan",
            CleanupKind::Reconcile => "reconcile",
        }
    }
}

/// Recorder for scheduler metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_run_cycle(&self, elapsed: Duration) {
        if let Some(histogram) = RUN_CYCLE_SECONDS.get() {
            histogram.observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_run_failure(&self) {
        if let Some(counter) = RUN_FAILURES.get() {
            counter.inc();
        }
    }

    pub fn record_acquire_attempts(&self, attempts: usize) {
        if let Some(counter) = ACQUIRE_ATTEMPTS.get() {
            counter.inc_by(attempts as u64);
        }
    }

    pub fn record_acquired(&self, mode: AcquireMode, acquired: usize, elapsed: Duration) {
        if let Some(counter) = ACQUIRE_ACQUIRED.get() {
            counter
                .with_label_values(&[mode.label()])
                .inc_by(acquired as u64);
        }
        if let Some(histogram) = ACQUIRE_SECONDS.get() {
            histogram
                .with_label_values(&[mode.label()])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_submission_failure(&self) {
        if let Some(counter) = ACQUIRE_SUBMISSION_FAILURES.get() {
            counter.inc();
        }
    }

    pub fn record_batch_fallback(&self) {
        if let Some(counter) = ACQUIRE_BATCH_FALLBACKS.get() {
            counter.inc();
        }
    }

    pub fn record_stall_detected(&self) {
        if let Some(counter) = ACQUIRE_STALL_DETECTED.get() {
            counter.inc();
        }
    }

    /// `event` is one of `trip`, `recovery`, `blocked`.
    pub fn record_breaker_event(&self, breaker: &str, event: &str) {
        if let Some(counter) = CIRCUIT_BREAKER_EVENTS.get() {
            counter.with_label_values(&[breaker, event]).inc();
        }
    }

    pub fn record_validation(&self, kind: &str) {
        if let Some(counter) = VALIDATION.get() {
            counter.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_repopulate(&self, elapsed: Duration, added: usize) {
        if let Some(histogram) = REPOPULATE_SECONDS.get() {
            histogram.observe(elapsed.as_secs_f64());
        }
        if let Some(counter) = REPOPULATE_ADDED.get() {
            counter.inc_by(added as u64);
        }
    }

    pub fn record_repopulate_error(&self, reason: &str) {
        if let Some(counter) = REPOPULATE_ERRORS.get() {
            counter.with_label_values(&[reason]).inc();
        }
    }

    pub fn record_cleanup(&self, kind: CleanupKind, elapsed: Duration, cleaned: usize) {
        if let Some(histogram) = CLEANUP_SECONDS.get() {
            histogram
                .with_label_values(&[kind.label()])
                .observe(elapsed.as_secs_f64());
        }
        if let Some(counter) = CLEANUP_CLEANED.get() {
            counter
                .with_label_values(&[kind.label()])
                .inc_by(cleaned as u64);
        }
    }

    pub fn record_cleanup_skipped(&self, kind: CleanupKind) {
        if let Some(counter) = CLEANUP_SKIPPED.get() {
            counter.with_label_values(&[kind.label()]).inc();
        }
    }

    pub fn record_cleanup_timeout(&self, kind: CleanupKind) {
        if let Some(counter) = CLEANUP_TIMEOUTS.get() {
            counter.with_label_values(&[kind.label()]).inc();
        }
    }

    pub fn record_script_eval(&self, script: &str, elapsed: Duration) {
        if let Some(counter) = SCRIPT_EVALS.get() {
            counter.with_label_values(&[script]).inc();
        }
        if let Some(histogram) = SCRIPT_LATENCY_SECONDS.get() {
            histogram
                .with_label_values(&[script])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_script_error(&self, script: &str) {
        if let Some(counter) = SCRIPT_ERRORS.get() {
            counter.with_label_values(&[script]).inc();
        }
    }

    pub fn record_script_reload(&self) {
        if let Some(counter) = SCRIPT_RELOADS.get() {
            counter.inc();
        }
    }

    pub fn record_reschedule_failure(&self) {
        if let Some(counter) = RESCHEDULE_FAILURES.get() {
            counter.inc();
        }
    }

    pub fn record_cas_contention(&self) {
        if let Some(counter) = CAS_CONTENTION.get() {
            counter.inc();
        }
    }

    pub fn record_retry_exhausted(&self) {
        if let Some(counter) = SCHEDULE_RETRY_EXHAUSTED.get() {
            counter.inc();
        }
    }

    /// `outcome` is one of `recovered`, `retry`, `dropped`.
    pub fn record_recovery(&self, outcome: &str) {
        if let Some(counter) = SCHEDULE_RECOVERY.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }

    pub fn update_agent_counts(&self, registered: usize, active: usize) {
        if let Some(gauge) = REGISTERED_AGENTS.get() {
            gauge.set(registered as i64);
        }
        if let Some(gauge) = ACTIVE_AGENTS.get() {
            gauge.set(active as i64);
        }
    }

    pub fn update_backlog(&self, ready: usize, oldest_overdue_seconds: i64) {
        if let Some(gauge) = READY_AGENTS.get() {
            gauge.set(ready as i64);
        }
        if let Some(gauge) = OLDEST_OVERDUE_SECONDS.get() {
            gauge.set(oldest_overdue_seconds as f64);
        }
    }

    pub fn update_permit_mismatch(&self, mismatch: i64) {
        if let Some(gauge) = PERMIT_MISMATCH.get() {
            gauge.set(mismatch);
        }
    }
}
