//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by agent-scheduler and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all scheduler metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Duration of one orchestrator tick.
pub static RUN_CYCLE_SECONDS: OnceLock<Histogram> = OnceLock::new();

/// Ticks that ended in an error or panic.
pub static RUN_FAILURES: OnceLock<IntCounter> = OnceLock::new();

/// Candidates considered for acquisition.
pub static ACQUIRE_ATTEMPTS: OnceLock<IntCounter> = OnceLock::new();

/// Agents acquired, labeled by mode (batch/individual).
pub static ACQUIRE_ACQUIRED: OnceLock<IntCounterVec> = OnceLock::new();

/// Acquisition latency, labeled by mode.
pub static ACQUIRE_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

/// Acquired agents the execution pool rejected.
pub static ACQUIRE_SUBMISSION_FAILURES: OnceLock<IntCounter> = OnceLock::new();

/// Batch acquisitions that fell back to individual acquisition.
pub static ACQUIRE_BATCH_FALLBACKS: OnceLock<IntCounter> = OnceLock::new();

/// Cycles where a backlog existed but nothing local was ready.
pub static ACQUIRE_STALL_DETECTED: OnceLock<IntCounter> = OnceLock::new();

/// Circuit breaker transitions and blocked calls, labeled by breaker and event.
pub static CIRCUIT_BREAKER_EVENTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Validation findings, labeled by kind.
pub static VALIDATION: OnceLock<IntCounterVec> = OnceLock::new();

pub static REPOPULATE_SECONDS: OnceLock<Histogram> = OnceLock::new();
pub static REPOPULATE_ADDED: OnceLock<IntCounter> = OnceLock::new();
pub static REPOPULATE_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Cleanup pass duration, labeled by kind (zombie/orphan/reconcile).
pub static CLEANUP_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

/// Agents cleaned, labeled by kind.
pub static CLEANUP_CLEANED: OnceLock<IntCounterVec> = OnceLock::new();

/// Cleanup submissions skipped because a pass was still running.
pub static CLEANUP_SKIPPED: OnceLock<IntCounterVec> = OnceLock::new();

/// Cleanup passes force-cancelled for exceeding their budget.
pub static CLEANUP_TIMEOUTS: OnceLock<IntCounterVec> = OnceLock::new();

pub static SCRIPT_EVALS: OnceLock<IntCounterVec> = OnceLock::new();
pub static SCRIPT_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();
pub static SCRIPT_LATENCY_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static SCRIPT_RELOADS: OnceLock<IntCounter> = OnceLock::new();

/// Completion reschedules that failed at the store.
pub static RESCHEDULE_FAILURES: OnceLock<IntCounter> = OnceLock::new();

/// Permit releases that lost the CAS to another path.
pub static CAS_CONTENTION: OnceLock<IntCounter> = OnceLock::new();

pub static SCHEDULE_RETRY_EXHAUSTED: OnceLock<IntCounter> = OnceLock::new();

/// Recovery queue outcomes (recovered/retry/dropped).
pub static SCHEDULE_RECOVERY: OnceLock<CounterVec> = OnceLock::new();

pub static ACTIVE_AGENTS: OnceLock<IntGauge> = OnceLock::new();
pub static REGISTERED_AGENTS: OnceLock<IntGauge> = OnceLock::new();
pub static READY_AGENTS: OnceLock<IntGauge> = OnceLock::new();
pub static OLDEST_OVERDUE_SECONDS: OnceLock<Gauge> = OnceLock::new();

/// Permits held minus active agents; non-zero means bookkeeping drift.
pub static PERMIT_MISMATCH: OnceLock<IntGauge> = OnceLock::new();

const PREFIX: &str = "agent_scheduler";

fn name(suffix: &str) -> String {
    format!("{}_{}", PREFIX, suffix)
}

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are harmless: the statics keep the
/// first set of instances.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Tick metrics
    let run_cycle_seconds = Histogram::with_opts(
        HistogramOpts::new(name("run_cycle_seconds"), "Duration of one scheduler tick")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )?;
    let run_failures = IntCounter::new(name("run_failures_total"), "Ticks that failed")?;

    // Acquisition metrics
    let acquire_attempts = IntCounter::new(
        name("acquire_attempts_total"),
        "Candidates considered for acquisition",
    )?;
    let acquire_acquired = IntCounterVec::new(
        Opts::new(name("acquire_acquired_total"), "Agents acquired"),
        &["mode"],
    )?;
    let acquire_seconds = HistogramVec::new(
        HistogramOpts::new(name("acquire_seconds"), "Acquisition latency")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        &["mode"],
    )?;
    let acquire_submission_failures = IntCounter::new(
        name("acquire_submission_failures_total"),
        "Acquired agents rejected by the execution pool",
    )?;
    let acquire_batch_fallbacks = IntCounter::new(
        name("acquire_batch_fallbacks_total"),
        "Batch acquisitions that fell back to individual mode",
    )?;
    let acquire_stall_detected = IntCounter::new(
        name("acquire_stall_detected_total"),
        "Cycles with a backlog but no locally ready agents",
    )?;

    let circuit_breaker_events = IntCounterVec::new(
        Opts::new(
            name("circuit_breaker_events_total"),
            "Circuit breaker trips, recoveries and blocked calls",
        ),
        &["breaker", "event"],
    )?;
    let validation = IntCounterVec::new(
        Opts::new(name("validation_total"), "Validation findings"),
        &["kind"],
    )?;

    // Repopulate metrics
    let repopulate_seconds = Histogram::with_opts(
        HistogramOpts::new(name("repopulate_seconds"), "Repopulate duration")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )?;
    let repopulate_added = IntCounter::new(
        name("repopulate_added_total"),
        "Agents added to the waiting set by repopulate",
    )?;
    let repopulate_errors = IntCounterVec::new(
        Opts::new(name("repopulate_errors_total"), "Repopulate failures"),
        &["reason"],
    )?;

    // Cleanup metrics
    let cleanup_seconds = HistogramVec::new(
        HistogramOpts::new(name("cleanup_seconds"), "Cleanup pass duration")
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["kind"],
    )?;
    let cleanup_cleaned = IntCounterVec::new(
        Opts::new(name("cleanup_cleaned_total"), "Agents cleaned"),
        &["kind"],
    )?;
    let cleanup_skipped = IntCounterVec::new(
        Opts::new(
            name("cleanup_skipped_total"),
            "Cleanup submissions skipped while a pass was running",
        ),
        &["kind"],
    )?;
    let cleanup_timeouts = IntCounterVec::new(
        Opts::new(
            name("cleanup_timeouts_total"),
            "Cleanup passes cancelled after exceeding their budget",
        ),
        &["kind"],
    )?;

    // Script metrics
    let script_evals = IntCounterVec::new(
        Opts::new(name("script_evals_total"), "Lua script evaluations"),
        &["script"],
    )?;
    let script_errors = IntCounterVec::new(
        Opts::new(name("script_errors_total"), "Lua script failures"),
        &["script"],
    )?;
    let script_latency_seconds = HistogramVec::new(
        HistogramOpts::new(name("script_latency_seconds"), "Lua script latency")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        &["script"],
    )?;
    let script_reloads = IntCounter::new(
        name("script_reloads_total"),
        "Script cache reloads after NOSCRIPT",
    )?;

    let reschedule_failures = IntCounter::new(
        name("reschedule_failures_total"),
        "Completion reschedules that failed",
    )?;
    let cas_contention = IntCounter::new(
        name("cas_contention_total"),
        "Permit releases lost to a competing path",
    )?;
    let schedule_retry_exhausted = IntCounter::new(
        name("schedule_retry_exhausted_total"),
        "Store writes that exhausted their retries",
    )?;
    let schedule_recovery = CounterVec::new(
        Opts::new(name("schedule_recovery_total"), "Recovery queue outcomes"),
        &["outcome"],
    )?;

    // Gauges
    let active_agents = IntGauge::new(name("active_agents"), "Locally executing agents")?;
    let registered_agents = IntGauge::new(name("registered_agents"), "Locally registered agents")?;
    let ready_agents = IntGauge::new(name("ready_agents"), "Locally eligible overdue agents")?;
    let oldest_overdue_seconds = Gauge::new(
        name("oldest_overdue_seconds"),
        "Age of the oldest eligible agent",
    )?;
    let permit_mismatch = IntGauge::new(
        name("permit_mismatch"),
        "Permits held minus active agents",
    )?;

    registry.register(Box::new(run_cycle_seconds.clone()))?;
    registry.register(Box::new(run_failures.clone()))?;
    registry.register(Box::new(acquire_attempts.clone()))?;
    registry.register(Box::new(acquire_acquired.clone()))?;
    registry.register(Box::new(acquire_seconds.clone()))?;
    registry.register(Box::new(acquire_submission_failures.clone()))?;
    registry.register(Box::new(acquire_batch_fallbacks.clone()))?;
    registry.register(Box::new(acquire_stall_detected.clone()))?;
    registry.register(Box::new(circuit_breaker_events.clone()))?;
    registry.register(Box::new(validation.clone()))?;
    registry.register(Box::new(repopulate_seconds.clone()))?;
    registry.register(Box::new(repopulate_added.clone()))?;
    registry.register(Box::new(repopulate_errors.clone()))?;
    registry.register(Box::new(cleanup_seconds.clone()))?;
    registry.register(Box::new(cleanup_cleaned.clone()))?;
    registry.register(Box::new(cleanup_skipped.clone()))?;
    registry.register(Box::new(cleanup_timeouts.clone()))?;
    registry.register(Box::new(script_evals.clone()))?;
    registry.register(Box::new(script_errors.clone()))?;
    registry.register(Box::new(script_latency_seconds.clone()))?;
    registry.register(Box::new(script_reloads.clone()))?;
    registry.register(Box::new(reschedule_failures.clone()))?;
    registry.register(Box::new(cas_contention.clone()))?;
    registry.register(Box::new(schedule_retry_exhausted.clone()))?;
    registry.register(Box::new(schedule_recovery.clone()))?;
    registry.register(Box::new(active_agents.clone()))?;
    registry.register(Box::new(registered_agents.clone()))?;
    registry.register(Box::new(ready_agents.clone()))?;
    registry.register(Box::new(oldest_overdue_seconds.clone()))?;
    registry.register(Box::new(permit_mismatch.clone()))?;

    // If any of these fail, metrics were already initialized concurrently
    let _ = REGISTRY.set(registry);
    let _ = RUN_CYCLE_SECONDS.set(run_cycle_seconds);
    let _ = RUN_FAILURES.set(run_failures);
    let _ = ACQUIRE_ATTEMPTS.set(acquire_attempts);
    let _ = ACQUIRE_ACQUIRED.set(acquire_acquired);
    let _ = ACQUIRE_SECONDS.set(acquire_seconds);
    let _ = ACQUIRE_SUBMISSION_FAILURES.set(acquire_submission_failures);
    let _ = ACQUIRE_BATCH_FALLBACKS.set(acquire_batch_fallbacks);
    let _ = ACQUIRE_STALL_DETECTED.set(acquire_stall_detected);
    let _ = CIRCUIT_BREAKER_EVENTS.set(circuit_breaker_events);
    let _ = VALIDATION.set(validation);
    let _ = REPOPULATE_SECONDS.set(repopulate_seconds);
    let _ = REPOPULATE_ADDED.set(repopulate_added);
    let _ = REPOPULATE_ERRORS.set(repopulate_errors);
    let _ = CLEANUP_SECONDS.set(cleanup_seconds);
    let _ = CLEANUP_CLEANED.set(cleanup_cleaned);
    let _ = CLEANUP_SKIPPED.set(cleanup_skipped);
    let _ = CLEANUP_TIMEOUTS.set(cleanup_timeouts);
    let _ = SCRIPT_EVALS.set(script_evals);
    let _ = SCRIPT_ERRORS.set(script_errors);
    let _ = SCRIPT_LATENCY_SECONDS.set(script_latency_seconds);
    let _ = SCRIPT_RELOADS.set(script_reloads);
    let _ = RESCHEDULE_FAILURES.set(reschedule_failures);
    let _ = CAS_CONTENTION.set(cas_contention);
    let _ = SCHEDULE_RETRY_EXHAUSTED.set(schedule_retry_exhausted);
    let _ = SCHEDULE_RECOVERY.set(schedule_recovery);
    let _ = ACTIVE_AGENTS.set(active_agents);
    let _ = REGISTERED_AGENTS.set(registered_agents);
    let _ = READY_AGENTS.set(ready_agents);
    let _ = OLDEST_OVERDUE_SECONDS.set(oldest_overdue_seconds);
    let _ = PERMIT_MISMATCH.set(permit_mismatch);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
