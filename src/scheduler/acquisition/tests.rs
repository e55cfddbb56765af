use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use async_trait::async_trait;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::Semaphore;

use super::*;
use crate::scheduler::agent::{AgentError, NoopInstrumentation, OwnAllShards};
use crate::scheduler::clock::ManualClock;
use crate::scheduler::store::{InMemoryAgentStore, SetKind};
use crate::scheduler::zombie::ZombieCleanupService;

const NOW_MS: i64 = 1_700_000_000_000;
const NOW_S: i64 = NOW_MS / 1000;

/// Blocks each run until the test hands out a permit.
struct GatedExecution {
    gate: Arc<Semaphore>,
    runs: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl AgentExecution for GatedExecution {
    async fn execute(&self, _agent: &Agent) -> Result<(), AgentError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| AgentError::interrupted("gate closed"))?;
        permit.forget();
        if self.fail {
            Err(AgentError::other("boom"))
        } else {
            Ok(())
        }
    }
}

/// Completes immediately.
struct InstantExecution;

#[async_trait]
impl AgentExecution for InstantExecution {
    async fn execute(&self, _agent: &Agent) -> Result<(), AgentError> {
        Ok(())
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryAgentStore>,
    service: Arc<AcquisitionService>,
}

async fn harness(config: SchedulerConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let store = Arc::new(InMemoryAgentStore::new(clock.clone()));
    store.initialize().await.expect("initialize");
    let service = AcquisitionService::new(
        &config,
        store.clone(),
        Arc::new(OwnAllShards),
        clock.clone(),
    )
    .expect("service");
    Harness {
        clock,
        store,
        service: Arc::new(service),
    }
}

fn agent(name: &str, interval_s: u64, timeout_s: u64) -> Agent {
    Agent::new(
        name,
        "test",
        Duration::from_secs(interval_s),
        Duration::from_secs(timeout_s),
    )
}

fn instant(agent: Agent) -> Registration {
    Registration::new(agent, Arc::new(InstantExecution), Arc::new(NoopInstrumentation))
}

fn gated(agent: Agent, gate: &Arc<Semaphore>, runs: &Arc<AtomicUsize>) -> Registration {
    Registration::new(
        agent,
        Arc::new(GatedExecution {
            gate: Arc::clone(gate),
            runs: Arc::clone(runs),
            fail: false,
        }),
        Arc::new(NoopInstrumentation),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_register_adds_to_waiting() {
    let h = harness(SchedulerConfig::default()).await;
    h.service.register(instant(agent("a", 10, 5))).await;

    assert!(h.service.is_registered("a"));
    assert_eq!(h.store.peek(SetKind::Waiting, "a"), Some(NOW_S as f64));

    h.service.unregister("a", false).await;
    assert!(!h.service.is_registered("a"));
    assert!(h.store.peek(SetKind::Waiting, "a").is_some());

    h.service.register(instant(agent("a", 10, 5))).await;
    h.service.unregister("a", true).await;
    assert_eq!(h.store.peek(SetKind::Waiting, "a"), None);
}

#[tokio::test]
async fn test_acquire_then_complete_preserves_cadence() {
    let config = SchedulerConfig::default().with_max_concurrent_agents(1);
    let h = harness(config).await;
    let gate = Arc::new(Semaphore::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    h.service.register(gated(agent("a", 10, 5), &gate, &runs)).await;

    assert_eq!(h.service.saturate_pool().await, 1);
    assert!(h.service.is_active("a"));
    assert_eq!(h.store.peek(SetKind::Working, "a"), Some((NOW_S + 5) as f64));
    assert_eq!(h.service.limiter().available(), Some(0));

    wait_until(|| runs.load(Ordering::SeqCst) == 1).await;
    h.clock.advance_secs(2);
    gate.add_permits(1);
    wait_until(|| !h.service.is_active("a")).await;

    assert_eq!(h.store.peek(SetKind::Working, "a"), None);
    assert_eq!(h.store.peek(SetKind::Waiting, "a"), Some((NOW_S + 10) as f64));
    assert_eq!(h.service.limiter().available(), Some(1));
    assert_eq!(h.service.stats().completed_total, 1);
}

#[tokio::test]
async fn test_failure_reschedules_with_error_interval() {
    let mut config = SchedulerConfig::default().with_max_concurrent_agents(1);
    config.jitter.failure_backoff_ratio = 0.0;
    let h = harness(config).await;
    let gate = Arc::new(Semaphore::new(1));
    let runs = Arc::new(AtomicUsize::new(0));
    let failing = Registration::new(
        agent("a", 10, 5).with_error_interval(Duration::from_secs(60)),
        Arc::new(GatedExecution {
            gate,
            runs,
            fail: true,
        }),
        Arc::new(NoopInstrumentation),
    );
    h.service.register(failing).await;

    assert_eq!(h.service.saturate_pool().await, 1);
    wait_until(|| !h.service.is_active("a")).await;

    assert_eq!(h.store.peek(SetKind::Waiting, "a"), Some((NOW_S + 60) as f64));
    assert_eq!(h.service.stats().failed_total, 1);
    assert_eq!(h.service.limiter().available(), Some(1));
}

#[tokio::test]
async fn test_cadence_offset() {
    let h = harness(SchedulerConfig::default()).await;
    assert_eq!(h.service.cadence_offset_ms(NOW_S + 5, 5, 10_000), Some(10_000));
    assert_eq!(h.service.cadence_offset_ms(0, 5, 10_000), None);

    h.clock.advance_secs(30);
    assert_eq!(h.service.cadence_offset_ms(NOW_S + 5, 5, 10_000), Some(0));

    h.clock.set(NOW_MS + 2_500);
    assert_eq!(h.service.cadence_offset_ms(NOW_S + 5, 5, 10_000), Some(8_000));
}

#[tokio::test]
async fn test_ineligible_agents_are_not_acquired() {
    let config = SchedulerConfig::default().with_disabled_pattern("^off-.*");
    let h = harness(config).await;
    h.service.register(instant(agent("off-1", 10, 5))).await;
    h.store.add_agent("stranger", NOW_S).await.expect("add");

    assert_eq!(h.service.saturate_pool().await, 0);
    assert!(h.store.peek(SetKind::Waiting, "off-1").is_some());
    assert!(h.store.peek(SetKind::Waiting, "stranger").is_some());
}

#[tokio::test]
async fn test_batch_fallback_never_leaks_permits() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for round in 0..20 {
        let agents = rng.random_range(1..=20usize);
        let max = rng.random_range(1..=10i64);
        let config = SchedulerConfig::default()
            .with_max_concurrent_agents(max)
            .with_batch_size(rng.random_range(0..=6usize));
        let h = harness(config).await;
        let gate = Arc::new(Semaphore::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        for i in 0..agents {
            h.service
                .register(gated(agent(&format!("agent-{i}"), 10, 5), &gate, &runs))
                .await;
        }

        h.store.fail_next("acquire_agents", 1);
        let acquired = h.service.saturate_pool().await;
        let expected = agents.min(max as usize);
        assert_eq!(acquired, expected, "round {round}");
        assert_eq!(h.service.limiter().held(), expected, "round {round}");
        assert_eq!(h.service.active_count(), expected, "round {round}");
        assert!(h.store.overlap().is_empty());

        gate.add_permits(agents);
        wait_until(|| h.service.active_count() == 0).await;
        assert_eq!(h.service.limiter().held(), 0, "round {round}");
        gate.close();
    }
}

#[tokio::test]
async fn test_pool_rejection_requeues_and_releases() {
    let mut config = SchedulerConfig::default().with_max_concurrent_agents(5);
    config.pool_capacity = 1;
    let h = harness(config).await;
    let gate = Arc::new(Semaphore::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    h.service.register(gated(agent("a", 10, 5), &gate, &runs)).await;
    h.service.register(gated(agent("b", 10, 5), &gate, &runs)).await;

    assert_eq!(h.service.saturate_pool().await, 1);
    assert_eq!(h.service.active_count(), 1);
    assert_eq!(h.service.limiter().held(), 1);
    assert_eq!(h.service.stats().submission_failures, 1);

    let (running, rejected) = if h.service.is_active("a") { ("a", "b") } else { ("b", "a") };
    assert!(h.store.peek(SetKind::Working, running).is_some());
    assert_eq!(h.store.peek(SetKind::Waiting, rejected), Some(NOW_S as f64));

    gate.add_permits(1);
    wait_until(|| h.service.active_count() == 0).await;
    assert_eq!(h.service.limiter().held(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_registration_is_recovered() {
    let mut config = SchedulerConfig::default();
    config.zombie_cleanup.enabled = false;
    let h = harness(config).await;

    h.store.fail_next("add_agent", 3);
    h.service.register(instant(agent("a", 10, 5))).await;
    assert!(h.service.is_registered("a"));
    assert_eq!(h.service.recovery_queue_depth(), 1);
    assert_eq!(h.store.peek(SetKind::Waiting, "a"), None);

    // Three failed writes open the store breaker; wait out its cooldown.
    assert_eq!(h.service.store_breaker().state(), BreakerState::Open);
    h.clock.advance_secs(11);
    h.service.saturate_pool().await;
    assert_eq!(h.service.recovery_queue_depth(), 0);
    let present = h.store.peek(SetKind::Waiting, "a").is_some()
        || h.store.peek(SetKind::Working, "a").is_some();
    assert!(present);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_discards_unregistered_agents() {
    let h = harness(SchedulerConfig::default()).await;
    h.store.fail_next("add_agent", 3);
    h.service.register(instant(agent("a", 10, 5))).await;
    assert_eq!(h.service.recovery_queue_depth(), 1);

    h.service.unregister("a", false).await;
    h.service.process_recovery_queue().await;
    assert_eq!(h.service.recovery_queue_depth(), 0);
    assert_eq!(h.store.peek(SetKind::Waiting, "a"), None);
}

#[tokio::test]
async fn test_repopulate_falls_back_through_presence_and_scores() {
    let h = harness(SchedulerConfig::default()).await;
    for name in ["a", "b", "c"] {
        h.service.register(instant(agent(name, 10, 5))).await;
    }

    h.store.remove_agent("b").await.expect("remove");
    h.store.fail_next("presence", 1);
    assert_eq!(h.service.repopulate().await.expect("repopulate"), 1);
    assert!(h.store.peek(SetKind::Waiting, "b").is_some());

    h.store.remove_agent("c").await.expect("remove");
    h.store.fail_next("presence", 1);
    h.store.fail_next("scores", 1);
    assert_eq!(h.service.repopulate().await.expect("repopulate"), 1);
    assert!(h.store.peek(SetKind::Waiting, "c").is_some());

    assert_eq!(h.service.repopulate().await.expect("repopulate"), 0);
}

#[tokio::test]
async fn test_repopulate_never_touches_working_agents() {
    let config = SchedulerConfig::default().with_max_concurrent_agents(1);
    let h = harness(config).await;
    let gate = Arc::new(Semaphore::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    h.service.register(gated(agent("a", 10, 5), &gate, &runs)).await;
    assert_eq!(h.service.saturate_pool().await, 1);

    assert_eq!(h.service.repopulate().await.expect("repopulate"), 0);
    assert!(h.store.overlap().is_empty());
    assert_eq!(h.store.peek(SetKind::Working, "a"), Some((NOW_S + 5) as f64));
    gate.add_permits(1);
}

#[tokio::test]
async fn test_force_release_returns_permit_once() {
    let config = SchedulerConfig::default().with_max_concurrent_agents(2);
    let h = harness(config).await;
    let gate = Arc::new(Semaphore::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    h.service.register(gated(agent("a", 10, 5), &gate, &runs)).await;
    assert_eq!(h.service.saturate_pool().await, 1);
    assert_eq!(h.service.limiter().held(), 1);

    assert!(h.service.force_release("a"));
    assert!(!h.service.force_release("a"));
    assert_eq!(h.service.limiter().held(), 0);

    // The cancelled execution's supervisor still runs, but its CAS loses.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.service.limiter().held(), 0);
    assert!(h.store.overlap().is_empty());
}

#[tokio::test]
async fn test_shutdown_requeue_moves_working_back() {
    let config = SchedulerConfig::default().with_max_concurrent_agents(3);
    let h = harness(config).await;
    let gate = Arc::new(Semaphore::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    for name in ["a", "b"] {
        h.service.register(gated(agent(name, 10, 5), &gate, &runs)).await;
    }
    assert_eq!(h.service.saturate_pool().await, 2);

    h.service.shutdown_requeue().await;
    assert!(h.service.is_shutting_down());
    assert_eq!(h.service.active_count(), 0);
    assert_eq!(h.service.limiter().held(), 0);
    assert!(h.store.snapshot(SetKind::Working).is_empty());
    assert_eq!(h.store.snapshot(SetKind::Waiting).len(), 2);
}

#[tokio::test]
async fn test_inconsistent_active_detects_unregistered() {
    let config = SchedulerConfig::default().with_max_concurrent_agents(1);
    let h = harness(config).await;
    let gate = Arc::new(Semaphore::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    h.service.register(gated(agent("a", 10, 5), &gate, &runs)).await;
    assert_eq!(h.service.saturate_pool().await, 1);
    assert!(h.service.inconsistent_active().is_empty());

    h.service.registry.lock().remove("a");
    assert_eq!(h.service.inconsistent_active(), vec!["a".to_string()]);
    gate.add_permits(1);
}

#[tokio::test]
async fn test_zombie_pass_spares_reacquired_execution() {
    let config = SchedulerConfig::default().with_max_concurrent_agents(1);
    let h = harness(config).await;
    let gate = Arc::new(Semaphore::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    h.service.register(gated(agent("a", 10, 5), &gate, &runs)).await;
    assert_eq!(h.service.saturate_pool().await, 1);
    let stale = h.service.active_snapshot();
    assert_eq!(stale, vec![("a".to_string(), NOW_S + 5)]);

    // The first run finishes and the agent is acquired again later.
    wait_until(|| runs.load(Ordering::SeqCst) == 1).await;
    gate.add_permits(1);
    wait_until(|| !h.service.is_active("a")).await;
    h.clock.advance_secs(40);
    assert_eq!(h.service.saturate_pool().await, 1);
    wait_until(|| runs.load(Ordering::SeqCst) == 2).await;
    let fresh = NOW_S + 45;
    assert_eq!(h.service.active_snapshot(), vec![("a".to_string(), fresh)]);

    let zombies = ZombieCleanupService::new(Arc::clone(&h.service));
    assert!(zombies.is_zombie("a", NOW_S + 5, h.service.clock().now_ms()));
    let report = zombies.clean_entries(stale).await;
    assert_eq!(report.cleaned, 0);
    assert_eq!(report.skipped, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.service.is_active("a"));
    assert_eq!(h.service.limiter().held(), 1);
    assert_eq!(h.store.peek(SetKind::Working, "a"), Some(fresh as f64));
    assert!(!h.service.abort_execution_current("a", NOW_S + 5));
    assert_eq!(h.service.force_release_current("a", NOW_S + 5), None);
    assert_eq!(h.service.limiter().held(), 1);

    gate.add_permits(1);
    wait_until(|| !h.service.is_active("a")).await;
    assert_eq!(h.service.limiter().held(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadman_timer_cancels_hung_execution() {
    let config = SchedulerConfig::default().with_max_concurrent_agents(1);
    let h = harness(config).await;
    let gate = Arc::new(Semaphore::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    h.service.register(gated(agent("hung", 60, 5), &gate, &runs)).await;
    assert_eq!(h.service.saturate_pool().await, 1);
    wait_until(|| runs.load(Ordering::SeqCst) == 1).await;

    // Timer fires at deadline + zombie threshold: 5s + 30s from acquisition.
    let fire_after_ms = 5_000 + h.service.zombie_threshold_ms("hung") as u64;
    tokio::time::sleep(Duration::from_millis(fire_after_ms - 500)).await;
    assert!(h.service.is_active("hung"));
    assert_eq!(h.service.limiter().held(), 1);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    wait_until(|| !h.service.is_active("hung")).await;
    assert_eq!(h.service.limiter().held(), 0);
    assert_eq!(h.store.peek(SetKind::Working, "hung"), None);
    assert!(h.store.peek(SetKind::Waiting, "hung").is_some());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.service.stats().failed_total, 1);

    // No second release once the supervisor has finished.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.service.limiter().held(), 0);
    assert_eq!(h.service.limiter().available(), Some(1));
    assert_eq!(h.service.stats().run_states, 0);
}

#[tokio::test]
async fn test_store_writes_do_not_close_half_open_breaker() {
    let h = harness(SchedulerConfig::default()).await;
    let breaker = h.service.store_breaker();
    for _ in 0..3 {
        breaker.record_failure(&"connection refused");
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    h.clock.advance_secs(11);
    assert!(breaker.allow_request());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    for name in ["a", "b", "c"] {
        h.service.register(instant(agent(name, 10, 5))).await;
    }
    assert_eq!(h.store.snapshot(SetKind::Waiting).len(), 3);
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    // Admitted acquire cycles decide the transition.
    h.service.saturate_pool().await;
    h.service.saturate_pool().await;
    assert_eq!(breaker.state(), BreakerState::Closed);
}
