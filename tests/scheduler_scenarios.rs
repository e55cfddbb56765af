//! End-to-end scheduling scenarios on the in-memory store with a manual
//! clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_scheduler::config::SchedulerConfig;
use agent_scheduler::error::SchedulerError;
use agent_scheduler::scheduler::{
    Agent, AgentError, AgentExecution, AgentStore, BreakerState, InMemoryAgentStore, ManualClock,
    NodeStatusProvider, NoopInstrumentation, PriorityAgentScheduler, SetKind, ShardingError,
    ShardingFilter,
};
use async_trait::async_trait;
use tokio::sync::Semaphore;

const NOW_MS: i64 = 1_700_000_000_000;
const NOW_S: i64 = NOW_MS / 1000;

struct GatedExecution {
    gate: Arc<Semaphore>,
    runs: Arc<AtomicUsize>,
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
        Ok(())
    }
}

struct Fixture {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryAgentStore>,
    scheduler: Arc<PriorityAgentScheduler>,
    gate: Arc<Semaphore>,
    runs: Arc<AtomicUsize>,
}

impl Fixture {
    fn new(config: SchedulerConfig) -> Self {
        Self::with(config, |builder| builder)
    }

    fn with(
        config: SchedulerConfig,
        customize: impl FnOnce(
            agent_scheduler::scheduler::SchedulerBuilder,
        ) -> agent_scheduler::scheduler::SchedulerBuilder,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let store = Arc::new(InMemoryAgentStore::new(clock.clone()));
        let builder = PriorityAgentScheduler::builder(config, store.clone()).with_clock(clock.clone());
        let scheduler = customize(builder).build().expect("build scheduler");
        Self {
            clock,
            store,
            scheduler: Arc::new(scheduler),
            gate: Arc::new(Semaphore::new(0)),
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn schedule(&self, name: &str, interval_s: u64, timeout_s: u64) {
        let agent = Agent::new(
            name,
            "test",
            Duration::from_secs(interval_s),
            Duration::from_secs(timeout_s),
        );
        self.scheduler
            .schedule(
                agent,
                Arc::new(GatedExecution {
                    gate: Arc::clone(&self.gate),
                    runs: Arc::clone(&self.runs),
                }),
                Arc::new(NoopInstrumentation),
            )
            .await;
    }
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
async fn test_tick_acquires_and_completion_preserves_cadence() {
    let f = Fixture::new(SchedulerConfig::default().with_max_concurrent_agents(1));
    f.schedule("aws/ec2", 10, 5).await;
    assert_eq!(f.store.peek(SetKind::Waiting, "aws/ec2"), Some(NOW_S as f64));

    f.scheduler.tick().await;
    assert_eq!(f.store.peek(SetKind::Working, "aws/ec2"), Some((NOW_S + 5) as f64));
    assert_eq!(f.scheduler.stats().active_agents, 1);
    assert_eq!(f.scheduler.stats().run_count, 1);

    wait_until(|| f.runs.load(Ordering::SeqCst) == 1).await;
    f.clock.advance_secs(3);
    f.gate.add_permits(1);
    wait_until(|| f.scheduler.stats().active_agents == 0).await;

    assert_eq!(f.store.peek(SetKind::Working, "aws/ec2"), None);
    assert_eq!(f.store.peek(SetKind::Waiting, "aws/ec2"), Some((NOW_S + 10) as f64));
    assert_eq!(f.scheduler.acquisition().limiter().available(), Some(1));
}

#[tokio::test]
async fn test_zombie_cancellation_releases_permit_once() {
    let f = Fixture::new(SchedulerConfig::default().with_max_concurrent_agents(2));
    f.schedule("stuck", 60, 5).await;
    f.schedule("long", 60, 3600).await;

    f.scheduler.tick().await;
    assert_eq!(f.scheduler.stats().active_agents, 2);
    assert_eq!(f.scheduler.acquisition().limiter().held(), 2);

    f.clock.advance_secs(5 + 31);
    let report = f.scheduler.zombie_cleanup().run_pass().await;
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.removed_from_store, 1);
    assert!(!f.scheduler.acquisition().is_active("stuck"));
    assert!(f.scheduler.acquisition().is_active("long"));

    // The cancelled execution's supervisor reschedules but must not
    // release the permit a second time.
    wait_until(|| f.store.peek(SetKind::Waiting, "stuck").is_some()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(f.scheduler.acquisition().limiter().held(), 1);
    assert_eq!(f.store.peek(SetKind::Working, "stuck"), None);
    assert!(f.store.overlap().is_empty());
    assert_eq!(f.scheduler.stats().zombies_cleaned, 1);
}

#[tokio::test]
async fn test_orphan_recovered_when_configured_and_deleted_otherwise() {
    let f = Fixture::new(SchedulerConfig::default());
    f.schedule("valid", 60, 5).await;

    let old_deadline = NOW_S - 20 * 60;
    f.store.remove_agent("valid").await.expect("remove");
    f.store.insert_raw(SetKind::Working, "valid", old_deadline as f64);
    f.store.insert_raw(SetKind::Working, "ghost", old_deadline as f64);
    f.store.insert_raw(SetKind::Working, "recent", (NOW_S - 60) as f64);

    let report = f
        .scheduler
        .orphan_cleanup()
        .run_pass()
        .await
        .expect("orphan pass");
    assert!(report.ran);
    assert_eq!(report.working_moved, 1);
    assert_eq!(report.working_removed, 1);

    assert_eq!(
        f.store.peek(SetKind::Waiting, "valid"),
        Some((old_deadline - 5) as f64)
    );
    assert_eq!(f.store.peek(SetKind::Working, "ghost"), None);
    assert_eq!(f.store.peek(SetKind::Waiting, "ghost"), None);
    assert_eq!(
        f.store.peek(SetKind::Working, "recent"),
        Some((NOW_S - 60) as f64)
    );
}

#[tokio::test]
async fn test_orphan_pass_requires_leadership() {
    let f = Fixture::new(SchedulerConfig::default());
    f.schedule("a", 60, 5).await;
    assert!(f
        .store
        .try_acquire_leadership("other-pod::1", 60_000)
        .await
        .expect("leader"));

    let report = f
        .scheduler
        .orphan_cleanup()
        .run_pass()
        .await
        .expect("orphan pass");
    assert!(!report.ran);

    let forced = f
        .scheduler
        .orphan_cleanup()
        .force_cleanup_orphaned_agents()
        .await
        .expect("forced pass");
    assert!(forced.ran);
}

#[tokio::test]
async fn test_invalid_waiting_entries_are_removed() {
    let f = Fixture::new(SchedulerConfig::default());
    f.schedule("kept", 60, 5).await;
    f.store.insert_raw(SetKind::Waiting, "unknown", NOW_S as f64);
    f.store.insert_raw(SetKind::Waiting, "123456789012", NOW_S as f64);

    let report = f
        .scheduler
        .orphan_cleanup()
        .force_cleanup_orphaned_agents()
        .await
        .expect("forced pass");
    assert_eq!(report.waiting_removed, 2);
    assert!(f.store.peek(SetKind::Waiting, "kept").is_some());
    assert_eq!(f.store.peek(SetKind::Waiting, "unknown"), None);
}

#[tokio::test]
async fn test_store_outage_opens_breaker_and_stops_store_calls() {
    let f = Fixture::new(SchedulerConfig::default());
    f.schedule("a", 60, 5).await;
    let acquisition = f.scheduler.acquisition();

    f.store.set_unavailable(true);
    for _ in 0..3 {
        assert_eq!(acquisition.saturate_pool().await, 0);
    }
    assert_eq!(acquisition.store_breaker().state(), BreakerState::Open);

    let calls = f.store.call_count();
    for _ in 0..5 {
        assert_eq!(acquisition.saturate_pool().await, 0);
    }
    assert_eq!(f.store.call_count(), calls);
    assert!(acquisition.last_cycle().blocked);

    f.store.set_unavailable(false);
    f.clock.advance_secs(5);
    acquisition.saturate_pool().await;
    assert_eq!(f.store.call_count(), calls);

    f.clock.advance_secs(6);
    acquisition.saturate_pool().await;
    assert!(f.store.call_count() > calls);
    assert_ne!(acquisition.store_breaker().state(), BreakerState::Open);
}

#[tokio::test]
async fn test_initialization_respects_store_breaker() {
    let f = Fixture::new(SchedulerConfig::default());
    let breaker = f.scheduler.acquisition().store_breaker();
    f.store.set_unavailable(true);
    for _ in 0..3 {
        f.scheduler.tick().await;
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    let calls = f.store.call_count();
    for _ in 0..5 {
        f.scheduler.tick().await;
    }
    assert_eq!(f.store.call_count(), calls);

    f.store.set_unavailable(false);
    f.clock.advance_secs(11);
    f.scheduler.tick().await;
    assert!(f.store.call_count() > calls);
    assert!(f.store.scripts_loaded() > 0);
    assert_ne!(breaker.state(), BreakerState::Open);
}

struct Disabled;

impl NodeStatusProvider for Disabled {
    fn is_node_enabled(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn test_disabled_node_skips_tick() {
    let f = Fixture::with(SchedulerConfig::default(), |b| b.with_node_status(Arc::new(Disabled)));
    f.scheduler.tick().await;
    assert_eq!(f.scheduler.stats().run_count, 0);
    assert_eq!(f.store.call_count(), 0);
}

struct ToggleShards(Arc<AtomicBool>);

impl ShardingFilter for ToggleShards {
    fn owns(&self, _agent_type: &str) -> Result<bool, ShardingError> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[tokio::test]
async fn test_reconcile_follows_shard_ownership() {
    let owned = Arc::new(AtomicBool::new(false));
    let shards = Arc::new(ToggleShards(Arc::clone(&owned)));
    let f = Fixture::with(SchedulerConfig::default(), |b| b.with_sharding(shards));
    f.schedule("a", 60, 5).await;
    assert_eq!(f.scheduler.stats().registered_agents, 0);
    assert_eq!(f.store.peek(SetKind::Waiting, "a"), None);

    owned.store(true, Ordering::SeqCst);
    let report = f.scheduler.reconcile_now().await;
    assert_eq!(report.registered, 1);
    assert!(f.store.peek(SetKind::Waiting, "a").is_some());

    owned.store(false, Ordering::SeqCst);
    let report = f.scheduler.reconcile_now().await;
    assert_eq!(report.unregistered, 1);
    assert_eq!(f.scheduler.stats().registered_agents, 0);
    // Unregistering for a shard change leaves the store entry for the new owner.
    assert!(f.store.peek(SetKind::Waiting, "a").is_some());
}

#[tokio::test]
async fn test_unschedule_removes_from_store() {
    let f = Fixture::new(SchedulerConfig::default());
    f.schedule("a", 60, 5).await;
    f.scheduler.unschedule("a").await;
    assert_eq!(f.scheduler.stats().registered_agents, 0);
    assert_eq!(f.store.peek(SetKind::Waiting, "a"), None);
}

#[tokio::test]
async fn test_health_summary_reports_sections() {
    let f = Fixture::new(SchedulerConfig::default().with_max_concurrent_agents(4));
    f.schedule("a", 60, 5).await;
    f.scheduler.tick().await;

    let line = f.scheduler.health_summary().await;
    assert!(line.starts_with("Scheduler health | health=HEALTHY"));
    assert!(line.contains("agents registered=1 active=1"));
    assert!(line.contains("permits 1/4 (25%)"));
    assert!(line.contains("consistency violations=0"));
    assert!(line.contains("watchdogs=none"));
    f.gate.add_permits(1);
}

#[tokio::test]
async fn test_run_forever_and_graceful_shutdown() {
    let mut config = SchedulerConfig::default().with_max_concurrent_agents(2);
    config.interval_ms = 10;
    let f = Fixture::new(config);
    f.schedule("a", 60, 5).await;
    f.schedule("b", 60, 5).await;

    let (tx, rx) = tokio::sync::broadcast::channel(1);
    let driver = tokio::spawn({
        let scheduler = Arc::clone(&f.scheduler);
        async move { scheduler.run_forever(rx).await }
    });
    wait_until(|| f.scheduler.stats().active_agents == 2).await;
    assert!(f.scheduler.is_running());

    let (_tx2, rx2) = tokio::sync::broadcast::channel(1);
    assert!(matches!(
        f.scheduler.run_forever(rx2).await,
        Err(SchedulerError::AlreadyRunning)
    ));

    tx.send(()).expect("signal");
    driver.await.expect("join").expect("run_forever");
    f.scheduler.shutdown().await.expect("shutdown");

    assert!(!f.scheduler.is_running());
    assert!(f.store.snapshot(SetKind::Working).is_empty());
    assert_eq!(f.store.snapshot(SetKind::Waiting).len(), 2);
    assert_eq!(f.scheduler.acquisition().limiter().held(), 0);
}
