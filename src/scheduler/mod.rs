//! Distributed agent scheduling over a shared sorted-set store.
//!
//! Every agent lives in exactly one of two sorted sets:
//!
//! - **waiting**, scored by the epoch second it becomes ready;
//! - **working**, scored by the epoch second its current run must finish.
//!
//! Pods race to move ready agents from waiting to working with atomic
//! scripts, so at most one pod owns an agent at a time. The owner runs it,
//! then moves it back to waiting at its next ready time.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────────────────┐
//!                   │  PriorityAgentScheduler  │  tick() every interval_ms
//!                   └────────────┬─────────────┘
//!            ┌───────────────────┼─────────────────────┬──────────────┐
//!            ▼                   ▼                     ▼              ▼
//!   ┌─────────────────┐  ┌───────────────┐   ┌────────────────┐  ┌──────────┐
//!   │  Acquisition    │  │ Zombie pass   │   │ Orphan pass    │  │ Watchdog │
//!   │  saturate_pool  │  │ (local view)  │   │ (leader only)  │  └──────────┘
//!   └───────┬─────────┘  └──────┬────────┘   └───────┬────────┘
//!           │ permits / pool    │                    │
//!           ▼                   ▼                    ▼
//!   ┌──────────────────────────────────────────────────────────┐
//!   │            AgentStore (Redis Lua / in-memory)            │
//!   │        waiting ZSET   working ZSET   cleanup-leader      │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_scheduler::config::SchedulerConfig;
//! use agent_scheduler::scheduler::{
//!     Agent, LoggingInstrumentation, PriorityAgentScheduler, RedisAgentStore, SchedulerKeys,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = SchedulerConfig::from_yaml_file("scheduler.yaml")?;
//! let keys = SchedulerKeys::from_config(&config.keys);
//! let store = Arc::new(RedisAgentStore::connect("redis://localhost:6379", keys).await?);
//! let scheduler = Arc::new(PriorityAgentScheduler::builder(config, store).build()?);
//!
//! let agent = Agent::new("aws/ec2", "aws", Duration::from_secs(60), Duration::from_secs(30));
//! scheduler.schedule(agent, Arc::new(MyExecution), Arc::new(LoggingInstrumentation)).await;
//!
//! let (tx, rx) = tokio::sync::broadcast::channel(1);
//! let driver = tokio::spawn({
//!     let scheduler = Arc::clone(&scheduler);
//!     async move { scheduler.run_forever(rx).await }
//! });
//! // ...
//! let _ = tx.send(());
//! driver.await??;
//! scheduler.shutdown().await?;
//! ```

pub mod acquisition;
pub mod agent;
pub mod circuit_breaker;
pub mod clock;
pub mod failure;
pub mod keys;
pub mod orchestrator;
pub mod orphan;
pub mod pool;
pub mod run_state;
pub mod scripts;
pub mod store;
pub mod watchdog;
pub mod zombie;

pub use acquisition::{
    AcquisitionService, AcquisitionStats, BacklogSnapshot, ConsistencyReport, CycleOutcome,
    Registration,
};
pub use agent::{
    Agent, AgentError, AgentErrorKind, AgentExecution, AlwaysEnabled, ExecutionInstrumentation,
    LoggingInstrumentation, NodeStatusProvider, NoopInstrumentation, OwnAllShards, ShardingError,
    ShardingFilter,
};
pub use circuit_breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use clock::{ClockSource, ManualClock, StoreClock, SystemClock};
pub use failure::{FailureClass, FailurePolicy};
pub use keys::SchedulerKeys;
pub use orchestrator::{PriorityAgentScheduler, ReconcileReport, SchedulerBuilder, SchedulerStats};
pub use orphan::{OrphanCleanupService, OrphanPassReport};
pub use pool::{ExecutionPool, PoolError, PoolStats};
pub use store::{
    AgentScores, AgentStore, BatchOutcome, InMemoryAgentStore, RedisAgentStore,
    RescheduleOutcome, SetKind, StoredScore,
};
pub use watchdog::{Watchdog, WatchdogFlag, WatchdogInputs};
pub use zombie::{ZombieCleanupService, ZombiePassReport};
