//! Execution pool for agent bodies.
//!
//! Agent executions run as independent tokio tasks. Submission never
//! blocks: a caller first reserves a [`PoolSlot`], which fails immediately
//! when the pool is saturated or shut down, and then spawns onto it.
//!
//! # Features
//!
//! - Optional capacity bound (0 = unbounded)
//! - Non-blocking reservation with rejection
//! - Graceful shutdown that waits for in-flight executions
//! - Pool statistics tracking

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Errors that can occur when submitting to the pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is taken.
    #[error("Execution pool saturated ({active}/{capacity} active)")]
    Saturated { active: usize, capacity: usize },

    /// The pool no longer accepts work.
    #[error("Execution pool is shut down")]
    ShutDown,

    /// In-flight executions did not drain in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Statistics about the execution pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Configured capacity; 0 when unbounded.
    pub capacity: usize,
    /// Executions currently holding a slot.
    pub active: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    /// Average execution duration.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of executions finished (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.completed + self.failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug)]
struct SharedPoolStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active: AtomicU64::new(0),
        }
    }

    fn record_outcome(&self, success: bool, duration: Duration) {
        if success {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, capacity: usize) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            capacity,
            active: self.active.load(Ordering::SeqCst) as usize,
            submitted: self.submitted.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            completed,
            failed,
            average_duration,
        }
    }
}

/// A reserved execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct PoolSlot {
    stats: Arc<SharedPoolStats>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded, non-blocking execution pool.
#[derive(Debug)]
pub struct ExecutionPool {
    capacity: usize,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl ExecutionPool {
    /// Creates a pool. `capacity` 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(true),
        }
    }

    /// Reserves a slot without waiting.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutDown` after [`shutdown`](Self::shutdown) and
    /// `PoolError::Saturated` when every slot is taken.
    pub fn try_reserve(&self) -> Result<PoolSlot, PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            self.stats.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(PoolError::ShutDown);
        }

        if self.capacity == 0 {
            self.stats.active.fetch_add(1, Ordering::SeqCst);
        } else {
            let capacity = self.capacity as u64;
            let reserved = self
                .stats
                .active
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                    (active < capacity).then_some(active + 1)
                });
            if let Err(active) = reserved {
                self.stats.rejected.fetch_add(1, Ordering::SeqCst);
                return Err(PoolError::Saturated {
                    active: active as usize,
                    capacity: self.capacity,
                });
            }
        }

        self.stats.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(PoolSlot {
            stats: Arc::clone(&self.stats),
        })
    }

    /// Spawns `future` holding `slot` until it finishes or is aborted.
    pub fn spawn<F>(&self, slot: PoolSlot, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(async move {
            let _slot = slot;
            future.await
        })
    }

    /// Stops accepting work and waits for in-flight executions to release
    /// their slots.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if executions are still running
    /// after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PoolError> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Initiating execution pool shutdown");

        let drain = async {
            while self.stats.active.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("Execution pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                debug!(active = self.active(), "Execution pool still busy at shutdown deadline");
                Err(PoolError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Records how an execution ended.
    pub fn record_outcome(&self, success: bool, duration: Duration) {
        self.stats.record_outcome(success, duration);
    }

    /// Returns whether the pool accepts submissions.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst) as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();
        assert_eq!(stats.capacity, 0);
        assert_eq!(stats.total_processed(), 0);
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            completed: 80,
            failed: 20,
            ..Default::default()
        };
        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < 0.001);
    }

    #[test]
    fn test_reservation_respects_capacity() {
        let pool = ExecutionPool::new(2);
        let first = pool.try_reserve().expect("first slot");
        let _second = pool.try_reserve().expect("second slot");
        assert_eq!(
            pool.try_reserve().expect_err("saturated"),
            PoolError::Saturated {
                active: 2,
                capacity: 2
            }
        );

        drop(first);
        assert!(pool.try_reserve().is_ok());
        let stats = pool.stats();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn test_pool_records_outcome() {
        let pool = ExecutionPool::new(0);
        let slot = pool.try_reserve().expect("slot");
        pool.record_outcome(true, Duration::from_millis(100));
        pool.record_outcome(false, Duration::from_millis(300));
        drop(slot);

        let stats = pool.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.average_duration, Duration::from_millis(200));
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_aborted_task_frees_slot() {
        let pool = ExecutionPool::new(1);
        let slot = pool.try_reserve().expect("slot");
        let handle = pool.spawn(slot, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(pool.active(), 1);

        handle.abort();
        assert!(handle.await.expect_err("aborted").is_cancelled());
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let pool = ExecutionPool::new(0);
        pool.shutdown(Duration::from_millis(50)).await.expect("idle shutdown");
        assert!(!pool.is_running());
        assert_eq!(pool.try_reserve().expect_err("shut down"), PoolError::ShutDown);
    }

    #[tokio::test]
    async fn test_shutdown_times_out_with_busy_slot() {
        let pool = ExecutionPool::new(0);
        let _slot = pool.try_reserve().expect("slot");
        let result = pool.shutdown(Duration::from_millis(30)).await;
        assert_eq!(result, Err(PoolError::ShutdownTimeout(Duration::from_millis(30))));
    }

    #[test]
    fn test_pool_error_display() {
        assert_eq!(PoolError::ShutDown.to_string(), "Execution pool is shut down");
        assert!(PoolError::Saturated {
            active: 4,
            capacity: 4
        }
        .to_string()
        .contains("4/4"));
    }
}
