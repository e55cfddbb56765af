//! Time sources.
//!
//! Every score written to the store is derived from [`StoreClock`], which
//! tracks the offset between the local clock and the store's `TIME` so that
//! pods with skewed clocks still agree on readiness.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::store::AgentStore;

/// A source of epoch milliseconds.
pub trait ClockSource: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, delta_secs: i64) {
        self.advance_ms(delta_secs * 1000);
    }
}

impl ClockSource for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Local clock corrected by a cached offset to the store's clock.
#[derive(Debug)]
pub struct StoreClock {
    local: Arc<dyn ClockSource>,
    offset_ms: AtomicI64,
    last_sync_ms: AtomicI64,
    synced: AtomicBool,
    cache_duration_ms: i64,
}

impl StoreClock {
    pub fn new(local: Arc<dyn ClockSource>, cache_duration_ms: i64) -> Self {
        Self {
            local,
            offset_ms: AtomicI64::new(0),
            last_sync_ms: AtomicI64::new(0),
            synced: AtomicBool::new(false),
            cache_duration_ms: cache_duration_ms.max(0),
        }
    }

    /// Store-aligned epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.local.now_ms() + self.offset_ms.load(Ordering::SeqCst)
    }

    /// Uncorrected local milliseconds, for measuring elapsed time.
    pub fn local_ms(&self) -> i64 {
        self.local.now_ms()
    }

    /// Store-aligned epoch seconds `offset_ms` from now, truncated to the
    /// store's score granularity.
    pub fn score(&self, offset_ms: i64) -> i64 {
        (self.now_ms() + offset_ms).div_euclid(1000)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    /// Refreshes the offset from the store when the cache has expired.
    /// A failed refresh keeps the previous offset.
    pub async fn sync_if_due(&self, store: &dyn AgentStore) {
        let local_now = self.local.now_ms();
        let last = self.last_sync_ms.load(Ordering::SeqCst);
        if self.synced.load(Ordering::SeqCst) && local_now - last < self.cache_duration_ms {
            return;
        }
        if self
            .last_sync_ms
            .compare_exchange(last, local_now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        match store.server_time_ms().await {
            Ok(server_ms) => {
                let local_after = self.local.now_ms();
                let offset = server_ms - (local_now + local_after) / 2;
                let previous = self.offset_ms.swap(offset, Ordering::SeqCst);
                self.synced.store(true, Ordering::SeqCst);
                if (previous - offset).abs() > 1000 {
                    debug!(offset_ms = offset, previous_ms = previous, "Store clock offset changed");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read store time; keeping cached offset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::store::InMemoryAgentStore;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance_secs(5);
        assert_eq!(clock.now_ms(), 6_000);
        clock.set(42);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn test_score_truncates_to_seconds() {
        let local = Arc::new(ManualClock::new(10_999));
        let clock = StoreClock::new(local, 10_000);
        assert_eq!(clock.score(0), 10);
        assert_eq!(clock.score(1), 11);
        assert_eq!(clock.score(5_000), 15);
    }

    #[tokio::test]
    async fn test_sync_applies_store_offset() {
        let local = Arc::new(ManualClock::new(1_000_000));
        let store_clock = Arc::new(ManualClock::new(1_004_000));
        let store = InMemoryAgentStore::new(store_clock.clone());
        let clock = StoreClock::new(local.clone(), 10_000);

        clock.sync_if_due(&store).await;
        assert_eq!(clock.offset_ms(), 4_000);
        assert_eq!(clock.now_ms(), 1_004_000);

        // Cached: a store jump is not observed until the cache expires.
        store_clock.advance_ms(60_000);
        clock.sync_if_due(&store).await;
        assert_eq!(clock.offset_ms(), 4_000);

        local.advance_ms(10_000);
        clock.sync_if_due(&store).await;
        assert_eq!(clock.offset_ms(), 1_064_000 - 1_010_000);
    }

    #[tokio::test]
    async fn test_sync_failure_keeps_offset() {
        let local = Arc::new(ManualClock::new(1_000_000));
        let store = InMemoryAgentStore::new(Arc::new(ManualClock::new(1_002_000)));
        let clock = StoreClock::new(local.clone(), 0);
        clock.sync_if_due(&store).await;
        assert_eq!(clock.offset_ms(), 2_000);

        store.set_unavailable(true);
        local.advance_ms(1);
        clock.sync_if_due(&store).await;
        assert_eq!(clock.offset_ms(), 2_000);
    }
}
