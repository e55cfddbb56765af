//! Per-execution bookkeeping and the local concurrency limiter.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

/// State of one locally owned execution.
///
/// `permit_held` is the single source of truth for permit release: every
/// release path calls [`try_release`](Self::try_release) and only the
/// caller that wins the CAS returns the permit.
#[derive(Debug)]
pub struct RunState {
    permit_held: AtomicBool,
    started: AtomicBool,
    deadman: Mutex<Option<AbortHandle>>,
}

impl RunState {
    pub fn new(permit_held: bool) -> Self {
        Self {
            permit_held: AtomicBool::new(permit_held),
            started: AtomicBool::new(false),
            deadman: Mutex::new(None),
        }
    }

    pub fn holds_permit(&self) -> bool {
        self.permit_held.load(Ordering::SeqCst)
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn arm_deadman(&self, handle: AbortHandle) {
        if let Some(previous) = self.deadman.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel_deadman(&self) {
        if let Some(handle) = self.deadman.lock().take() {
            handle.abort();
        }
    }

    /// Flips `permit_held` from true to false. Returns true for the single
    /// winning caller; that caller also cancels the dead-man timer.
    pub fn try_release(&self) -> bool {
        let won = self
            .permit_held
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.cancel_deadman();
        }
        won
    }
}

/// Counting limiter over `max_concurrent_agents`. Unbounded when the
/// configured maximum is <= 0.
///
/// `outstanding` counts detached permits; a release only returns a permit
/// to the semaphore after decrementing it, so concurrent releases can never
/// push the semaphore past `max`.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Option<Arc<Semaphore>>,
    outstanding: Arc<AtomicUsize>,
    max: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: i64) -> Self {
        if max_concurrent <= 0 {
            return Self {
                semaphore: None,
                outstanding: Arc::new(AtomicUsize::new(0)),
                max: 0,
            };
        }
        let max = max_concurrent as usize;
        Self {
            semaphore: Some(Arc::new(Semaphore::new(max))),
            outstanding: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Configured maximum; 0 when unbounded.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Currently free permits, or `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Permits currently taken, 0 when unbounded.
    pub fn held(&self) -> usize {
        if self.semaphore.is_some() {
            self.outstanding.load(Ordering::SeqCst)
        } else {
            0
        }
    }

    /// Takes one permit without waiting. Always succeeds when unbounded.
    ///
    /// The permit is detached from its guard; it is returned only through
    /// [`release`](Self::release) after a won [`RunState::try_release`].
    pub fn try_acquire(&self) -> bool {
        match &self.semaphore {
            Some(s) => match s.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    self.outstanding.fetch_add(1, Ordering::SeqCst);
                    true
                }
                Err(_) => false,
            },
            None => true,
        }
    }

    /// Returns one detached permit. Returns false when nothing was
    /// outstanding (or the limiter is unbounded).
    pub fn release(&self) -> bool {
        let Some(s) = &self.semaphore else {
            return false;
        };
        let taken = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            s.add_permits(1);
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_is_exactly_once() {
        let state = RunState::new(true);
        assert!(state.try_release());
        assert!(!state.try_release());
        assert!(!state.holds_permit());
    }

    #[test]
    fn test_concurrent_release_has_one_winner() {
        let state = Arc::new(RunState::new(true));
        let winners: usize = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || state.try_release())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("thread") as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_limiter_counts_permits() {
        let limiter = ConcurrencyLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.held(), 2);

        assert!(limiter.release());
        assert_eq!(limiter.available(), Some(1));
        assert!(limiter.release());
        assert!(!limiter.release());
        assert_eq!(limiter.available(), Some(2));
    }

    #[test]
    fn test_concurrent_releases_never_exceed_max() {
        let limiter = ConcurrencyLimiter::new(4);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());

        let returned: usize = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.release())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("thread") as usize)
            .sum();
        assert_eq!(returned, 2);
        assert_eq!(limiter.available(), Some(4));
        assert_eq!(limiter.held(), 0);
    }

    #[test]
    fn test_unbounded_limiter() {
        let limiter = ConcurrencyLimiter::new(0);
        assert!(!limiter.is_bounded());
        assert!(limiter.try_acquire());
        assert_eq!(limiter.available(), None);
        assert_eq!(limiter.held(), 0);
    }

    #[tokio::test]
    async fn test_release_cancels_deadman() {
        let state = RunState::new(true);
        let timer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        state.arm_deadman(timer.abort_handle());
        assert!(state.try_release());
        let result = timer.await;
        assert!(result.expect_err("aborted").is_cancelled());
    }
}
