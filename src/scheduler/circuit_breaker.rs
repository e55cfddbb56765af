//! Three-state circuit breaker.
//!
//! ```text
//!            threshold reached                cooldown elapsed
//!   CLOSED ─────────────────────▶ OPEN ─────────────────────────▶ HALF_OPEN
//!     ▲                            ▲                                  │
//!     │  2 probe successes         │  probe failure / window expired  │
//!     └────────────────────────────┼──────────────────────────────────┘
//! ```
//!
//! Failures are counted in a rolling window and as a consecutive streak;
//! either reaching the threshold trips the breaker. While HALF_OPEN at most
//! three probes are admitted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::clock::ClockSource;
use crate::config::CircuitBreakerConfig;
use crate::metrics::SchedulerMetrics;

const HALF_OPEN_MAX_PROBES: u32 = 3;
const HALF_OPEN_SUCCESSES_TO_CLOSE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Breaker thresholds in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub failure_window_ms: i64,
    pub cooldown_ms: i64,
    pub half_open_duration_ms: i64,
}

impl BreakerSettings {
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            failure_window_ms: config.failure_window_ms.max(1),
            cooldown_ms: config.cooldown_ms.max(0),
            half_open_duration_ms: config.half_open_duration_ms.max(1),
        }
    }

    /// Faster-tripping variant used directly around store calls.
    pub fn stricter(self) -> Self {
        Self {
            failure_threshold: self.failure_threshold.saturating_sub(2).max(2),
            failure_window_ms: (self.failure_window_ms / 2).max(1_000),
            cooldown_ms: (self.cooldown_ms / 3).max(1_000),
            ..self
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<i64>,
    consecutive_failures: u32,
    opened_at_ms: i64,
    half_open_started_ms: i64,
    half_open_probes: u32,
    half_open_successes: u32,
    last_failure: Option<String>,
}

/// A named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    settings: BreakerSettings,
    clock: Arc<dyn ClockSource>,
    metrics: SchedulerMetrics,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, settings: BreakerSettings, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            name,
            settings,
            clock,
            metrics: SchedulerMetrics::new(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                consecutive_failures: 0,
                opened_at_ms: 0,
                half_open_started_ms: 0,
                half_open_probes: 0,
                half_open_successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a call may proceed. OPEN transitions to HALF_OPEN once the
    /// cooldown has elapsed; the admitting call is the first probe.
    pub fn allow_request(&self) -> bool {
        if !self.settings.enabled {
            return true;
        }
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now - inner.opened_at_ms >= self.settings.cooldown_ms {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_started_ms = now;
                    inner.half_open_probes = 1;
                    inner.half_open_successes = 0;
                    info!(breaker = self.name, "Circuit breaker HALF_OPEN; probing");
                    true
                } else {
                    drop(inner);
                    self.metrics.record_breaker_event(self.name, "blocked");
                    false
                }
            }
            BreakerState::HalfOpen => {
                if now - inner.half_open_started_ms > self.settings.half_open_duration_ms {
                    self.trip(&mut inner, now, "half-open window expired");
                    drop(inner);
                    self.metrics.record_breaker_event(self.name, "blocked");
                    return false;
                }
                if inner.half_open_probes < HALF_OPEN_MAX_PROBES {
                    inner.half_open_probes += 1;
                    true
                } else {
                    drop(inner);
                    self.metrics.record_breaker_event(self.name, "blocked");
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        if !self.settings.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= HALF_OPEN_SUCCESSES_TO_CLOSE {
                    inner.state = BreakerState::Closed;
                    inner.failures.clear();
                    inner.consecutive_failures = 0;
                    inner.last_failure = None;
                    drop(inner);
                    info!(breaker = self.name, "Circuit breaker CLOSED; dependency recovered");
                    self.metrics.record_breaker_event(self.name, "recovery");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, reason: &dyn fmt::Display) {
        if !self.settings.enabled {
            return;
        }
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.last_failure = Some(reason.to_string());
        let state = inner.state;
        match state {
            BreakerState::Closed => {
                let window_start = now - self.settings.failure_window_ms;
                while inner.failures.front().is_some_and(|&ts| ts < window_start) {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);
                inner.consecutive_failures += 1;
                let threshold = self.settings.failure_threshold;
                if inner.failures.len() as u32 >= threshold
                    || inner.consecutive_failures >= threshold
                {
                    self.trip(&mut inner, now, "failure threshold reached");
                }
            }
            BreakerState::HalfOpen => {
                self.trip(&mut inner, now, "probe failed");
            }
            BreakerState::Open => {}
        }
    }

    /// Forces the breaker back to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.consecutive_failures = 0;
        inner.half_open_probes = 0;
        inner.half_open_successes = 0;
        inner.last_failure = None;
    }

    /// One-line state description for logs.
    pub fn status(&self) -> String {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => format!(
                "{} CLOSED (failures={}/{})",
                self.name,
                inner.failures.len(),
                self.settings.failure_threshold
            ),
            BreakerState::Open => format!(
                "{} OPEN (last_failure={})",
                self.name,
                inner.last_failure.as_deref().unwrap_or("unknown")
            ),
            BreakerState::HalfOpen => format!(
                "{} HALF_OPEN (probes={}/{} successes={})",
                self.name, inner.half_open_probes, HALF_OPEN_MAX_PROBES, inner.half_open_successes
            ),
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: i64, why: &str) {
        inner.state = BreakerState::Open;
        inner.opened_at_ms = now;
        inner.half_open_probes = 0;
        inner.half_open_successes = 0;
        inner.failures.clear();
        inner.consecutive_failures = 0;
        warn!(
            breaker = self.name,
            reason = why,
            last_failure = inner.last_failure.as_deref().unwrap_or("unknown"),
            cooldown_ms = self.settings.cooldown_ms,
            "Circuit breaker OPEN"
        );
        self.metrics.record_breaker_event(self.name, "trip");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::clock::ManualClock;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            enabled: true,
            failure_threshold: 3,
            failure_window_ms: 10_000,
            cooldown_ms: 5_000,
            half_open_duration_ms: 2_000,
        }
    }

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("test", settings(), clock)
    }

    #[test]
    fn test_trips_after_threshold() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = breaker(clock.clone());
        for _ in 0..2 {
            cb.record_failure(&"boom");
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure(&"boom");
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_window_expires_old_failures() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = breaker(clock.clone());
        cb.record_failure(&"a");
        cb.record_failure(&"b");
        cb.record_success();
        clock.advance_ms(11_000);
        cb.record_failure(&"c");
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = breaker(clock.clone());
        for _ in 0..3 {
            cb.record_failure(&"down");
        }
        clock.advance_ms(4_999);
        assert!(!cb.allow_request());
        clock.advance_ms(1);
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.allow_request());
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = breaker(clock.clone());
        for _ in 0..3 {
            cb.record_failure(&"down");
        }
        clock.advance_ms(5_000);
        assert!(cb.allow_request());
        cb.record_failure(&"still down");
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_half_open_limits_probes() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = breaker(clock.clone());
        for _ in 0..3 {
            cb.record_failure(&"down");
        }
        clock.advance_ms(5_000);
        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_half_open_window_expiry_reopens() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = breaker(clock.clone());
        for _ in 0..3 {
            cb.record_failure(&"down");
        }
        clock.advance_ms(5_000);
        assert!(cb.allow_request());
        clock.advance_ms(2_001);
        assert!(!cb.allow_request());
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_disabled_breaker_always_allows() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = CircuitBreaker::new(
            "off",
            BreakerSettings {
                enabled: false,
                ..settings()
            },
            clock,
        );
        for _ in 0..100 {
            cb.record_failure(&"x");
        }
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_stricter_settings() {
        let base = BreakerSettings::from_config(&CircuitBreakerConfig::default());
        let strict = base.stricter();
        assert_eq!(strict.failure_threshold, 3);
        assert_eq!(strict.cooldown_ms, 10_000);
        assert!(strict.failure_window_ms <= base.failure_window_ms);
        assert!(strict.enabled);
    }

    #[test]
    fn test_status_strings() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock);
        assert!(cb.status().contains("CLOSED"));
        for _ in 0..3 {
            cb.record_failure(&"redis down");
        }
        assert!(cb.status().contains("redis down"));
    }
}
