//! Failure classification and reschedule backoff.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::RngExt;

use super::agent::{Agent, AgentError, AgentErrorKind};
use crate::config::{FailureBackoffConfig, JitterConfig};

const THROTTLE_HINTS: &[&str] = &[
    "throttl",
    "ratelimit",
    "rate limit",
    "rate exceeded",
    "toomanyrequests",
    "too many requests",
    "slowdown",
    "slow down",
    "requestlimitexceeded",
];

/// Why an execution failed, as far as backoff is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    PermanentForbidden,
    Throttled,
    Transient,
    ServerError,
    Unknown,
}

impl FailureClass {
    pub fn label(self) -> &'static str {
        match self {
            FailureClass::PermanentForbidden => "permanent_forbidden",
            FailureClass::Throttled => "throttled",
            FailureClass::Transient => "transient",
            FailureClass::ServerError => "server_error",
            FailureClass::Unknown => "unknown",
        }
    }
}

fn has_throttle_hint(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    THROTTLE_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Maps an execution error to a failure class. First match wins: kind,
/// code, status, retryable flag, then message.
pub fn classify(error: &AgentError) -> FailureClass {
    match error.kind {
        AgentErrorKind::Interrupted | AgentErrorKind::Io => return FailureClass::Transient,
        AgentErrorKind::ResourceExhausted => return FailureClass::Throttled,
        AgentErrorKind::Service | AgentErrorKind::Other => {}
    }

    if error.code.as_deref().is_some_and(has_throttle_hint) {
        return FailureClass::Throttled;
    }

    if let Some(status) = error.status {
        match status {
            403 => return FailureClass::PermanentForbidden,
            429 => return FailureClass::Throttled,
            500..=599 => return FailureClass::ServerError,
            400..=499 => return FailureClass::Unknown,
            _ => {}
        }
    }

    if error.retryable == Some(true) {
        return FailureClass::Transient;
    }

    if has_throttle_hint(&error.message) {
        return FailureClass::Throttled;
    }

    FailureClass::Unknown
}

/// Applies symmetric jitter of `ratio × offset`. Positive offsets never
/// drop below 1ms.
pub fn apply_jitter<R: RngExt + ?Sized>(offset_ms: i64, ratio: f64, rng: &mut R) -> i64 {
    if offset_ms <= 0 || ratio <= 0.0 {
        return offset_ms;
    }
    let spread = (offset_ms as f64 * ratio).round() as i64;
    if spread == 0 {
        return offset_ms;
    }
    let delta = rng.random_range(-spread..=spread);
    (offset_ms + delta).max(1)
}

/// Rounds a positive millisecond offset up to whole seconds.
pub fn round_up_to_seconds(offset_ms: i64) -> i64 {
    if offset_ms <= 0 {
        return offset_ms;
    }
    ((offset_ms + 999) / 1000) * 1000
}

/// Exponential throttled backoff for the n-th consecutive failure.
pub fn throttled_backoff_ms(config: &FailureBackoffConfig, streak: u32) -> i64 {
    let throttled = &config.throttled;
    let exponent = streak.saturating_sub(1).min(63) as i32;
    let raw = throttled.base_ms as f64 * throttled.multiplier.powi(exponent);
    if !raw.is_finite() || raw >= throttled.cap_ms as f64 {
        return throttled.cap_ms;
    }
    (raw.round() as i64).min(throttled.cap_ms)
}

/// Decides the reschedule offset after a failed run and tracks per-agent
/// failure streaks.
#[derive(Debug)]
pub struct FailurePolicy {
    backoff: FailureBackoffConfig,
    jitter_ratio: f64,
    streaks: Mutex<HashMap<String, u32>>,
}

impl FailurePolicy {
    pub fn new(backoff: FailureBackoffConfig, jitter: &JitterConfig) -> Self {
        Self {
            backoff,
            jitter_ratio: jitter.failure_backoff_ratio,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Clears the failure streak after a successful run.
    pub fn record_success(&self, agent_type: &str) {
        self.streaks.lock().remove(agent_type);
    }

    pub fn streak(&self, agent_type: &str) -> u32 {
        self.streaks.lock().get(agent_type).copied().unwrap_or(0)
    }

    pub fn forget(&self, agent_type: &str) {
        self.streaks.lock().remove(agent_type);
    }

    /// Offset in ms before the agent becomes eligible again, jittered and
    /// rounded up to whole seconds.
    pub fn failure_offset_ms(&self, agent: &Agent, error: &AgentError) -> (FailureClass, i64) {
        let class = classify(error);
        let streak = {
            let mut streaks = self.streaks.lock();
            let entry = streaks.entry(agent.agent_type().to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };

        if !self.backoff.enabled {
            return (class, self.finish(agent.error_interval_ms()));
        }

        let base = match class {
            FailureClass::PermanentForbidden => self.backoff.permanent_forbidden_backoff_ms,
            FailureClass::Throttled => throttled_backoff_ms(&self.backoff, streak),
            FailureClass::Transient | FailureClass::ServerError => {
                if streak <= self.backoff.max_immediate_retries {
                    0
                } else {
                    agent.error_interval_ms()
                }
            }
            FailureClass::Unknown => agent.error_interval_ms(),
        };
        (class, self.finish(base))
    }

    fn finish(&self, offset_ms: i64) -> i64 {
        let jittered = apply_jitter(offset_ms, self.jitter_ratio, &mut rand::rng());
        round_up_to_seconds(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::time::Duration;

    fn agent() -> Agent {
        Agent::new("accounts", "aws", Duration::from_secs(60), Duration::from_secs(30))
            .with_error_interval(Duration::from_secs(120))
    }

    fn enabled_backoff() -> FailureBackoffConfig {
        FailureBackoffConfig {
            enabled: true,
            max_immediate_retries: 2,
            ..FailureBackoffConfig::default()
        }
    }

    fn no_jitter() -> JitterConfig {
        JitterConfig {
            failure_backoff_ratio: 0.0,
            ..JitterConfig::default()
        }
    }

    #[test]
    fn test_classification_order() {
        let io = AgentError::new(AgentErrorKind::Io, "connection reset");
        assert_eq!(classify(&io), FailureClass::Transient);

        let exhausted = AgentError::new(AgentErrorKind::ResourceExhausted, "oom");
        assert_eq!(classify(&exhausted), FailureClass::Throttled);

        let coded = AgentError::service(400, "bad").with_code("RequestLimitExceeded");
        assert_eq!(classify(&coded), FailureClass::Throttled);

        assert_eq!(classify(&AgentError::service(403, "denied")), FailureClass::PermanentForbidden);
        assert_eq!(classify(&AgentError::service(429, "busy")), FailureClass::Throttled);
        assert_eq!(classify(&AgentError::service(503, "down")), FailureClass::ServerError);
        assert_eq!(classify(&AgentError::service(404, "missing")), FailureClass::Unknown);

        let retryable = AgentError::other("flaky").with_retryable(true);
        assert_eq!(classify(&retryable), FailureClass::Transient);

        let message = AgentError::other("Rate exceeded for API");
        assert_eq!(classify(&message), FailureClass::Throttled);

        assert_eq!(classify(&AgentError::other("boom")), FailureClass::Unknown);
    }

    #[test]
    fn test_status_wins_over_retryable_flag() {
        let err = AgentError::service(403, "denied").with_retryable(true);
        assert_eq!(classify(&err), FailureClass::PermanentForbidden);
    }

    #[test]
    fn test_throttled_backoff_monotonic_until_cap() {
        let config = enabled_backoff();
        let mut previous = 0;
        for streak in 1..=20 {
            let backoff = throttled_backoff_ms(&config, streak);
            assert!(backoff >= previous, "streak {} regressed", streak);
            assert!(backoff <= config.throttled.cap_ms);
            previous = backoff;
        }
        assert_eq!(throttled_backoff_ms(&config, 1), config.throttled.base_ms);
        assert_eq!(previous, config.throttled.cap_ms);
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..1000 {
            let jittered = apply_jitter(10_000, 0.1, &mut rng);
            assert!((9_000..=11_000).contains(&jittered));
        }
        assert_eq!(apply_jitter(0, 0.5, &mut rng), 0);
        assert!(apply_jitter(1, 1.0, &mut rng) >= 1);
    }

    #[test]
    fn test_round_up_to_seconds() {
        assert_eq!(round_up_to_seconds(1), 1000);
        assert_eq!(round_up_to_seconds(1000), 1000);
        assert_eq!(round_up_to_seconds(1001), 2000);
        assert_eq!(round_up_to_seconds(0), 0);
    }

    #[test]
    fn test_transient_retries_immediately_then_uses_error_interval() {
        let policy = FailurePolicy::new(enabled_backoff(), &no_jitter());
        let agent = agent();
        let err = AgentError::new(AgentErrorKind::Io, "reset");

        assert_eq!(policy.failure_offset_ms(&agent, &err), (FailureClass::Transient, 0));
        assert_eq!(policy.failure_offset_ms(&agent, &err).1, 0);
        assert_eq!(policy.failure_offset_ms(&agent, &err).1, 120_000);

        policy.record_success("accounts");
        assert_eq!(policy.streak("accounts"), 0);
        assert_eq!(policy.failure_offset_ms(&agent, &err).1, 0);
    }

    #[test]
    fn test_disabled_backoff_always_uses_error_interval() {
        let policy = FailurePolicy::new(FailureBackoffConfig::default(), &no_jitter());
        let offset = policy.failure_offset_ms(&agent(), &AgentError::service(403, "denied"));
        assert_eq!(offset, (FailureClass::PermanentForbidden, 120_000));
    }

    #[test]
    fn test_permanent_forbidden_uses_long_backoff() {
        let policy = FailurePolicy::new(enabled_backoff(), &no_jitter());
        let (_, offset) = policy.failure_offset_ms(&agent(), &AgentError::service(403, "denied"));
        assert_eq!(offset, 1_800_000);
    }
}
