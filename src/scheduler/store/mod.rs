//! Coordination store abstraction.
//!
//! [`AgentStore`] is the full contract the scheduler needs from its shared
//! store: two sorted sets (`waiting`, `working`) mutated only through atomic
//! operations that preserve mutual exclusion, plus a leadership key.
//!
//! Two implementations exist:
//!
//! - [`RedisAgentStore`]: Lua scripts over a Redis `ConnectionManager`.
//! - [`InMemoryAgentStore`]: the same semantics behind a mutex, for tests
//!   and single-process dry runs.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::InMemoryAgentStore;
pub use self::redis_store::RedisAgentStore;

/// Which sorted set an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    Waiting,
    Working,
}

impl SetKind {
    pub fn label(self) -> &'static str {
        match self {
            SetKind::Waiting => "waiting",
            SetKind::Working => "working",
        }
    }
}

/// Outcome of an atomic reschedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleOutcome {
    /// Already waiting; nothing changed.
    Exists,
    /// Moved from working to waiting.
    Moved,
    /// Absent from both sets; added to waiting.
    Added,
}

/// Members affected by a batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub members: Vec<String>,
}

impl BatchOutcome {
    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }
}

/// Raw score of an agent in one set. `Invalid` means the stored value is
/// not numeric (corrupted entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredScore {
    Valid(i64),
    Invalid,
}

impl StoredScore {
    /// Sorted-set scores are doubles; only finite whole numbers are valid
    /// epoch seconds.
    pub fn from_f64(raw: f64) -> Self {
        if raw.is_finite() && raw.fract() == 0.0 {
            StoredScore::Valid(raw as i64)
        } else {
            StoredScore::Invalid
        }
    }

    pub fn value(self) -> Option<i64> {
        match self {
            StoredScore::Valid(v) => Some(v),
            StoredScore::Invalid => None,
        }
    }
}

/// Scores of one agent in both sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AgentScores {
    pub working: Option<i64>,
    pub waiting: Option<i64>,
}

impl AgentScores {
    pub fn is_present(&self) -> bool {
        self.working.is_some() || self.waiting.is_some()
    }
}

/// Atomic operations over the waiting/working sets.
///
/// Every mutating operation preserves mutual exclusion: an agent is never
/// left in both sets. Scores are epoch seconds.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Authoritative store time in epoch milliseconds.
    async fn server_time_ms(&self) -> Result<i64, StoreError>;

    /// Loads server-side scripts. Idempotent.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Number of cached scripts; 0 until initialized.
    fn scripts_loaded(&self) -> usize;

    /// Adds to waiting unless present in either set. Returns true if added.
    async fn add_agent(&self, agent: &str, score: i64) -> Result<bool, StoreError>;

    /// Batch variant of [`add_agent`](Self::add_agent).
    async fn add_agents(&self, pairs: &[(String, i64)]) -> Result<BatchOutcome, StoreError>;

    /// Removes from both sets.
    async fn remove_agent(&self, agent: &str) -> Result<(), StoreError>;

    /// Moves working → waiting, or adds to waiting when absent.
    async fn reschedule_agent(
        &self,
        agent: &str,
        score: i64,
    ) -> Result<RescheduleOutcome, StoreError>;

    /// Moves waiting → working with the deadline as score, only if waiting.
    /// Returns the deadline written, or `None` if the agent was not waiting.
    async fn acquire_agent(&self, agent: &str, deadline: i64) -> Result<Option<i64>, StoreError>;

    /// Batch variant of [`acquire_agent`](Self::acquire_agent); returns the
    /// acquired subset.
    async fn acquire_agents(&self, pairs: &[(String, i64)]) -> Result<BatchOutcome, StoreError>;

    /// Moves working → waiting only if the working score equals `expected`.
    async fn move_agent_conditional(
        &self,
        agent: &str,
        expected: i64,
        new_score: i64,
    ) -> Result<bool, StoreError>;

    /// Removes each `(agent, expected)` from `set` when its score matches.
    async fn remove_agents_conditional(
        &self,
        set: SetKind,
        pairs: &[(String, i64)],
    ) -> Result<BatchOutcome, StoreError>;

    /// Presence in either set, in input order.
    async fn presence(&self, agents: &[String]) -> Result<Vec<bool>, StoreError>;

    /// Scores in both sets, in input order.
    async fn scores(&self, agents: &[String]) -> Result<Vec<AgentScores>, StoreError>;

    /// Members with score <= `max`, ascending, paged.
    async fn range_by_score(
        &self,
        set: SetKind,
        max: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, StoredScore)>, StoreError>;

    /// Members with score >= `min`, ascending, up to `limit`.
    async fn range_from_score(
        &self,
        set: SetKind,
        min: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError>;

    async fn score_of(&self, set: SetKind, agent: &str) -> Result<Option<StoredScore>, StoreError>;

    async fn cardinality(&self, set: SetKind) -> Result<usize, StoreError>;

    /// Up to `count` distinct random members.
    async fn random_members(&self, set: SetKind, count: usize) -> Result<Vec<String>, StoreError>;

    /// Sets the leader key to `token` if absent, with a TTL.
    async fn try_acquire_leadership(&self, token: &str, ttl_ms: i64) -> Result<bool, StoreError>;

    /// Deletes the leader key only if it still holds `token`.
    async fn release_leadership(&self, token: &str) -> Result<bool, StoreError>;
}

/// True for a stored agent name that parses as a number. Such names are
/// rejected by batch validation because they are indistinguishable from
/// scores in flattened argument lists.
pub fn is_numeric_member(member: &str) -> bool {
    !member.is_empty() && member.trim().parse::<f64>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_member_detection() {
        assert!(is_numeric_member("123456789"));
        assert!(is_numeric_member("1.5"));
        assert!(!is_numeric_member("aws/ec2"));
        assert!(!is_numeric_member(""));
    }

    #[test]
    fn test_stored_score_from_f64() {
        assert_eq!(StoredScore::from_f64(1700000000.0), StoredScore::Valid(1700000000));
        assert_eq!(StoredScore::from_f64(1.5), StoredScore::Invalid);
        assert_eq!(StoredScore::from_f64(f64::NEG_INFINITY), StoredScore::Invalid);
        assert_eq!(StoredScore::from_f64(f64::NAN).value(), None);
    }

    #[test]
    fn test_batch_outcome_contains() {
        let outcome = BatchOutcome {
            members: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(outcome.count(), 2);
        assert!(outcome.contains("b"));
        assert!(!outcome.contains("c"));
    }
}
