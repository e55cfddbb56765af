//! In-process agent store.
//!
//! Mirrors the Lua script semantics exactly, with a single mutex standing in
//! for Redis' single-threaded script execution. Also offers fault injection
//! (whole-store outage or per-operation failures) for exercising the
//! breaker, retry and fallback paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use super::{
    is_numeric_member, AgentScores, AgentStore, BatchOutcome, RescheduleOutcome, SetKind,
    StoredScore,
};
use crate::error::StoreError;
use crate::scheduler::clock::ClockSource;
use crate::scheduler::scripts::Script;

#[derive(Debug, Default)]
struct MemoryState {
    waiting: HashMap<String, f64>,
    working: HashMap<String, f64>,
    leader: Option<(String, i64)>,
}

impl MemoryState {
    fn set(&self, set: SetKind) -> &HashMap<String, f64> {
        match set {
            SetKind::Waiting => &self.waiting,
            SetKind::Working => &self.working,
        }
    }

    fn set_mut(&mut self, set: SetKind) -> &mut HashMap<String, f64> {
        match set {
            SetKind::Waiting => &mut self.waiting,
            SetKind::Working => &mut self.working,
        }
    }

    fn sorted(&self, set: SetKind) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = self
            .set(set)
            .iter()
            .map(|(m, s)| (m.clone(), *s))
            .collect();
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

/// Agent store held in process memory.
#[derive(Debug)]
pub struct InMemoryAgentStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn ClockSource>,
    unavailable: AtomicBool,
    scripts_loaded: AtomicBool,
    calls: AtomicU64,
    injected_failures: Mutex<HashMap<&'static str, u32>>,
}

impl InMemoryAgentStore {
    /// `clock` plays the role of the store's `TIME`.
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            unavailable: AtomicBool::new(false),
            scripts_loaded: AtomicBool::new(false),
            calls: AtomicU64::new(0),
            injected_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Makes every subsequent call fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails the next `times` calls of operation `op` (e.g. `"acquire_agents"`).
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.injected_failures.lock().insert(op, times);
    }

    /// Total operations attempted, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Writes a raw score, bypassing every invariant. Test setup only.
    pub fn insert_raw(&self, set: SetKind, member: &str, score: f64) {
        self.state
            .lock()
            .set_mut(set)
            .insert(member.to_string(), score);
    }

    /// Current score of `member`, without counting a call.
    pub fn peek(&self, set: SetKind, member: &str) -> Option<f64> {
        self.state.lock().set(set).get(member).copied()
    }

    /// Sorted contents of a set, without counting a call.
    pub fn snapshot(&self, set: SetKind) -> Vec<(String, f64)> {
        self.state.lock().sorted(set)
    }

    /// Members present in both sets. Always empty unless `insert_raw` was
    /// used to break the invariant.
    pub fn overlap(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut both: Vec<String> = state
            .waiting
            .keys()
            .filter(|m| state.working.contains_key(*m))
            .cloned()
            .collect();
        both.sort();
        both
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        let mut failures = self.injected_failures.lock();
        if let Some(remaining) = failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Unavailable(format!("injected failure in {}", op)));
            }
        }
        Ok(())
    }

    fn check_script(&self, script: Script) -> Result<(), StoreError> {
        self.check(script.name())?;
        if !self.scripts_loaded.load(Ordering::SeqCst) {
            return Err(StoreError::ScriptsNotInitialized);
        }
        Ok(())
    }
}

fn matches_expected(current: Option<&f64>, expected: i64) -> bool {
    current.is_some_and(|score| *score == expected as f64)
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn server_time_ms(&self) -> Result<i64, StoreError> {
        self.check("time")?;
        Ok(self.clock.now_ms())
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.check("script_load")?;
        self.scripts_loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn scripts_loaded(&self) -> usize {
        if self.scripts_loaded.load(Ordering::SeqCst) {
            Script::ALL.len()
        } else {
            0
        }
    }

    async fn add_agent(&self, agent: &str, score: i64) -> Result<bool, StoreError> {
        self.check_script(Script::AddAgent)?;
        let mut state = self.state.lock();
        if state.working.contains_key(agent) || state.waiting.contains_key(agent) {
            return Ok(false);
        }
        state.waiting.insert(agent.to_string(), score as f64);
        Ok(true)
    }

    async fn add_agents(&self, pairs: &[(String, i64)]) -> Result<BatchOutcome, StoreError> {
        self.check_script(Script::AddAgents)?;
        let mut state = self.state.lock();
        let mut added = Vec::new();
        for (agent, score) in pairs {
            if is_numeric_member(agent) {
                continue;
            }
            if state.working.contains_key(agent) || state.waiting.contains_key(agent) {
                continue;
            }
            state.waiting.insert(agent.clone(), *score as f64);
            added.push(agent.clone());
        }
        Ok(BatchOutcome { members: added })
    }

    async fn remove_agent(&self, agent: &str) -> Result<(), StoreError> {
        self.check_script(Script::RemoveAgent)?;
        let mut state = self.state.lock();
        state.working.remove(agent);
        state.waiting.remove(agent);
        Ok(())
    }

    async fn reschedule_agent(
        &self,
        agent: &str,
        score: i64,
    ) -> Result<RescheduleOutcome, StoreError> {
        self.check_script(Script::RescheduleAgent)?;
        let mut state = self.state.lock();
        if state.waiting.contains_key(agent) {
            return Ok(RescheduleOutcome::Exists);
        }
        let moved = state.working.remove(agent).is_some();
        state.waiting.insert(agent.to_string(), score as f64);
        Ok(if moved {
            RescheduleOutcome::Moved
        } else {
            RescheduleOutcome::Added
        })
    }

    async fn acquire_agent(&self, agent: &str, deadline: i64) -> Result<Option<i64>, StoreError> {
        self.check_script(Script::AcquireAgent)?;
        let mut state = self.state.lock();
        if state.waiting.remove(agent).is_some() {
            state.working.insert(agent.to_string(), deadline as f64);
            return Ok(Some(deadline));
        }
        Ok(None)
    }

    async fn acquire_agents(&self, pairs: &[(String, i64)]) -> Result<BatchOutcome, StoreError> {
        self.check_script(Script::AcquireAgents)?;
        let mut state = self.state.lock();
        let mut acquired = Vec::new();
        for (agent, deadline) in pairs {
            if state.waiting.remove(agent).is_some() {
                state.working.insert(agent.clone(), *deadline as f64);
                acquired.push(agent.clone());
            }
        }
        Ok(BatchOutcome { members: acquired })
    }

    async fn move_agent_conditional(
        &self,
        agent: &str,
        expected: i64,
        new_score: i64,
    ) -> Result<bool, StoreError> {
        self.check_script(Script::MoveAgentConditional)?;
        let mut state = self.state.lock();
        if !matches_expected(state.working.get(agent), expected) {
            return Ok(false);
        }
        state.working.remove(agent);
        state.waiting.insert(agent.to_string(), new_score as f64);
        Ok(true)
    }

    async fn remove_agents_conditional(
        &self,
        set: SetKind,
        pairs: &[(String, i64)],
    ) -> Result<BatchOutcome, StoreError> {
        self.check_script(Script::RemoveAgentsConditional)?;
        let mut state = self.state.lock();
        let target = state.set_mut(set);
        let mut removed = Vec::new();
        for (agent, expected) in pairs {
            if matches_expected(target.get(agent), *expected) {
                target.remove(agent);
                removed.push(agent.clone());
            }
        }
        Ok(BatchOutcome { members: removed })
    }

    async fn presence(&self, agents: &[String]) -> Result<Vec<bool>, StoreError> {
        self.check_script(Script::Presence)?;
        let state = self.state.lock();
        Ok(agents
            .iter()
            .map(|a| state.working.contains_key(a) || state.waiting.contains_key(a))
            .collect())
    }

    async fn scores(&self, agents: &[String]) -> Result<Vec<AgentScores>, StoreError> {
        self.check_script(Script::Scores)?;
        let state = self.state.lock();
        Ok(agents
            .iter()
            .map(|a| AgentScores {
                working: state
                    .working
                    .get(a)
                    .and_then(|s| StoredScore::from_f64(*s).value()),
                waiting: state
                    .waiting
                    .get(a)
                    .and_then(|s| StoredScore::from_f64(*s).value()),
            })
            .collect())
    }

    async fn range_by_score(
        &self,
        set: SetKind,
        max: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, StoredScore)>, StoreError> {
        self.check("zrangebyscore")?;
        let state = self.state.lock();
        Ok(state
            .sorted(set)
            .into_iter()
            .filter(|(_, score)| *score <= max as f64)
            .skip(offset)
            .take(limit)
            .map(|(member, score)| (member, StoredScore::from_f64(score)))
            .collect())
    }

    async fn range_from_score(
        &self,
        set: SetKind,
        min: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.check("zrangebyscore")?;
        let state = self.state.lock();
        Ok(state
            .sorted(set)
            .into_iter()
            .filter(|(_, score)| *score >= min as f64)
            .take(limit)
            .filter_map(|(member, score)| StoredScore::from_f64(score).value().map(|s| (member, s)))
            .collect())
    }

    async fn score_of(&self, set: SetKind, agent: &str) -> Result<Option<StoredScore>, StoreError> {
        self.check("zscore")?;
        Ok(self
            .state
            .lock()
            .set(set)
            .get(agent)
            .map(|s| StoredScore::from_f64(*s)))
    }

    async fn cardinality(&self, set: SetKind) -> Result<usize, StoreError> {
        self.check("zcard")?;
        Ok(self.state.lock().set(set).len())
    }

    async fn random_members(&self, set: SetKind, count: usize) -> Result<Vec<String>, StoreError> {
        self.check("zrandmember")?;
        let mut members: Vec<String> = self.state.lock().set(set).keys().cloned().collect();
        members.shuffle(&mut rand::rng());
        members.truncate(count);
        Ok(members)
    }

    async fn try_acquire_leadership(&self, token: &str, ttl_ms: i64) -> Result<bool, StoreError> {
        self.check("set_nx")?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if let Some((_, expires)) = &state.leader {
            if *expires > now {
                return Ok(false);
            }
        }
        state.leader = Some((token.to_string(), now + ttl_ms.max(1)));
        Ok(true)
    }

    async fn release_leadership(&self, token: &str) -> Result<bool, StoreError> {
        self.check_script(Script::ReleaseLeadership)?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let held = matches!(&state.leader, Some((holder, expires)) if holder == token && *expires > now);
        if held {
            state.leader = None;
        }
        Ok(held)
    }
}
