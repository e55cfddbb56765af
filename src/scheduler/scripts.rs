//! Lua script catalog and the SHA cache that runs it.
//!
//! Every mutation of the waiting/working sets goes through one of these
//! scripts so that presence checks and moves happen atomically on the Redis
//! side. [`ScriptManager`] loads the catalog once and evaluates by SHA; when
//! Redis answers `NOSCRIPT` (restart, `SCRIPT FLUSH`, failover) it reloads
//! the whole catalog once per generation and retries, falling back to plain
//! `EVAL` if the retry fails as well.
//!
//! Scripts never return Lua `nil` inside arrays: absent values are encoded
//! as empty strings so array positions stay aligned with the input.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Value};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::metrics::SchedulerMetrics;

/// KEYS[1] = working, KEYS[2] = waiting. ARGV = agent, score.
const ADD_AGENT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) or redis.call('ZSCORE', KEYS[2], ARGV[1]) then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// KEYS[1] = working, KEYS[2] = waiting. ARGV = agent1, score1, agent2, score2, ...
const ADD_AGENTS: &str = r#"
local added = {}
for i = 1, #ARGV, 2 do
  local member = ARGV[i]
  local score = ARGV[i + 1]
  if tonumber(score) ~= nil and tonumber(member) == nil then
    if not redis.call('ZSCORE', KEYS[1], member) and not redis.call('ZSCORE', KEYS[2], member) then
      redis.call('ZADD', KEYS[2], score, member)
      added[#added + 1] = member
    end
  end
end
return added
"#;

/// KEYS[1] = working, KEYS[2] = waiting. ARGV = agent.
const REMOVE_AGENT: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
"#;

/// KEYS[1] = working, KEYS[2] = waiting. ARGV = agent, score.
const RESCHEDULE_AGENT: &str = r#"
if redis.call('ZSCORE', KEYS[2], ARGV[1]) then
  return 'exists'
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
  return 'moved'
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 'added'
"#;

/// KEYS[1] = working, KEYS[2] = waiting. ARGV = agent, deadline.
const ACQUIRE_AGENT: &str = r#"
if redis.call('ZREM', KEYS[2], ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return ARGV[2]
end
return false
"#;

/// KEYS[1] = working, KEYS[2] = waiting. ARGV = agent, expected, new score.
const MOVE_AGENT_CONDITIONAL: &str = r#"
local current = redis.call('ZSCORE', KEYS[1], ARGV[1])
if current and tonumber(current) == tonumber(ARGV[2]) then
  redis.call('ZREM', KEYS[1], ARGV[1])
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
  return 1
end
return 0
"#;

/// KEYS[1] = target set. ARGV = agent1, expected1, ...
const REMOVE_AGENTS_CONDITIONAL: &str = r#"
local removed = {}
for i = 1, #ARGV, 2 do
  local member = ARGV[i]
  local current = redis.call('ZSCORE', KEYS[1], member)
  if current and tonumber(current) == tonumber(ARGV[i + 1]) then
    redis.call('ZREM', KEYS[1], member)
    removed[#removed + 1] = member
  end
end
return removed
"#;

/// KEYS[1] = working, KEYS[2] = waiting. ARGV = agent1, deadline1, ...
const ACQUIRE_AGENTS: &str = r#"
local acquired = {}
for i = 1, #ARGV, 2 do
  local member = ARGV[i]
  local deadline = ARGV[i + 1]
  if tonumber(deadline) ~= nil and redis.call('ZREM', KEYS[2], member) == 1 then
    redis.call('ZADD', KEYS[1], deadline, member)
    acquired[#acquired + 1] = member
  end
end
return acquired
"#;

/// KEYS[1] = working, KEYS[2] = waiting. ARGV = agents. Returns 1/0 per agent.
const PRESENCE: &str = r#"
local present = {}
for i = 1, #ARGV do
  if redis.call('ZSCORE', KEYS[1], ARGV[i]) or redis.call('ZSCORE', KEYS[2], ARGV[i]) then
    present[i] = 1
  else
    present[i] = 0
  end
end
return present
"#;

/// KEYS[1] = working, KEYS[2] = waiting. ARGV = agents.
/// Returns working, waiting score pairs per agent ('' when absent).
const SCORES: &str = r#"
local out = {}
for i = 1, #ARGV do
  out[#out + 1] = redis.call('ZSCORE', KEYS[1], ARGV[i]) or ''
  out[#out + 1] = redis.call('ZSCORE', KEYS[2], ARGV[i]) or ''
end
return out
"#;

/// KEYS[1] = leader key. ARGV = token.
const RELEASE_LEADERSHIP: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// The script catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    AddAgent,
    AddAgents,
    RemoveAgent,
    RescheduleAgent,
    AcquireAgent,
    MoveAgentConditional,
    RemoveAgentsConditional,
    AcquireAgents,
    Presence,
    Scores,
    ReleaseLeadership,
}

impl Script {
    pub const ALL: [Script; 11] = [
        Script::AddAgent,
        Script::AddAgents,
        Script::RemoveAgent,
        Script::RescheduleAgent,
        Script::AcquireAgent,
        Script::MoveAgentConditional,
        Script::RemoveAgentsConditional,
        Script::AcquireAgents,
        Script::Presence,
        Script::Scores,
        Script::ReleaseLeadership,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Script::AddAgent => "add_agent",
            Script::AddAgents => "add_agents",
            Script::RemoveAgent => "remove_agent",
            Script::RescheduleAgent => "reschedule_agent",
            Script::AcquireAgent => "acquire_agent",
            Script::MoveAgentConditional => "move_agent_conditional",
            Script::RemoveAgentsConditional => "remove_agents_conditional",
            Script::AcquireAgents => "acquire_agents",
            Script::Presence => "presence",
            Script::Scores => "scores",
            Script::ReleaseLeadership => "release_leadership",
        }
    }

    pub fn body(self) -> &'static str {
        match self {
            Script::AddAgent => ADD_AGENT,
            Script::AddAgents => ADD_AGENTS,
            Script::RemoveAgent => REMOVE_AGENT,
            Script::RescheduleAgent => RESCHEDULE_AGENT,
            Script::AcquireAgent => ACQUIRE_AGENT,
            Script::MoveAgentConditional => MOVE_AGENT_CONDITIONAL,
            Script::RemoveAgentsConditional => REMOVE_AGENTS_CONDITIONAL,
            Script::AcquireAgents => ACQUIRE_AGENTS,
            Script::Presence => PRESENCE,
            Script::Scores => SCORES,
            Script::ReleaseLeadership => RELEASE_LEADERSHIP,
        }
    }
}

/// Transport for script commands. Implemented for Redis connections and
/// by test doubles.
#[async_trait]
pub trait ScriptBackend: Send + Sync {
    async fn load(&self, body: &str) -> Result<String, RedisError>;

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String])
        -> Result<Value, RedisError>;

    async fn eval_body(&self, body: &str, keys: &[String], args: &[String])
        -> Result<Value, RedisError>;
}

#[async_trait]
impl ScriptBackend for ConnectionManager {
    async fn load(&self, body: &str) -> Result<String, RedisError> {
        let mut conn = self.clone();
        redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(body)
            .query_async::<_, String>(&mut conn)
            .await
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, RedisError> {
        let mut conn = self.clone();
        redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async::<_, Value>(&mut conn)
            .await
    }

    async fn eval_body(
        &self,
        body: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, RedisError> {
        let mut conn = self.clone();
        redis::cmd("EVAL")
            .arg(body)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async::<_, Value>(&mut conn)
            .await
    }
}

/// Loads the catalog and evaluates scripts by SHA with NOSCRIPT recovery.
pub struct ScriptManager<B> {
    backend: B,
    shas: RwLock<HashMap<Script, String>>,
    generation: AtomicU64,
    reload_lock: tokio::sync::Mutex<()>,
    metrics: SchedulerMetrics,
}

impl<B: ScriptBackend> ScriptManager<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            shas: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            reload_lock: tokio::sync::Mutex::new(()),
            metrics: SchedulerMetrics::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of successful catalog loads so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn loaded_count(&self) -> usize {
        self.shas.read().len()
    }

    pub fn is_initialized(&self) -> bool {
        self.loaded_count() == Script::ALL.len()
    }

    /// Loads the catalog unless it is already loaded.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        if self.is_initialized() {
            return Ok(());
        }
        let _guard = self.reload_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        self.load_all().await?;
        info!(scripts = Script::ALL.len(), "Lua scripts loaded");
        Ok(())
    }

    /// Evaluates `script`, recovering from an evicted script cache.
    pub async fn eval(
        &self,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, StoreError> {
        let started = Instant::now();
        let sha = self
            .shas
            .read()
            .get(&script)
            .cloned()
            .ok_or(StoreError::ScriptsNotInitialized)?;
        let observed = self.generation();

        let result = match self.backend.eval_sha(&sha, keys, args).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                self.recover(script, observed, keys, args).await
            }
            Err(e) => Err(StoreError::from(e)),
        };

        match &result {
            Ok(_) => self.metrics.record_script_eval(script.name(), started.elapsed()),
            Err(e) => {
                self.metrics.record_script_error(script.name());
                debug!(script = script.name(), error = %e, "Script evaluation failed");
            }
        }
        result
    }

    async fn recover(
        &self,
        script: Script,
        observed: u64,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, StoreError> {
        if let Err(e) = self.reload_if_stale(observed).await {
            warn!(script = script.name(), error = %e, "Script reload failed; using EVAL");
            return Ok(self.backend.eval_body(script.body(), keys, args).await?);
        }

        let sha = self.shas.read().get(&script).cloned();
        if let Some(sha) = sha {
            match self.backend.eval_sha(&sha, keys, args).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(script = script.name(), error = %e, "EVALSHA retry failed; using EVAL");
                }
            }
        }
        Ok(self.backend.eval_body(script.body(), keys, args).await?)
    }

    /// Reloads the catalog unless another caller already did so after
    /// `observed` was read. Returns true if this call reloaded.
    async fn reload_if_stale(&self, observed: u64) -> Result<bool, StoreError> {
        let _guard = self.reload_lock.lock().await;
        if self.generation() != observed {
            return Ok(false);
        }
        warn!(generation = observed, "Script cache missing on store; reloading catalog");
        self.load_all().await?;
        self.metrics.record_script_reload();
        Ok(true)
    }

    async fn load_all(&self) -> Result<(), StoreError> {
        let mut loaded = HashMap::with_capacity(Script::ALL.len());
        for script in Script::ALL {
            let sha = self.backend.load(script.body()).await?;
            loaded.insert(script, sha);
        }
        *self.shas.write() = loaded;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Okay => Some("OK".to_string()),
        _ => None,
    }
}

pub(crate) fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Data(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
        Value::Status(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parses an array reply of member names.
pub(crate) fn value_to_members(script: Script, value: &Value) -> Result<Vec<String>, StoreError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(items) => items
            .iter()
            .map(|item| {
                value_to_string(item).ok_or_else(|| StoreError::UnexpectedResult {
                    script: script.name(),
                    detail: format!("non-string member {:?}", item),
                })
            })
            .collect(),
        other => Err(StoreError::UnexpectedResult {
            script: script.name(),
            detail: format!("expected array, got {:?}", other),
        }),
    }
}

/// Parses an array reply, keeping per-position values.
pub(crate) fn value_to_array(script: Script, value: &Value) -> Result<Vec<Value>, StoreError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(items) => Ok(items.clone()),
        other => Err(StoreError::UnexpectedResult {
            script: script.name(),
            detail: format!("expected array, got {:?}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// In-process stand-in for the Redis script cache.
    #[derive(Default)]
    struct FakeBackend {
        cache: Mutex<HashMap<String, String>>,
        loads: AtomicUsize,
        direct_evals: AtomicUsize,
        fail_loads: std::sync::atomic::AtomicBool,
        always_noscript: std::sync::atomic::AtomicBool,
    }

    impl FakeBackend {
        fn flush(&self) {
            self.cache.lock().clear();
        }
    }

    #[async_trait]
    impl ScriptBackend for FakeBackend {
        async fn load(&self, body: &str) -> Result<String, RedisError> {
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(RedisError::from((ErrorKind::IoError, "connection reset")));
            }
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            let sha = format!("sha-{}", n);
            self.cache.lock().insert(sha.clone(), body.to_string());
            Ok(sha)
        }

        async fn eval_sha(
            &self,
            sha: &str,
            _keys: &[String],
            _args: &[String],
        ) -> Result<Value, RedisError> {
            if self.always_noscript.load(Ordering::SeqCst) || !self.cache.lock().contains_key(sha)
            {
                return Err(RedisError::from((
                    ErrorKind::NoScriptError,
                    "NOSCRIPT No matching script",
                )));
            }
            Ok(Value::Int(1))
        }

        async fn eval_body(
            &self,
            _body: &str,
            _keys: &[String],
            _args: &[String],
        ) -> Result<Value, RedisError> {
            self.direct_evals.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(2))
        }
    }

    fn keys() -> Vec<String> {
        vec!["working".to_string(), "waiting".to_string()]
    }

    #[tokio::test]
    async fn test_eval_requires_initialization() {
        let manager = ScriptManager::new(FakeBackend::default());
        let err = manager
            .eval(Script::AddAgent, &keys(), &[])
            .await
            .expect_err("not initialized");
        assert!(matches!(err, StoreError::ScriptsNotInitialized));
    }

    #[tokio::test]
    async fn test_initialize_loads_catalog_once() {
        let manager = ScriptManager::new(FakeBackend::default());
        manager.initialize().await.expect("init");
        manager.initialize().await.expect("init again");
        assert_eq!(manager.backend().loads.load(Ordering::SeqCst), Script::ALL.len());
        assert_eq!(manager.generation(), 1);
        assert!(manager.is_initialized());
    }

    #[tokio::test]
    async fn test_noscript_triggers_single_reload() {
        let manager = ScriptManager::new(FakeBackend::default());
        manager.initialize().await.expect("init");
        manager.backend().flush();

        let value = manager
            .eval(Script::AddAgent, &keys(), &[])
            .await
            .expect("recovered");
        assert_eq!(value, Value::Int(1));
        assert_eq!(manager.generation(), 2);

        // Cache is warm again: no further reloads.
        manager
            .eval(Script::RemoveAgent, &keys(), &[])
            .await
            .expect("eval");
        assert_eq!(manager.generation(), 2);
        assert_eq!(
            manager.backend().loads.load(Ordering::SeqCst),
            Script::ALL.len() * 2
        );
    }

    #[tokio::test]
    async fn test_concurrent_noscript_reloads_once() {
        let manager = ScriptManager::new(FakeBackend::default());
        manager.initialize().await.expect("init");
        manager.backend().flush();

        let k = keys();
        let (a, b) = tokio::join!(
            manager.eval(Script::AddAgent, &k, &[]),
            manager.eval(Script::AcquireAgent, &k, &[])
        );
        a.expect("first");
        b.expect("second");
        assert_eq!(manager.generation(), 2);
    }

    #[tokio::test]
    async fn test_falls_back_to_eval_when_retry_fails() {
        let manager = ScriptManager::new(FakeBackend::default());
        manager.initialize().await.expect("init");
        manager.backend().always_noscript.store(true, Ordering::SeqCst);

        let value = manager
            .eval(Script::Scores, &keys(), &[])
            .await
            .expect("direct eval");
        assert_eq!(value, Value::Int(2));
        assert_eq!(manager.backend().direct_evals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_eval_when_reload_fails() {
        let manager = ScriptManager::new(FakeBackend::default());
        manager.initialize().await.expect("init");
        manager.backend().flush();
        manager.backend().fail_loads.store(true, Ordering::SeqCst);

        let value = manager
            .eval(Script::AddAgents, &keys(), &[])
            .await
            .expect("direct eval");
        assert_eq!(value, Value::Int(2));
        assert_eq!(manager.generation(), 1);
    }

    #[test]
    fn test_value_parsing() {
        let reply = Value::Bulk(vec![
            Value::Data(b"a".to_vec()),
            Value::Data(b"b".to_vec()),
        ]);
        let members = value_to_members(Script::AcquireAgents, &reply).expect("members");
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        assert_eq!(value_to_i64(&Value::Data(b"17".to_vec())), Some(17));
        assert_eq!(value_to_i64(&Value::Nil), None);
        assert!(value_to_members(Script::AddAgents, &Value::Int(3)).is_err());
    }
}
