//! Redis-backed agent store.
//!
//! Mutations run through the Lua catalog in [`crate::scheduler::scripts`];
//! plain reads (`ZRANGEBYSCORE`, `ZSCORE`, `ZRANDMEMBER`, `TIME`) are issued
//! directly. The `ConnectionManager` reconnects on its own and is cloned per
//! call.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Value;

use super::{AgentScores, AgentStore, BatchOutcome, RescheduleOutcome, SetKind, StoredScore};
use crate::error::StoreError;
use crate::scheduler::keys::SchedulerKeys;
use crate::scheduler::scripts::{
    value_to_array, value_to_i64, value_to_members, value_to_string, Script, ScriptManager,
};

/// Agent store backed by Redis sorted sets.
pub struct RedisAgentStore {
    conn: ConnectionManager,
    scripts: ScriptManager<ConnectionManager>,
    keys: SchedulerKeys,
    set_keys: Vec<String>,
}

impl RedisAgentStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Redis` if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str, keys: SchedulerKeys) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(conn, keys))
    }

    /// Creates a store from an existing connection manager.
    pub fn from_connection(conn: ConnectionManager, keys: SchedulerKeys) -> Self {
        let set_keys = vec![keys.working.clone(), keys.waiting.clone()];
        Self {
            scripts: ScriptManager::new(conn.clone()),
            conn,
            keys,
            set_keys,
        }
    }

    pub fn keys(&self) -> &SchedulerKeys {
        &self.keys
    }

    pub fn script_generation(&self) -> u64 {
        self.scripts.generation()
    }

    fn key_for(&self, set: SetKind) -> &str {
        match set {
            SetKind::Waiting => &self.keys.waiting,
            SetKind::Working => &self.keys.working,
        }
    }

    async fn eval(&self, script: Script, args: Vec<String>) -> Result<Value, StoreError> {
        self.scripts.eval(script, &self.set_keys, &args).await
    }
}

fn flatten_pairs(pairs: &[(String, i64)]) -> Vec<String> {
    let mut args = Vec::with_capacity(pairs.len() * 2);
    for (member, score) in pairs {
        args.push(member.clone());
        args.push(score.to_string());
    }
    args
}

fn parse_optional_score(value: &Value) -> Option<i64> {
    let raw = value_to_string(value)?;
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>()
        .ok()
        .and_then(|v| StoredScore::from_f64(v).value())
}

#[async_trait]
impl AgentStore for RedisAgentStore {
    async fn server_time_ms(&self) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1000 + micros / 1000)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.scripts.initialize().await
    }

    fn scripts_loaded(&self) -> usize {
        self.scripts.loaded_count()
    }

    async fn add_agent(&self, agent: &str, score: i64) -> Result<bool, StoreError> {
        let reply = self
            .eval(Script::AddAgent, vec![agent.to_string(), score.to_string()])
            .await?;
        Ok(value_to_i64(&reply) == Some(1))
    }

    async fn add_agents(&self, pairs: &[(String, i64)]) -> Result<BatchOutcome, StoreError> {
        if pairs.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let reply = self.eval(Script::AddAgents, flatten_pairs(pairs)).await?;
        Ok(BatchOutcome {
            members: value_to_members(Script::AddAgents, &reply)?,
        })
    }

    async fn remove_agent(&self, agent: &str) -> Result<(), StoreError> {
        self.eval(Script::RemoveAgent, vec![agent.to_string()])
            .await?;
        Ok(())
    }

    async fn reschedule_agent(
        &self,
        agent: &str,
        score: i64,
    ) -> Result<RescheduleOutcome, StoreError> {
        let reply = self
            .eval(
                Script::RescheduleAgent,
                vec![agent.to_string(), score.to_string()],
            )
            .await?;
        match value_to_string(&reply).as_deref() {
            Some("exists") => Ok(RescheduleOutcome::Exists),
            Some("moved") => Ok(RescheduleOutcome::Moved),
            Some("added") => Ok(RescheduleOutcome::Added),
            _ => Err(StoreError::UnexpectedResult {
                script: Script::RescheduleAgent.name(),
                detail: format!("{:?}", reply),
            }),
        }
    }

    async fn acquire_agent(&self, agent: &str, deadline: i64) -> Result<Option<i64>, StoreError> {
        let reply = self
            .eval(
                Script::AcquireAgent,
                vec![agent.to_string(), deadline.to_string()],
            )
            .await?;
        match reply {
            Value::Nil => Ok(None),
            other => Ok(value_to_i64(&other)),
        }
    }

    async fn acquire_agents(&self, pairs: &[(String, i64)]) -> Result<BatchOutcome, StoreError> {
        if pairs.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let reply = self.eval(Script::AcquireAgents, flatten_pairs(pairs)).await?;
        Ok(BatchOutcome {
            members: value_to_members(Script::AcquireAgents, &reply)?,
        })
    }

    async fn move_agent_conditional(
        &self,
        agent: &str,
        expected: i64,
        new_score: i64,
    ) -> Result<bool, StoreError> {
        let reply = self
            .eval(
                Script::MoveAgentConditional,
                vec![agent.to_string(), expected.to_string(), new_score.to_string()],
            )
            .await?;
        Ok(value_to_i64(&reply) == Some(1))
    }

    async fn remove_agents_conditional(
        &self,
        set: SetKind,
        pairs: &[(String, i64)],
    ) -> Result<BatchOutcome, StoreError> {
        if pairs.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let keys = vec![self.key_for(set).to_string()];
        let reply = self
            .scripts
            .eval(Script::RemoveAgentsConditional, &keys, &flatten_pairs(pairs))
            .await?;
        Ok(BatchOutcome {
            members: value_to_members(Script::RemoveAgentsConditional, &reply)?,
        })
    }

    async fn presence(&self, agents: &[String]) -> Result<Vec<bool>, StoreError> {
        if agents.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self.eval(Script::Presence, agents.to_vec()).await?;
        let items = value_to_array(Script::Presence, &reply)?;
        if items.len() != agents.len() {
            return Err(StoreError::UnexpectedResult {
                script: Script::Presence.name(),
                detail: format!("expected {} flags, got {}", agents.len(), items.len()),
            });
        }
        Ok(items.iter().map(|v| value_to_i64(v) == Some(1)).collect())
    }

    async fn scores(&self, agents: &[String]) -> Result<Vec<AgentScores>, StoreError> {
        if agents.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self.eval(Script::Scores, agents.to_vec()).await?;
        let items = value_to_array(Script::Scores, &reply)?;
        if items.len() != agents.len() * 2 {
            return Err(StoreError::UnexpectedResult {
                script: Script::Scores.name(),
                detail: format!("expected {} values, got {}", agents.len() * 2, items.len()),
            });
        }
        Ok(items
            .chunks(2)
            .map(|pair| AgentScores {
                working: parse_optional_score(&pair[0]),
                waiting: parse_optional_score(&pair[1]),
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
        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key_for(set))
            .arg("-inf")
            .arg(max)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(offset)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(member, score)| (member, StoredScore::from_f64(score)))
            .collect())
    }

    async fn range_from_score(
        &self,
        set: SetKind,
        min: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key_for(set))
            .arg(min)
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(member, score)| StoredScore::from_f64(score).value().map(|s| (member, s)))
            .collect())
    }

    async fn score_of(&self, set: SetKind, agent: &str) -> Result<Option<StoredScore>, StoreError> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(self.key_for(set))
            .arg(agent)
            .query_async(&mut conn)
            .await?;
        Ok(score.map(StoredScore::from_f64))
    }

    async fn cardinality(&self, set: SetKind) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let count: usize = redis::cmd("ZCARD")
            .arg(self.key_for(set))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn random_members(&self, set: SetKind, count: usize) -> Result<Vec<String>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let sampled: Result<Vec<String>, redis::RedisError> = redis::cmd("ZRANDMEMBER")
            .arg(self.key_for(set))
            .arg(count)
            .query_async(&mut conn)
            .await;
        match sampled {
            Ok(members) => Ok(members),
            // Servers older than 6.2 lack ZRANDMEMBER: take a window instead.
            Err(e) if e.kind() == redis::ErrorKind::ResponseError => {
                let total = self.cardinality(set).await?;
                if total == 0 {
                    return Ok(Vec::new());
                }
                let start = total.saturating_sub(count) / 2;
                let members: Vec<String> = redis::cmd("ZRANGE")
                    .arg(self.key_for(set))
                    .arg(start)
                    .arg(start + count - 1)
                    .query_async(&mut conn)
                    .await?;
                Ok(members)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn try_acquire_leadership(&self, token: &str, ttl_ms: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.keys.cleanup_leader)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_leadership(&self, token: &str) -> Result<bool, StoreError> {
        let keys = vec![self.keys.cleanup_leader.clone()];
        let reply = self
            .scripts
            .eval(Script::ReleaseLeadership, &keys, &[token.to_string()])
            .await?;
        Ok(value_to_i64(&reply) == Some(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_pairs_orders_member_then_score() {
        let args = flatten_pairs(&[("a".to_string(), 10), ("b".to_string(), 20)]);
        assert_eq!(args, vec!["a", "10", "b", "20"]);
    }

    #[test]
    fn test_parse_optional_score() {
        assert_eq!(parse_optional_score(&Value::Data(b"".to_vec())), None);
        assert_eq!(parse_optional_score(&Value::Data(b"1700000000".to_vec())), Some(1700000000));
        assert_eq!(parse_optional_score(&Value::Data(b"12.5".to_vec())), None);
        assert_eq!(parse_optional_score(&Value::Nil), None);
    }
}
