//! Redis ring store
//!
//! Layout under `cshash:ring:{ring_key}`:
//! - `...` sorted set, one member per occupied score: a JSON document
//!   `{"score": s, "ids": ["name_1", ...]}` with the occupants in insertion
//!   order
//! - `...:replicas` hash, real node -> replica count
//! - `...:data:{node}` set of keys owned by a real node
//! - `...:version` ring version counter
//! - `...:lock` lock token (`SET NX EX`)
//!
//! Several coordinators may share one ring through the same Redis; the ring
//! lock serializes their structural changes.

use super::{LockToken, RingEntry, RingStore};
use crate::error::{RingError, RingResult};
use crate::ring::{Score, VirtualNodeId};
use async_trait::async_trait;
use redis::Client;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Delay between lock attempts while another holder owns the ring
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Deletes the lock only if it still carries our token
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Sorted set member describing one occupied score
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScoreMember {
    score: Score,
    ids: Vec<String>,
}

impl ScoreMember {
    fn parse(raw: &str) -> RingResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    fn encode(&self) -> RingResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn occupants(&self) -> RingResult<Vec<VirtualNodeId>> {
        self.ids.iter().map(|id| id.parse()).collect()
    }

    /// First occupant, the owner of the score
    fn entry(&self) -> RingResult<Option<RingEntry>> {
        match self.ids.first() {
            Some(id) => Ok(Some(RingEntry::new(self.score, id.parse()?))),
            None => Ok(None),
        }
    }
}

/// Redis-backed ring store
pub struct RedisRingStore {
    client: Client,
    prefix: String,
}

impl RedisRingStore {
    /// Connect and verify the server answers
    pub async fn new(url: &str, ring_key: &str) -> RingResult<Self> {
        let client = Client::open(url)
            .map_err(|e| RingError::Config(format!("Failed to connect to Redis: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RingError::Config(format!("Failed to connect to Redis: {}", e)))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RingError::Config(format!("Redis ping failed: {}", e)))?;

        Ok(Self {
            client,
            prefix: format!("cshash:ring:{}", ring_key),
        })
    }

    fn ring_key(&self) -> &str {
        &self.prefix
    }

    fn lock_key(&self) -> String {
        format!("{}:lock", self.prefix)
    }

    fn version_key(&self) -> String {
        format!("{}:version", self.prefix)
    }

    fn replicas_key(&self) -> String {
        format!("{}:replicas", self.prefix)
    }

    fn data_key(&self, node: &str) -> String {
        format!("{}:data:{}", self.prefix, node)
    }

    async fn get_conn(&self) -> RingResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error("connection"))
    }

    /// Raw member stored at exactly `score`
    async fn member_at(
        &self,
        conn: &mut MultiplexedConnection,
        score: Score,
    ) -> RingResult<Option<(String, ScoreMember)>> {
        let raw: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.ring_key())
            .arg(score)
            .arg(score)
            .query_async(conn)
            .await
            .map_err(store_error("zrangebyscore"))?;

        match raw.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some((one.clone(), ScoreMember::parse(one)?))),
            _ => Err(RingError::Store(format!(
                "{} members stored at score {}",
                raw.len(),
                score
            ))),
        }
    }

    /// First member of a range query, falling back to the member at rank
    /// `wrap_rank` (0 = lowest, -1 = highest) when the range is empty
    async fn first_or_wrap(
        &self,
        conn: &mut MultiplexedConnection,
        range: redis::Cmd,
        wrap_rank: isize,
    ) -> RingResult<Option<ScoreMember>> {
        let raw: Vec<String> = range
            .query_async(conn)
            .await
            .map_err(store_error("range"))?;
        if let Some(first) = raw.first() {
            return Ok(Some(ScoreMember::parse(first)?));
        }

        let raw: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.ring_key())
            .arg(wrap_rank)
            .arg(wrap_rank)
            .query_async(conn)
            .await
            .map_err(store_error("zrange"))?;
        raw.first().map(|m| ScoreMember::parse(m)).transpose()
    }

    /// Replace the member at `score` (or drop it when `ids` is empty) and
    /// bump the version
    async fn rewrite_member(
        &self,
        conn: &mut MultiplexedConnection,
        old: Option<&str>,
        member: &ScoreMember,
    ) -> RingResult<i64> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(old) = old {
            pipe.cmd("ZREM").arg(self.ring_key()).arg(old).ignore();
        }
        if !member.ids.is_empty() {
            pipe.cmd("ZADD")
                .arg(self.ring_key())
                .arg(member.score)
                .arg(member.encode()?)
                .ignore();
        }
        pipe.cmd("INCR").arg(self.version_key());

        let (version,): (i64,) = pipe
            .query_async(conn)
            .await
            .map_err(store_error("rewrite score"))?;
        Ok(version)
    }
}

fn store_error(op: &'static str) -> impl FnOnce(redis::RedisError) -> RingError {
    move |e| RingError::Store(format!("redis {} failed: {}", op, e))
}

#[async_trait]
impl RingStore for RedisRingStore {
    async fn lock(&self, expire: Duration) -> RingResult<LockToken> {
        let mut conn = self.get_conn().await?;
        let token = LockToken::generate();
        let deadline = Instant::now() + expire;

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(self.lock_key())
                .arg(token.to_string())
                .arg("NX")
                .arg("EX")
                .arg(expire.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(store_error("lock"))?;

            if acquired.is_some() {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                return Err(RingError::LockTimeout(expire));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn unlock(&self, token: &LockToken) -> RingResult<()> {
        let mut conn = self.get_conn().await?;
        let released: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(self.lock_key())
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("unlock"))?;

        if released == 0 {
            // expired and possibly taken by another holder
            return Err(RingError::LockNotHeld);
        }
        Ok(())
    }

    async fn add_virtual_node(&self, score: Score, vnode: &VirtualNodeId) -> RingResult<()> {
        let mut conn = self.get_conn().await?;
        let id = vnode.to_string();

        let (old, mut member) = match self.member_at(&mut conn, score).await? {
            Some((raw, member)) => (Some(raw), member),
            None => (
                None,
                ScoreMember {
                    score,
                    ids: Vec::new(),
                },
            ),
        };
        if member.ids.contains(&id) {
            return Ok(());
        }

        member.ids.push(id);
        let version = self
            .rewrite_member(&mut conn, old.as_deref(), &member)
            .await?;
        debug!(score, vnode = %vnode, version, "virtual node added");
        Ok(())
    }

    async fn remove_virtual_node(&self, score: Score, vnode: &VirtualNodeId) -> RingResult<()> {
        let mut conn = self.get_conn().await?;
        let id = vnode.to_string();

        let Some((old, mut member)) = self.member_at(&mut conn, score).await? else {
            return Ok(());
        };
        let Some(pos) = member.ids.iter().position(|existing| *existing == id) else {
            return Ok(());
        };

        member.ids.remove(pos);
        let version = self.rewrite_member(&mut conn, Some(&old), &member).await?;
        debug!(score, vnode = %vnode, version, "virtual node removed");
        Ok(())
    }

    async fn virtual_nodes(&self, score: Score) -> RingResult<Vec<VirtualNodeId>> {
        let mut conn = self.get_conn().await?;
        match self.member_at(&mut conn, score).await? {
            Some((_, member)) => member.occupants(),
            None => Ok(Vec::new()),
        }
    }

    async fn find_virtual_node(&self, score: Score) -> RingResult<VirtualNodeId> {
        let mut conn = self.get_conn().await?;
        let mut range = redis::cmd("ZRANGEBYSCORE");
        range
            .arg(self.ring_key())
            .arg(score)
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(1);

        let member = self
            .first_or_wrap(&mut conn, range, 0)
            .await?
            .ok_or(RingError::VirtualNodeNotFound(score))?;
        member
            .entry()?
            .map(|entry| entry.vnode)
            .ok_or(RingError::VirtualNodeNotFound(score))
    }

    async fn floor(&self, score: Score) -> RingResult<Option<RingEntry>> {
        let mut conn = self.get_conn().await?;
        let mut range = redis::cmd("ZREVRANGEBYSCORE");
        range
            .arg(self.ring_key())
            .arg(format!("({}", score))
            .arg("-inf")
            .arg("LIMIT")
            .arg(0)
            .arg(1);

        match self.first_or_wrap(&mut conn, range, -1).await? {
            Some(member) if member.score != score => member.entry(),
            _ => Ok(None),
        }
    }

    async fn ceiling(&self, score: Score) -> RingResult<Option<RingEntry>> {
        let mut conn = self.get_conn().await?;
        let mut range = redis::cmd("ZRANGEBYSCORE");
        range
            .arg(self.ring_key())
            .arg(format!("({}", score))
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(1);

        match self.first_or_wrap(&mut conn, range, 0).await? {
            Some(member) if member.score != score => member.entry(),
            _ => Ok(None),
        }
    }

    async fn add_real_node(&self, name: &str, replicas: u32) -> RingResult<()> {
        let mut conn = self.get_conn().await?;
        let _: () = redis::cmd("HSET")
            .arg(self.replicas_key())
            .arg(name)
            .arg(replicas)
            .query_async(&mut conn)
            .await
            .map_err(store_error("hset"))?;
        Ok(())
    }

    async fn real_nodes(&self) -> RingResult<HashMap<String, u32>> {
        let mut conn = self.get_conn().await?;
        redis::cmd("HGETALL")
            .arg(self.replicas_key())
            .query_async(&mut conn)
            .await
            .map_err(store_error("hgetall"))
    }

    async fn real_node(&self, name: &str) -> RingResult<Option<u32>> {
        let mut conn = self.get_conn().await?;
        redis::cmd("HGET")
            .arg(self.replicas_key())
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(store_error("hget"))
    }

    async fn remove_real_node(&self, name: &str) -> RingResult<()> {
        let mut conn = self.get_conn().await?;
        let _: () = redis::cmd("HDEL")
            .arg(self.replicas_key())
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(store_error("hdel"))?;
        Ok(())
    }

    async fn add_data(&self, name: &str, keys: &HashSet<String>) -> RingResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn().await?;
        let _: () = redis::cmd("SADD")
            .arg(self.data_key(name))
            .arg(keys.iter().collect::<Vec<_>>())
            .query_async(&mut conn)
            .await
            .map_err(store_error("sadd"))?;
        Ok(())
    }

    async fn data(&self, name: &str) -> RingResult<HashSet<String>> {
        let mut conn = self.get_conn().await?;
        redis::cmd("SMEMBERS")
            .arg(self.data_key(name))
            .query_async(&mut conn)
            .await
            .map_err(store_error("smembers"))
    }

    async fn remove_data(&self, name: &str, keys: &HashSet<String>) -> RingResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn().await?;
        let _: () = redis::cmd("SREM")
            .arg(self.data_key(name))
            .arg(keys.iter().collect::<Vec<_>>())
            .query_async(&mut conn)
            .await
            .map_err(store_error("srem"))?;
        Ok(())
    }

    async fn version(&self) -> RingResult<i64> {
        let mut conn = self.get_conn().await?;
        let version: Option<i64> = redis::cmd("GET")
            .arg(self.version_key())
            .query_async(&mut conn)
            .await
            .map_err(store_error("get version"))?;
        Ok(version.unwrap_or(0))
    }

    async fn set_version(&self, version: i64) -> RingResult<()> {
        let mut conn = self.get_conn().await?;
        let _: () = redis::cmd("SET")
            .arg(self.version_key())
            .arg(version)
            .query_async(&mut conn)
            .await
            .map_err(store_error("set version"))?;
        Ok(())
    }
}
