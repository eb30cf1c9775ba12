//! Redis-backed Shared Store
//!
//! Compound primitives run as server-side Lua scripts so each one is atomic.
//! Every call is bounded by the configured command timeout and never retried
//! here; retry policy belongs to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};

use crate::error::{Error, Result};
use crate::store::{ttl_secs, Departed, RecordAction, SessionKeys, SharedStore};

/// Write hash fields only when the hash already exists
const HSET_IF_EXISTS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

/// Delete the set and the extra keys only when the set is empty
const DEL_IF_EMPTY_SET_SCRIPT: &str = r#"
if redis.call('SCARD', KEYS[1]) > 0 then
  return 0
end
redis.call('DEL', unpack(KEYS))
return 1
"#;

// Field names below match `store::fields`.

/// Join a session, claiming leadership when it is free or held by a vanished record.
/// Returns -1 when the record is missing, otherwise 1 if leader and 0 if not.
const JOIN_SESSION_SCRIPT: &str = r#"
local conn = ARGV[1]
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
redis.call('HSET', KEYS[1], 'sessionId', ARGV[2])
for i = 6, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
redis.call('SADD', KEYS[2], conn)
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[4]))

local leader = redis.call('GET', KEYS[3])
if leader and leader ~= conn and redis.call('EXISTS', ARGV[5] .. leader) == 0 then
  redis.call('SREM', KEYS[2], leader)
  leader = false
end

local is_leader = 0
if not leader or leader == conn then
  redis.call('SET', KEYS[3], conn, 'EX', tonumber(ARGV[4]))
  is_leader = 1
else
  redis.call('EXPIRE', KEYS[3], tonumber(ARGV[4]))
end
redis.call('HSET', KEYS[1], 'isLeader', is_leader == 1 and 'true' or 'false')
return is_leader
"#;

/// Take a connection out of a session and hand leadership on if it led.
/// Returns {was_leader, new_leader_or_empty}.
const DEPART_SESSION_SCRIPT: &str = r#"
local conn = ARGV[1]
if ARGV[3] == 'delete' then
  redis.call('DEL', KEYS[1])
  redis.call('SREM', KEYS[4], conn)
elseif redis.call('HGET', KEYS[1], 'sessionId') == ARGV[2] then
  redis.call('HSET', KEYS[1], 'sessionId', '', 'isLeader', 'false')
end
redis.call('SREM', KEYS[2], conn)

if redis.call('GET', KEYS[3]) ~= conn then
  return {0, ''}
end
if ARGV[4] ~= '1' then
  return {1, ''}
end

local best, best_at = nil, nil
for _, id in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  local raw = redis.call('HGET', ARGV[6] .. id, 'connectedAt')
  local at = raw and tonumber(raw)
  if at and (best == nil or at < best_at or (at == best_at and id < best)) then
    best, best_at = id, at
  end
end

if best == nil then
  redis.call('DEL', KEYS[3])
  return {1, ''}
end
redis.call('SET', KEYS[3], best, 'EX', tonumber(ARGV[5]))
redis.call('HSET', ARGV[6] .. best, 'isLeader', 'true')
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[5]))
return {1, best}
"#;

/// Shared store backed by a Redis-compatible server
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
    hset_if_exists: Script,
    del_if_empty_set: Script,
    join_session: Script,
    depart_session: Script,
}

impl RedisStore {
    /// Connect to the server at `url`
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(conn) => conn?,
            Err(_) => return Err(Error::StoreTimeout(timeout)),
        };

        tracing::info!("Connected to shared store at {}", redact_url(url));
        Ok(Self::from_connection(conn, timeout))
    }

    /// Wrap an existing connection manager
    pub fn from_connection(conn: ConnectionManager, timeout: Duration) -> Self {
        Self {
            conn,
            timeout,
            hset_if_exists: Script::new(HSET_IF_EXISTS_SCRIPT),
            del_if_empty_set: Script::new(DEL_IF_EMPTY_SET_SCRIPT),
            join_session: Script::new(JOIN_SESSION_SCRIPT),
            depart_session: Script::new(DEPART_SESSION_SCRIPT),
        }
    }

    /// Round-trip a PING
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run(async move { redis::cmd("PING").query_async::<_, ()>(&mut conn).await })
            .await
    }

    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::StoreTimeout(self.timeout)),
        }
    }
}

/// Hide credentials in a connection URL before logging it
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.run(async move {
            redis::cmd("GET").arg(key).query_async::<_, Option<String>>(&mut conn).await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run(async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.run(async move { redis::cmd("DEL").arg(keys).query_async::<_, usize>(&mut conn).await })
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.run(async move {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs(ttl))
                .query_async::<_, bool>(&mut conn)
                .await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let millis = self
            .run(async move { redis::cmd("PTTL").arg(key).query_async::<_, i64>(&mut conn).await })
            .await?;
        // -2: missing, -1: no expiry
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.run(async move { redis::cmd("EXISTS").arg(key).query_async::<_, bool>(&mut conn).await })
            .await
    }

    async fn put_hash(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        let hset = pipe.cmd("HSET").arg(key);
        for (field, value) in fields {
            hset.arg(*field).arg(value);
        }
        hset.ignore();
        pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(ttl)).ignore();

        self.run(async move { pipe.query_async::<_, ()>(&mut conn).await }).await
    }

    async fn hset_if_exists(&self, key: &str, fields: &[(&str, String)]) -> Result<bool> {
        if fields.is_empty() {
            return self.exists(key).await;
        }
        let mut conn = self.conn.clone();
        let mut invocation = self.hset_if_exists.key(key);
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }
        self.run(async move { invocation.invoke_async::<_, bool>(&mut conn).await }).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        self.run(async move {
            redis::cmd("HGETALL")
                .arg(key)
                .query_async::<_, HashMap<String, String>>(&mut conn)
                .await
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.run(async move {
            redis::cmd("SADD").arg(key).arg(member).query_async::<_, bool>(&mut conn).await
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.run(async move {
            redis::cmd("SREM").arg(key).arg(member).query_async::<_, bool>(&mut conn).await
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.run(async move {
            redis::cmd("SMEMBERS").arg(key).query_async::<_, Vec<String>>(&mut conn).await
        })
        .await
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.run(async move { redis::cmd("SCARD").arg(key).query_async::<_, usize>(&mut conn).await })
            .await
    }

    async fn del_if_empty_set(&self, set_key: &str, extra_keys: &[String]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.del_if_empty_set.key(set_key);
        for key in extra_keys {
            invocation.key(key.as_str());
        }
        self.run(async move { invocation.invoke_async::<_, bool>(&mut conn).await }).await
    }

    async fn join_session(
        &self,
        keys: &SessionKeys,
        connection: &str,
        session: &str,
        updates: &[(&str, String)],
        connection_ttl: Duration,
        session_ttl: Duration,
    ) -> Result<Option<bool>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.join_session.key(keys.record(connection));
        invocation
            .key(&keys.members)
            .key(&keys.leader)
            .arg(connection)
            .arg(session)
            .arg(ttl_secs(connection_ttl))
            .arg(ttl_secs(session_ttl))
            .arg(&keys.record_prefix);
        for (field, value) in updates {
            invocation.arg(*field).arg(value);
        }

        let reply = self
            .run(async move { invocation.invoke_async::<_, i64>(&mut conn).await })
            .await?;
        Ok(match reply {
            -1 => None,
            n => Some(n == 1),
        })
    }

    async fn depart_session(
        &self,
        keys: &SessionKeys,
        connection: &str,
        session: &str,
        record: &RecordAction,
        elect: bool,
        session_ttl: Duration,
    ) -> Result<Departed> {
        let mut conn = self.conn.clone();
        let mut invocation = self.depart_session.key(keys.record(connection));
        invocation.key(&keys.members).key(&keys.leader);
        let mode = match record {
            RecordAction::Clear => "clear",
            RecordAction::Delete { owner_set } => {
                invocation.key(owner_set);
                "delete"
            }
        };
        invocation
            .arg(connection)
            .arg(session)
            .arg(mode)
            .arg(if elect { "1" } else { "0" })
            .arg(ttl_secs(session_ttl))
            .arg(&keys.record_prefix);

        let (was_leader, new_leader) = self
            .run(async move { invocation.invoke_async::<_, (i64, String)>(&mut conn).await })
            .await?;
        Ok(Departed {
            was_leader: was_leader == 1,
            new_leader: Some(new_leader).filter(|id| !id.is_empty()),
        })
    }
}
