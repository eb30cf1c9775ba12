//! Shared Store Module
//!
//! The key-value store every manager instance talks to. All cross-instance
//! state lives behind this trait; each method is a single atomic store-level
//! primitive.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Primitives required from a Redis-compatible shared store
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a string key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string key with an expiry
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<usize>;

    /// Reset a key's expiry. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time to live; `None` when the key is missing or persistent
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Check key existence
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Replace a hash with exactly `fields` and set its expiry
    async fn put_hash(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<()>;

    /// Write hash fields only if the hash exists. Returns false if it did not.
    async fn hset_if_exists(&self, key: &str, fields: &[(&str, String)]) -> Result<bool>;

    /// Read all fields of a hash (empty when missing)
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Add a member to a set. Returns true if it was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a member from a set. Returns true if it was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// All members of a set (empty when missing)
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Cardinality of a set
    async fn scard(&self, key: &str) -> Result<usize>;

    /// Atomically delete `set_key` and `extra_keys` if the set is empty.
    /// Returns false (and deletes nothing) when the set still has members.
    async fn del_if_empty_set(&self, set_key: &str, extra_keys: &[String]) -> Result<bool>;

    /// Atomically join `connection` to a session.
    ///
    /// Writes `sessionId` plus `updates` into the record, slides the record
    /// and member-set expiry, adds the member and claims leadership when the
    /// leader key is absent or names a connection whose record is gone. The
    /// record's `isLeader` flag is set to the outcome.
    ///
    /// Returns `None` without writing anything if the record does not exist,
    /// otherwise whether the connection leads the session afterwards.
    async fn join_session(
        &self,
        keys: &SessionKeys,
        connection: &str,
        session: &str,
        updates: &[(&str, String)],
        connection_ttl: Duration,
        session_ttl: Duration,
    ) -> Result<Option<bool>>;

    /// Atomically take `connection` out of a session.
    ///
    /// Applies `record`, removes the member and, if the leader key names the
    /// connection and `elect` is set, hands leadership to the remaining member
    /// picked by [`pick_successor`] (or deletes the key when none is left).
    async fn depart_session(
        &self,
        keys: &SessionKeys,
        connection: &str,
        session: &str,
        record: &RecordAction,
        elect: bool,
        session_ttl: Duration,
    ) -> Result<Departed>;
}

/// Field names of a connection record hash
pub mod fields {
    pub const CONNECTION_ID: &str = "connectionId";
    pub const INSTANCE_ID: &str = "instanceId";
    pub const SESSION_ID: &str = "sessionId";
    pub const USER_ID: &str = "userId";
    pub const USERNAME: &str = "username";
    pub const AVATAR_URL: &str = "avatarUrl";
    pub const IS_LEADER: &str = "isLeader";
    pub const CONNECTED_AT: &str = "connectedAt";
}

/// Keys touched by the session primitives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Prefix of connection record keys; a record lives at prefix + id
    pub record_prefix: String,
    /// Set of member connection ids
    pub members: String,
    /// String holding the leader's connection id
    pub leader: String,
}

impl SessionKeys {
    pub fn record(&self, connection: &str) -> String {
        format!("{}{}", self.record_prefix, connection)
    }
}

/// What a departure does to the departing connection's record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAction {
    /// Reset `sessionId`/`isLeader`, only if the record still names this session
    Clear,
    /// Delete the record and drop the id from the owning instance's set
    Delete { owner_set: String },
}

/// Result of a departure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Departed {
    /// The leader key named the departing connection
    pub was_leader: bool,
    /// Successor written to the leader key, if any
    pub new_leader: Option<String>,
}

/// Successor rule: earliest `connectedAt`, ties broken by the smallest id
pub fn pick_successor<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, i64)>,
{
    candidates
        .into_iter()
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(id, _)| id)
}

/// Whole seconds for an expiry, never below one
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
