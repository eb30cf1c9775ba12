//! In-process Shared Store
//!
//! Mirrors the subset of Redis semantics the manager relies on: typed values,
//! per-key expiry, empty sets and hashes vanishing. Managers sharing one
//! `Arc<MemoryStore>` behave like instances sharing one Redis. Every
//! primitive, compound ones included, runs under a single lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::store::{fields, pick_successor, ttl_secs, Departed, RecordAction, SessionKeys, SharedStore};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    fn string(value: &str, ttl: Duration) -> Self {
        Self { value: Value::Str(value.to_string()), expires_at: deadline(ttl) }
    }
}

type Entries = HashMap<String, Entry>;

fn deadline(ttl: Duration) -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(ttl_secs(ttl)))
}

fn wrong_type(key: &str) -> Error {
    Error::StoreCommand(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

/// Shared store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(entries.len())
    }

    /// Check if the store holds no live keys
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".into()))
    }
}

/// Look up a live entry, evicting it first if it has expired
fn live<'a>(entries: &'a mut Entries, key: &str) -> Option<&'a mut Entry> {
    if entries.get(key).map_or(false, |e| e.is_expired(Instant::now())) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn read_str(entries: &mut Entries, key: &str) -> Result<Option<String>> {
    match live(entries, key) {
        None => Ok(None),
        Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
        Some(_) => Err(wrong_type(key)),
    }
}

fn hash_mut<'a>(entries: &'a mut Entries, key: &str) -> Result<Option<&'a mut HashMap<String, String>>> {
    match live(entries, key) {
        None => Ok(None),
        Some(Entry { value: Value::Hash(hash), .. }) => Ok(Some(hash)),
        Some(_) => Err(wrong_type(key)),
    }
}

fn set_ref<'a>(entries: &'a mut Entries, key: &str) -> Result<Option<&'a BTreeSet<String>>> {
    match live(entries, key) {
        None => Ok(None),
        Some(Entry { value: Value::Set(set), .. }) => Ok(Some(set)),
        Some(_) => Err(wrong_type(key)),
    }
}

fn set_add(entries: &mut Entries, key: &str, member: &str) -> Result<bool> {
    match live(entries, key) {
        None => {
            let set = BTreeSet::from([member.to_string()]);
            entries.insert(key.to_string(), Entry { value: Value::Set(set), expires_at: None });
            Ok(true)
        }
        Some(Entry { value: Value::Set(set), .. }) => Ok(set.insert(member.to_string())),
        Some(_) => Err(wrong_type(key)),
    }
}

fn set_remove(entries: &mut Entries, key: &str, member: &str) -> Result<bool> {
    let (removed, now_empty) = match live(entries, key) {
        None => return Ok(false),
        Some(Entry { value: Value::Set(set), .. }) => (set.remove(member), set.is_empty()),
        Some(_) => return Err(wrong_type(key)),
    };
    if now_empty {
        entries.remove(key);
    }
    Ok(removed)
}

fn expire_entry(entries: &mut Entries, key: &str, ttl: Duration) -> bool {
    match live(entries, key) {
        Some(entry) => {
            entry.expires_at = deadline(ttl);
            true
        }
        None => false,
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock()?;
        read_str(&mut entries, key)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.lock()?;
        entries.insert(key.to_string(), Entry::string(value, ttl));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        let mut entries = self.lock()?;
        let mut removed = 0;
        for key in keys {
            if live(&mut entries, key).is_some() {
                entries.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.lock()?;
        Ok(expire_entry(&mut entries, key, ttl))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut entries = self.lock()?;
        Ok(live(&mut entries, key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.lock()?;
        Ok(live(&mut entries, key).is_some())
    }

    async fn put_hash(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<()> {
        let mut entries = self.lock()?;
        let hash = fields
            .iter()
            .map(|(field, value)| (field.to_string(), value.clone()))
            .collect();
        entries.insert(key.to_string(), Entry { value: Value::Hash(hash), expires_at: deadline(ttl) });
        Ok(())
    }

    async fn hset_if_exists(&self, key: &str, fields: &[(&str, String)]) -> Result<bool> {
        let mut entries = self.lock()?;
        match hash_mut(&mut entries, key)? {
            None => Ok(false),
            Some(hash) => {
                for (field, value) in fields {
                    hash.insert(field.to_string(), value.clone());
                }
                Ok(true)
            }
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut entries = self.lock()?;
        Ok(hash_mut(&mut entries, key)?.map(|hash| hash.clone()).unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.lock()?;
        set_add(&mut entries, key, member)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.lock()?;
        set_remove(&mut entries, key, member)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut entries = self.lock()?;
        Ok(set_ref(&mut entries, key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let mut entries = self.lock()?;
        Ok(set_ref(&mut entries, key)?.map_or(0, BTreeSet::len))
    }

    async fn del_if_empty_set(&self, set_key: &str, extra_keys: &[String]) -> Result<bool> {
        let mut entries = self.lock()?;
        if set_ref(&mut entries, set_key)?.map_or(false, |set| !set.is_empty()) {
            return Ok(false);
        }
        entries.remove(set_key);
        for key in extra_keys {
            entries.remove(key);
        }
        Ok(true)
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
        let mut entries = self.lock()?;
        let record_key = keys.record(connection);

        match hash_mut(&mut entries, &record_key)? {
            None => return Ok(None),
            Some(hash) => {
                hash.insert(fields::SESSION_ID.to_string(), session.to_string());
                for (field, value) in updates {
                    hash.insert(field.to_string(), value.clone());
                }
            }
        }
        expire_entry(&mut entries, &record_key, connection_ttl);
        set_add(&mut entries, &keys.members, connection)?;
        expire_entry(&mut entries, &keys.members, session_ttl);

        // A leader whose record is gone cannot hold the session
        let mut leader = read_str(&mut entries, &keys.leader)?;
        if let Some(current) = leader.clone() {
            if current != connection && hash_mut(&mut entries, &keys.record(&current))?.is_none() {
                set_remove(&mut entries, &keys.members, &current)?;
                leader = None;
            }
        }

        let is_leader = leader.as_deref().map_or(true, |current| current == connection);
        if is_leader {
            entries.insert(keys.leader.clone(), Entry::string(connection, session_ttl));
        } else {
            expire_entry(&mut entries, &keys.leader, session_ttl);
        }
        if let Some(hash) = hash_mut(&mut entries, &record_key)? {
            hash.insert(fields::IS_LEADER.to_string(), is_leader.to_string());
        }
        Ok(Some(is_leader))
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
        let mut entries = self.lock()?;
        let record_key = keys.record(connection);

        match record {
            RecordAction::Delete { owner_set } => {
                entries.remove(&record_key);
                set_remove(&mut entries, owner_set, connection)?;
            }
            RecordAction::Clear => {
                if let Some(hash) = hash_mut(&mut entries, &record_key)? {
                    if hash.get(fields::SESSION_ID).map(String::as_str) == Some(session) {
                        hash.insert(fields::SESSION_ID.to_string(), String::new());
                        hash.insert(fields::IS_LEADER.to_string(), "false".to_string());
                    }
                }
            }
        }
        set_remove(&mut entries, &keys.members, connection)?;

        if read_str(&mut entries, &keys.leader)?.as_deref() != Some(connection) {
            return Ok(Departed::default());
        }
        if !elect {
            return Ok(Departed { was_leader: true, new_leader: None });
        }

        let remaining: Vec<String> = set_ref(&mut entries, &keys.members)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut candidates = Vec::with_capacity(remaining.len());
        for id in &remaining {
            let connected_at = hash_mut(&mut entries, &keys.record(id))?
                .and_then(|hash| hash.get(fields::CONNECTED_AT))
                .and_then(|raw| raw.parse::<i64>().ok());
            if let Some(at) = connected_at {
                candidates.push((id.as_str(), at));
            }
        }

        let successor = match pick_successor(candidates) {
            Some(id) => id.to_string(),
            None => {
                entries.remove(&keys.leader);
                return Ok(Departed { was_leader: true, new_leader: None });
            }
        };

        entries.insert(keys.leader.clone(), Entry::string(&successor, session_ttl));
        if let Some(hash) = hash_mut(&mut entries, &keys.record(&successor))? {
            hash.insert(fields::IS_LEADER.to_string(), "true".to_string());
        }
        expire_entry(&mut entries, &keys.members, session_ttl);

        Ok(Departed { was_leader: true, new_leader: Some(successor) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn session_keys() -> SessionKeys {
        SessionKeys {
            record_prefix: "t:conn:".to_string(),
            members: "t:session:S1:members".to_string(),
            leader: "t:session:S1:leader".to_string(),
        }
    }

    async fn record(store: &MemoryStore, id: &str, connected_at: i64) {
        store
            .put_hash(
                &format!("t:conn:{}", id),
                &[
                    (fields::CONNECTION_ID, id.to_string()),
                    (fields::CONNECTED_AT, connected_at.to_string()),
                    (fields::IS_LEADER, "false".to_string()),
                ],
                TTL,
            )
            .await
            .unwrap();
    }

    async fn field(store: &MemoryStore, id: &str, name: &str) -> Option<String> {
        store.hgetall(&format!("t:conn:{}", id)).await.unwrap().get(name).cloned()
    }

    #[tokio::test]
    async fn test_expired_keys_disappear() {
        let store = MemoryStore::new();
        store.set_ex("hb", "1", TTL).await.unwrap();
        {
            let mut entries = store.lock().unwrap();
            entries.get_mut("hb").unwrap().expires_at = Some(Instant::now());
        }
        assert!(!store.exists("hb").await.unwrap());
        assert!(store.get("hb").await.unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_set_removed_when_empty() {
        let store = MemoryStore::new();
        store.sadd("members", "a").await.unwrap();
        store.expire("members", TTL).await.unwrap();
        assert!(store.srem("members", "a").await.unwrap());
        assert!(!store.exists("members").await.unwrap());
        assert_eq!(store.scard("members").await.unwrap(), 0);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_hset_if_exists_requires_hash() {
        let store = MemoryStore::new();
        assert!(!store.hset_if_exists("conn", &[("username", "x".into())]).await.unwrap());
        assert!(store.hgetall("conn").await.unwrap().is_empty());

        store.put_hash("conn", &[("username", "alex".into())], TTL).await.unwrap();
        assert!(store.hset_if_exists("conn", &[("isLeader", "true".into())]).await.unwrap());
        let hash = store.hgetall("conn").await.unwrap();
        assert_eq!(hash.get("username").map(String::as_str), Some("alex"));
        assert_eq!(hash.get("isLeader").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_del_if_empty_set() {
        let store = MemoryStore::new();
        store.sadd("members", "a").await.unwrap();
        store.set_ex("leader", "a", TTL).await.unwrap();
        let extra = vec!["leader".to_string()];

        assert!(!store.del_if_empty_set("members", &extra).await.unwrap());
        assert!(store.exists("leader").await.unwrap());

        store.srem("members", "a").await.unwrap();
        assert!(store.del_if_empty_set("members", &extra).await.unwrap());
        assert!(!store.exists("leader").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", TTL).await.unwrap();
        assert!(matches!(store.sadd("k", "m").await, Err(Error::StoreCommand(_))));
    }

    #[tokio::test]
    async fn test_join_claims_once() {
        let store = MemoryStore::new();
        let keys = session_keys();
        record(&store, "a", 1).await;
        record(&store, "b", 2).await;

        assert_eq!(store.join_session(&keys, "a", "S1", &[], TTL, TTL).await.unwrap(), Some(true));
        assert_eq!(store.join_session(&keys, "b", "S1", &[], TTL, TTL).await.unwrap(), Some(false));
        assert_eq!(store.get(&keys.leader).await.unwrap().as_deref(), Some("a"));
        assert_eq!(field(&store, "a", fields::IS_LEADER).await.as_deref(), Some("true"));
        assert_eq!(field(&store, "b", fields::IS_LEADER).await.as_deref(), Some("false"));
        assert_eq!(field(&store, "b", fields::SESSION_ID).await.as_deref(), Some("S1"));
        assert!(store.ttl(&keys.members).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_join_without_record_writes_nothing() {
        let store = MemoryStore::new();
        let keys = session_keys();
        assert_eq!(store.join_session(&keys, "ghost", "S1", &[], TTL, TTL).await.unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_join_replaces_vanished_leader() {
        let store = MemoryStore::new();
        let keys = session_keys();
        record(&store, "b", 2).await;
        store.sadd(&keys.members, "a").await.unwrap();
        store.set_ex(&keys.leader, "a", TTL).await.unwrap();

        assert_eq!(store.join_session(&keys, "b", "S1", &[], TTL, TTL).await.unwrap(), Some(true));
        assert_eq!(store.smembers(&keys.members).await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_depart_elects_earliest_live_member() {
        let store = MemoryStore::new();
        let keys = session_keys();
        for (id, at) in [("a", 1), ("c", 3), ("d", 3)] {
            record(&store, id, at).await;
            store.join_session(&keys, id, "S1", &[], TTL, TTL).await.unwrap();
        }
        // dangling member with no record
        store.sadd(&keys.members, "b").await.unwrap();

        let departed = store
            .depart_session(&keys, "a", "S1", &RecordAction::Clear, true, TTL)
            .await
            .unwrap();
        assert_eq!(departed, Departed { was_leader: true, new_leader: Some("c".to_string()) });
        assert_eq!(field(&store, "a", fields::SESSION_ID).await.as_deref(), Some(""));
        assert_eq!(field(&store, "a", fields::IS_LEADER).await.as_deref(), Some("false"));
        assert_eq!(field(&store, "c", fields::IS_LEADER).await.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_depart_last_member_drops_leader() {
        let store = MemoryStore::new();
        let keys = session_keys();
        record(&store, "a", 1).await;
        store.join_session(&keys, "a", "S1", &[], TTL, TTL).await.unwrap();

        let owner = RecordAction::Delete { owner_set: "t:instance:i1:conns".to_string() };
        store.sadd("t:instance:i1:conns", "a").await.unwrap();
        let departed = store.depart_session(&keys, "a", "S1", &owner, true, TTL).await.unwrap();

        assert_eq!(departed, Departed { was_leader: true, new_leader: None });
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_depart_without_election_keeps_key() {
        let store = MemoryStore::new();
        let keys = session_keys();
        record(&store, "a", 1).await;
        record(&store, "b", 2).await;
        store.join_session(&keys, "a", "S1", &[], TTL, TTL).await.unwrap();
        store.join_session(&keys, "b", "S1", &[], TTL, TTL).await.unwrap();

        let departed = store
            .depart_session(&keys, "a", "S1", &RecordAction::Clear, false, TTL)
            .await
            .unwrap();
        assert_eq!(departed, Departed { was_leader: true, new_leader: None });
        assert_eq!(store.get(&keys.leader).await.unwrap().as_deref(), Some("a"));

        let departed = store
            .depart_session(&keys, "b", "S1", &RecordAction::Clear, true, TTL)
            .await
            .unwrap();
        assert_eq!(departed, Departed::default());
    }

    #[tokio::test]
    async fn test_depart_keeps_record_of_other_session() {
        let store = MemoryStore::new();
        let keys = session_keys();
        record(&store, "a", 1).await;
        store.join_session(&keys, "a", "S2", &[], TTL, TTL).await.unwrap();

        store
            .depart_session(&keys, "a", "S1", &RecordAction::Clear, true, TTL)
            .await
            .unwrap();
        assert_eq!(field(&store, "a", fields::SESSION_ID).await.as_deref(), Some("S2"));
    }
}
