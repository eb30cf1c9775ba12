//! Connection Registry
//!
//! CRUD on individual presence records. A record is stored as a flat hash of
//! string fields; optional fields are written as empty strings and read back
//! as `None`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::ids::{short, ConnectionId, InstanceId, SessionId};
use crate::state::keys::KeySpace;
use crate::store::fields::{
    AVATAR_URL, CONNECTED_AT, CONNECTION_ID, INSTANCE_ID, IS_LEADER, SESSION_ID, USERNAME, USER_ID,
};
use crate::store::SharedStore;

/// Presence record of one live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub username: String,
    pub user_id: Option<String>,
    pub avatar_url: Option<String>,
    /// Instance that registered the connection
    pub instance_id: InstanceId,
    /// Session currently joined
    pub session_id: Option<SessionId>,
    /// True only while this connection leads its session
    pub is_leader: bool,
    /// Registration time, Unix milliseconds
    pub connected_at: i64,
}

/// Member view of a connection, as shown to other session members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: ConnectionId,
    pub username: String,
    pub is_leader: bool,
    pub avatar_url: Option<String>,
}

impl From<ConnectionRecord> for SessionUser {
    fn from(record: ConnectionRecord) -> Self {
        Self {
            id: record.connection_id,
            username: record.username,
            is_leader: record.is_leader,
            avatar_url: record.avatar_url,
        }
    }
}

/// Optional display field: empty string stands for unset
fn optional(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Display fields for an update. Empty usernames are skipped; `Some(None)` clears the avatar.
pub(crate) fn display_fields(username: Option<&str>, avatar_url: Option<Option<&str>>) -> Vec<(&'static str, String)> {
    let mut fields = Vec::with_capacity(2);
    if let Some(username) = username.filter(|u| !u.is_empty()) {
        fields.push((USERNAME, username.to_string()));
    }
    if let Some(avatar_url) = avatar_url {
        fields.push((AVATAR_URL, avatar_url.unwrap_or_default().to_string()));
    }
    fields
}

impl ConnectionRecord {
    /// Convert to store hash fields
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (CONNECTION_ID, self.connection_id.to_string()),
            (INSTANCE_ID, self.instance_id.to_string()),
            (SESSION_ID, self.session_id.as_ref().map(ToString::to_string).unwrap_or_default()),
            (USER_ID, self.user_id.clone().unwrap_or_default()),
            (USERNAME, self.username.clone()),
            (AVATAR_URL, self.avatar_url.clone().unwrap_or_default()),
            (IS_LEADER, self.is_leader.to_string()),
            (CONNECTED_AT, self.connected_at.to_string()),
        ]
    }

    /// Parse store hash fields. A hash without a connection id is no record.
    pub fn from_fields(key: &str, hash: &HashMap<String, String>) -> Result<Option<Self>> {
        let connection_id = match hash.get(CONNECTION_ID).filter(|v| !v.is_empty()) {
            Some(id) => id,
            None => return Ok(None),
        };
        let corrupt = |reason: String| Error::CorruptRecord { key: key.to_string(), reason };

        let connection_id = ConnectionId::parse(connection_id).map_err(|e| corrupt(e.to_string()))?;
        let instance_id = hash
            .get(INSTANCE_ID)
            .ok_or_else(|| corrupt("missing instanceId".into()))
            .and_then(|id| InstanceId::parse(id).map_err(|e| corrupt(e.to_string())))?;
        let session_id = match optional(hash.get(SESSION_ID)) {
            Some(id) => Some(SessionId::parse(&id).map_err(|e| corrupt(e.to_string()))?),
            None => None,
        };
        let connected_at = match hash.get(CONNECTED_AT) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| corrupt(format!("bad connectedAt '{}'", raw)))?,
            None => return Err(corrupt("missing connectedAt".into())),
        };

        Ok(Some(Self {
            connection_id,
            username: hash.get(USERNAME).cloned().unwrap_or_default(),
            user_id: optional(hash.get(USER_ID)),
            avatar_url: optional(hash.get(AVATAR_URL)),
            instance_id,
            session_id,
            is_leader: hash.get(IS_LEADER).map_or(false, |v| v == "true"),
            connected_at,
        }))
    }
}

/// Store-backed registry of connection records
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    ttl: Duration,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    /// Record expiry, slid forward on activity
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create or overwrite a record and track it under its owning instance
    pub async fn register(&self, record: &ConnectionRecord) -> Result<()> {
        self.store
            .put_hash(&self.keys.connection(&record.connection_id), &record.to_fields(), self.ttl)
            .await?;
        self.store
            .sadd(
                &self.keys.instance_connections(&record.instance_id),
                record.connection_id.as_str(),
            )
            .await?;

        tracing::info!(
            "Registered connection: {} on instance: {}",
            short(record.connection_id.as_str(), 8),
            short(record.instance_id.as_str(), 8)
        );
        Ok(())
    }

    /// Read a record, `None` if missing or expired
    pub async fn get(&self, id: &ConnectionId) -> Result<Option<ConnectionRecord>> {
        let key = self.keys.connection(id);
        let hash = self.store.hgetall(&key).await?;
        ConnectionRecord::from_fields(&key, &hash)
    }

    /// Partially update a record. Returns false if the record no longer exists.
    pub async fn update(&self, id: &ConnectionId, fields: &[(&str, String)]) -> Result<bool> {
        if fields.is_empty() {
            return self.store.exists(&self.keys.connection(id)).await;
        }
        self.store.hset_if_exists(&self.keys.connection(id), fields).await
    }

    /// Extend a record's TTL. Returns false if the record no longer exists.
    pub async fn touch(&self, id: &ConnectionId) -> Result<bool> {
        self.store.expire(&self.keys.connection(id), self.ttl).await
    }

    /// Delete a record and drop it from its owner's ownership set
    pub async fn delete(&self, id: &ConnectionId, owner: &InstanceId) -> Result<()> {
        self.store.del(&[self.keys.connection(id)]).await?;
        self.store
            .srem(&self.keys.instance_connections(owner), id.as_str())
            .await?;
        tracing::debug!("Deleted connection record: {}", short(id.as_str(), 8));
        Ok(())
    }

    /// Connection ids registered through an instance
    pub async fn owned_by(&self, instance: &InstanceId) -> Result<Vec<String>> {
        self.store.smembers(&self.keys.instance_connections(instance)).await
    }

    /// Drop an id from an instance's ownership set without touching the record
    pub async fn disown(&self, instance: &InstanceId, id: &str) -> Result<()> {
        self.store.srem(&self.keys.instance_connections(instance), id).await?;
        Ok(())
    }
}
