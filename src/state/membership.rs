//! Session Membership
//!
//! Tracks which connections belong to which party session. Each session is a
//! TTL'd set of connection ids; joins and activity pings slide the expiry
//! forward, and an empty set disappears from the store.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::election::LeaderElection;
use crate::state::ids::{short, ConnectionId, SessionId};
use crate::state::keys::KeySpace;
use crate::state::registry::{display_fields, ConnectionRegistry, SessionUser};
use crate::store::{RecordAction, SharedStore};

/// Result of joining a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOutcome {
    /// True iff the connection leads the session after joining
    pub is_leader: bool,
}

/// Result of leaving a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveOutcome {
    /// Successor, set only when the leaving connection was leader and someone remains
    pub new_leader_id: Option<ConnectionId>,
}

/// Session membership tracker
#[derive(Clone)]
pub struct SessionMembership {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    registry: ConnectionRegistry,
    election: LeaderElection,
    session_ttl: Duration,
}

impl SessionMembership {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        registry: ConnectionRegistry,
        election: LeaderElection,
        session_ttl: Duration,
    ) -> Self {
        Self { store, keys, registry, election, session_ttl }
    }

    /// Add a registered connection to a session and attempt the leader claim,
    /// all in one store step.
    ///
    /// Does not leave any session the connection previously joined.
    pub async fn join(
        &self,
        connection: &ConnectionId,
        session: &SessionId,
        username: Option<&str>,
        avatar_url: Option<Option<&str>>,
    ) -> Result<JoinOutcome> {
        let joined = self
            .store
            .join_session(
                &self.keys.session(session),
                connection.as_str(),
                session.as_str(),
                &display_fields(username, avatar_url),
                self.registry.ttl(),
                self.session_ttl,
            )
            .await?;

        let is_leader = match joined {
            Some(is_leader) => is_leader,
            None => return Err(Error::ConnectionNotFound(short(connection.as_str(), 20).to_string())),
        };

        if is_leader {
            tracing::info!(
                "Connection {} leads session {}",
                short(connection.as_str(), 8),
                short(session.as_str(), 8)
            );
        }
        tracing::debug!(
            "Connection {} joined session {}",
            short(connection.as_str(), 8),
            short(session.as_str(), 8)
        );
        Ok(JoinOutcome { is_leader })
    }

    /// Remove a connection from a session, electing a successor if it led.
    ///
    /// The record's session fields are only cleared while they still name `session`.
    pub async fn leave(&self, connection: &ConnectionId, session: &SessionId) -> Result<LeaveOutcome> {
        let departure = self
            .election
            .depart(session, connection, RecordAction::Clear, true)
            .await?;

        tracing::debug!(
            "Connection {} left session {}",
            short(connection.as_str(), 8),
            short(session.as_str(), 8)
        );
        Ok(LeaveOutcome { new_leader_id: departure.new_leader })
    }

    /// Hydrated members of a session. Ids whose record is gone are skipped.
    pub async fn members(&self, session: &SessionId) -> Result<Vec<SessionUser>> {
        let member_ids = self.store.smembers(&self.keys.session_members(session)).await?;
        if member_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ConnectionId> = member_ids
            .iter()
            .filter_map(|id| ConnectionId::parse(id).ok())
            .collect();
        let lookups = join_all(ids.iter().map(|id| self.registry.get(id))).await;

        let mut users = Vec::with_capacity(lookups.len());
        for lookup in lookups {
            match lookup {
                Ok(Some(record)) => users.push(SessionUser::from(record)),
                Ok(None) => {}
                Err(Error::CorruptRecord { key, reason }) => {
                    tracing::warn!("Skipping session member {}: {}", key, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(users)
    }

    pub async fn member_count(&self, session: &SessionId) -> Result<usize> {
        self.store.scard(&self.keys.session_members(session)).await
    }

    /// Check if a connection's record names this session
    pub async fn contains(&self, connection: &ConnectionId, session: &SessionId) -> Result<bool> {
        let record = self.registry.get(connection).await?;
        Ok(record.and_then(|r| r.session_id).as_ref() == Some(session))
    }

    /// Delete leader and membership keys of an empty session.
    ///
    /// Returns false and leaves everything in place if members remain.
    pub async fn cleanup_empty(&self, session: &SessionId) -> Result<bool> {
        let cleaned = self
            .store
            .del_if_empty_set(
                &self.keys.session_members(session),
                &[self.keys.session_leader(session)],
            )
            .await?;

        if cleaned {
            tracing::info!("Cleaned up empty session: {}", short(session.as_str(), 8));
        } else {
            tracing::debug!("Session {} still has members, not cleaned", short(session.as_str(), 8));
        }
        Ok(cleaned)
    }

    /// Slide a connection's expiry and that of the session it belongs to.
    ///
    /// Returns false if the connection record no longer exists.
    pub async fn refresh(&self, connection: &ConnectionId) -> Result<bool> {
        if !self.registry.touch(connection).await? {
            return Ok(false);
        }

        if let Some(session) = self.registry.get(connection).await?.and_then(|r| r.session_id) {
            self.refresh_session(&session).await?;
        }
        Ok(true)
    }

    /// Slide the expiry of a session's member set and leader key.
    ///
    /// Returns false if the member set is gone.
    pub async fn refresh_session(&self, session: &SessionId) -> Result<bool> {
        let live = self
            .store
            .expire(&self.keys.session_members(session), self.session_ttl)
            .await?;
        if live {
            self.election.refresh(session).await?;
        }
        Ok(live)
    }
}
