//! Distributed State Manager
//!
//! Public entry point used by the real-time transport layer. Validates ids,
//! then composes the connection registry, session membership, leader election
//! and instance heartbeat against the shared store. Holds no presence state
//! of its own: any number of instances can share one store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::StateConfig;
use crate::error::Result;
use crate::state::election::LeaderElection;
use crate::state::heartbeat::InstanceHeartbeat;
use crate::state::ids::{short, ConnectionId, InstanceId, SessionId};
use crate::state::keys::KeySpace;
use crate::state::membership::{JoinOutcome, LeaveOutcome, SessionMembership};
use crate::state::registry::{display_fields, ConnectionRecord, ConnectionRegistry, SessionUser};
use crate::store::{RecordAction, SharedStore};

/// Result of removing a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedConnection {
    pub session_id: Option<SessionId>,
    pub was_leader: bool,
    pub new_leader_id: Option<ConnectionId>,
}

/// Cross-instance presence, session membership and leader election
pub struct DistributedStateManager {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    instance_id: InstanceId,
    registry: ConnectionRegistry,
    membership: SessionMembership,
    election: LeaderElection,
    heartbeat: InstanceHeartbeat,
    stopped: AtomicBool,
}

impl DistributedStateManager {
    /// Create a manager over a shared store.
    ///
    /// Without an explicit `instance_id` a fresh UUID is generated, so managers
    /// built this way never collide.
    pub fn new(store: Arc<dyn SharedStore>, instance_id: Option<&str>, config: StateConfig) -> Result<Self> {
        let instance_id = match instance_id {
            Some(id) => InstanceId::parse(id)?,
            None => InstanceId::generate(),
        };
        config.validate()?;

        let keys = KeySpace::new(config.key_prefix.clone());
        let registry = ConnectionRegistry::new(store.clone(), keys.clone(), config.connection_ttl);
        let election = LeaderElection::new(store.clone(), keys.clone(), config.session_ttl);
        let membership = SessionMembership::new(
            store.clone(),
            keys.clone(),
            registry.clone(),
            election.clone(),
            config.session_ttl,
        );
        let heartbeat = InstanceHeartbeat::new(
            store.clone(),
            keys.instance_heartbeat(&instance_id),
            config.heartbeat_ttl,
            config.heartbeat_interval,
        );

        Ok(Self {
            store,
            keys,
            instance_id,
            registry,
            membership,
            election,
            heartbeat,
            stopped: AtomicBool::new(false),
        })
    }

    /// Create a manager with default timings and a generated instance id
    pub fn with_defaults(store: Arc<dyn SharedStore>) -> Result<Self> {
        Self::new(store, None, StateConfig::default())
    }

    /// This instance's id
    pub fn instance_id(&self) -> &str {
        self.instance_id.as_str()
    }

    // ---- lifecycle ----

    /// Start the heartbeat task. Repeated calls are no-ops.
    ///
    /// Fails with `Error::Runtime` outside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.heartbeat.start()? {
            self.stopped.store(false, Ordering::SeqCst);
            tracing::info!("Started with instance ID: {}", short(self.instance_id.as_str(), 8));
        }
        Ok(())
    }

    /// Stop the heartbeat, delete the heartbeat key and remove every
    /// connection this instance registered, re-electing leaders as needed.
    pub async fn stop(&self) -> Result<()> {
        self.heartbeat.shutdown().await;
        self.cleanup_instance_connections().await?;
        self.heartbeat.clear().await?;
        self.stopped.store(true, Ordering::SeqCst);

        tracing::info!("Stopped instance: {}", short(self.instance_id.as_str(), 8));
        Ok(())
    }

    /// Stop only the heartbeat task, skipping the cleanup sweep.
    ///
    /// For when the store connection itself is unusable.
    pub fn stop_heartbeat(&self) {
        if self.heartbeat.stop() {
            tracing::warn!(
                "Heartbeat stopped without cleanup for instance {}",
                short(self.instance_id.as_str(), 8)
            );
        }
    }

    /// True once the heartbeat is no longer running (never started, or stopped)
    pub fn is_stopped(&self) -> bool {
        !self.heartbeat.is_running()
    }

    /// True after a `stop()` sweep completed
    pub fn is_cleaned_up(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Check whether an instance's heartbeat key is live
    pub async fn is_instance_alive(&self, instance_id: &str) -> Result<bool> {
        let instance = InstanceId::parse(instance_id)?;
        self.store.exists(&self.keys.instance_heartbeat(&instance)).await
    }

    // ---- connection registry ----

    /// Create or overwrite a connection record owned by this instance
    pub async fn register_connection(
        &self,
        connection_id: &str,
        username: &str,
        user_id: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<()> {
        let connection_id = ConnectionId::parse(connection_id)?;
        let record = ConnectionRecord {
            connection_id,
            username: username.to_string(),
            user_id: user_id.filter(|u| !u.is_empty()).map(str::to_string),
            avatar_url: avatar_url.filter(|a| !a.is_empty()).map(str::to_string),
            instance_id: self.instance_id.clone(),
            session_id: None,
            is_leader: false,
            connected_at: chrono::Utc::now().timestamp_millis(),
        };
        self.registry.register(&record).await
    }

    pub async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionRecord>> {
        let connection_id = ConnectionId::parse(connection_id)?;
        self.registry.get(&connection_id).await
    }

    /// Update display fields. `avatar_url = Some(None)` clears the avatar.
    ///
    /// Returns false if the connection is not registered.
    pub async fn update_username(
        &self,
        connection_id: &str,
        username: &str,
        avatar_url: Option<Option<&str>>,
    ) -> Result<bool> {
        let connection_id = ConnectionId::parse(connection_id)?;
        self.registry
            .update(&connection_id, &display_fields(Some(username), avatar_url))
            .await
    }

    /// Delete a connection, drop it from its session and, if it led that
    /// session and `elect_new_leader` is set, elect a successor.
    ///
    /// Removing an unknown connection is not an error.
    pub async fn remove_connection(
        &self,
        connection_id: &str,
        elect_new_leader: bool,
    ) -> Result<RemovedConnection> {
        let connection_id = ConnectionId::parse(connection_id)?;
        let record = match self.registry.get(&connection_id).await? {
            Some(record) => record,
            None => return Ok(RemovedConnection::default()),
        };

        let mut removed = RemovedConnection {
            session_id: record.session_id.clone(),
            was_leader: record.is_leader,
            new_leader_id: None,
        };

        match &record.session_id {
            Some(session) => {
                // Record deletion, member removal and hand-off are one store step
                let owner_set = self.keys.instance_connections(&record.instance_id);
                let departure = self
                    .election
                    .depart(session, &connection_id, RecordAction::Delete { owner_set }, elect_new_leader)
                    .await?;
                removed.was_leader |= departure.was_leader;
                removed.new_leader_id = departure.new_leader;
            }
            None => self.registry.delete(&connection_id, &record.instance_id).await?,
        }

        tracing::info!("Removed connection: {}", short(connection_id.as_str(), 8));
        Ok(removed)
    }

    // ---- session membership ----

    /// Join a session. `avatar_url = Some(None)` clears the avatar.
    pub async fn join_session(
        &self,
        connection_id: &str,
        session_id: &str,
        username: Option<&str>,
        avatar_url: Option<Option<&str>>,
    ) -> Result<JoinOutcome> {
        let connection_id = ConnectionId::parse(connection_id)?;
        let session_id = SessionId::parse(session_id)?;
        self.membership
            .join(&connection_id, &session_id, username, avatar_url)
            .await
    }

    pub async fn leave_session(&self, connection_id: &str, session_id: &str) -> Result<LeaveOutcome> {
        let connection_id = ConnectionId::parse(connection_id)?;
        let session_id = SessionId::parse(session_id)?;
        self.membership.leave(&connection_id, &session_id).await
    }

    /// Members of a session, across all instances
    pub async fn get_session_members(&self, session_id: &str) -> Result<Vec<SessionUser>> {
        let session_id = SessionId::parse(session_id)?;
        self.membership.members(&session_id).await
    }

    pub async fn get_session_member_count(&self, session_id: &str) -> Result<usize> {
        let session_id = SessionId::parse(session_id)?;
        self.membership.member_count(&session_id).await
    }

    pub async fn has_session_members(&self, session_id: &str) -> Result<bool> {
        Ok(self.get_session_member_count(session_id).await? > 0)
    }

    pub async fn is_connection_in_session(&self, connection_id: &str, session_id: &str) -> Result<bool> {
        let connection_id = ConnectionId::parse(connection_id)?;
        let session_id = SessionId::parse(session_id)?;
        self.membership.contains(&connection_id, &session_id).await
    }

    /// Remove leader and membership keys of an empty session.
    ///
    /// Returns false (and changes nothing) if the session still has members.
    pub async fn cleanup_empty_session(&self, session_id: &str) -> Result<bool> {
        let session_id = SessionId::parse(session_id)?;
        self.membership.cleanup_empty(&session_id).await
    }

    /// Slide the expiry of a connection and its session.
    ///
    /// Returns false if the connection no longer exists.
    pub async fn refresh_connection(&self, connection_id: &str) -> Result<bool> {
        let connection_id = ConnectionId::parse(connection_id)?;
        self.membership.refresh(&connection_id).await
    }

    /// Slide a session's membership expiry directly
    pub async fn refresh_session_membership(&self, session_id: &str) -> Result<bool> {
        let session_id = SessionId::parse(session_id)?;
        self.membership.refresh_session(&session_id).await
    }

    // ---- leader election ----

    pub async fn get_session_leader(&self, session_id: &str) -> Result<Option<ConnectionId>> {
        let session_id = SessionId::parse(session_id)?;
        self.election.leader(&session_id).await
    }

    /// Remove every connection registered through this instance
    async fn cleanup_instance_connections(&self) -> Result<()> {
        let owned = self.registry.owned_by(&self.instance_id).await?;
        if owned.is_empty() {
            return Ok(());
        }

        let results = join_all(owned.iter().map(|id| self.remove_owned(id))).await;

        let mut failed = Vec::new();
        for (id, result) in owned.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!("Failed to remove connection {} during cleanup: {}", short(id, 8), e);
                failed.push(id);
            }
        }

        if !failed.is_empty() {
            tracing::warn!("Force cleaning {} failed connections", failed.len());
            let keys: Vec<String> = failed
                .iter()
                .filter_map(|id| ConnectionId::parse(id).ok())
                .map(|id| self.keys.connection(&id))
                .collect();
            if let Err(e) = self.store.del(&keys).await {
                tracing::error!("Failed to force cleanup connections: {}", e);
            }
        }

        self.store
            .del(&[self.keys.instance_connections(&self.instance_id)])
            .await?;

        tracing::info!(
            "Cleaned up {} connections for instance: {}",
            owned.len(),
            short(self.instance_id.as_str(), 8)
        );
        Ok(())
    }

    /// Remove one connection listed in this instance's ownership set.
    ///
    /// A record now owned by another instance is only disowned.
    async fn remove_owned(&self, id: &str) -> Result<()> {
        let connection_id = match ConnectionId::parse(id) {
            Ok(connection_id) => connection_id,
            Err(_) => return self.registry.disown(&self.instance_id, id).await,
        };

        match self.registry.get(&connection_id).await? {
            Some(record) if record.instance_id == self.instance_id => {
                self.remove_connection(id, true).await?;
                Ok(())
            }
            _ => self.registry.disown(&self.instance_id, id).await,
        }
    }
}

impl Drop for DistributedStateManager {
    fn drop(&mut self) {
        if self.heartbeat.is_running() {
            tracing::warn!(
                "Manager {} dropped without stop(); presence state may be orphaned",
                short(self.instance_id.as_str(), 8)
            );
        }
    }
}
