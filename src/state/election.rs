//! Leader Election
//!
//! One leader per session, stored as a single store-global key. The claim
//! happens inside the atomic join; hand-off happens inside the atomic
//! departure, which removes the member and picks the successor in the same
//! store step, so concurrent leaves and joins cannot strand the key on a
//! connection that already left.
//!
//! Successor rule: earliest `connected_at`, ties broken by the smallest
//! connection id (see [`crate::store::pick_successor`]).

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::state::ids::{short, ConnectionId, SessionId};
use crate::state::keys::KeySpace;
use crate::store::{RecordAction, SharedStore};

/// Outcome of a connection leaving or being removed from a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Departure {
    /// The leader key named the departing connection
    pub was_leader: bool,
    /// Successor, when one was elected
    pub new_leader: Option<ConnectionId>,
}

/// Leader election coordinator
#[derive(Clone)]
pub struct LeaderElection {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    session_ttl: Duration,
}

impl LeaderElection {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, session_ttl: Duration) -> Self {
        Self { store, keys, session_ttl }
    }

    /// Current leader of a session
    pub async fn leader(&self, session: &SessionId) -> Result<Option<ConnectionId>> {
        let key = self.keys.session_leader(session);
        match self.store.get(&key).await? {
            Some(raw) => ConnectionId::parse(&raw)
                .map(Some)
                .map_err(|e| Error::CorruptRecord { key, reason: e.to_string() }),
            None => Ok(None),
        }
    }

    /// Take `connection` out of `session` in one store step, electing a
    /// successor when it held the leader key and `elect` is set.
    pub async fn depart(
        &self,
        session: &SessionId,
        connection: &ConnectionId,
        record: RecordAction,
        elect: bool,
    ) -> Result<Departure> {
        let keys = self.keys.session(session);
        let departed = self
            .store
            .depart_session(&keys, connection.as_str(), session.as_str(), &record, elect, self.session_ttl)
            .await?;

        let new_leader = match departed.new_leader {
            Some(raw) => Some(ConnectionId::parse(&raw).map_err(|e| Error::CorruptRecord {
                key: keys.leader.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        match (&new_leader, departed.was_leader && elect) {
            (Some(leader), _) => tracing::info!(
                "Elected new leader: {} for session {}",
                short(leader.as_str(), 8),
                short(session.as_str(), 8)
            ),
            (None, true) => tracing::info!(
                "Session {} has no remaining members after leader left",
                short(session.as_str(), 8)
            ),
            (None, false) => {}
        }

        Ok(Departure { was_leader: departed.was_leader, new_leader })
    }

    /// Slide the leader key's expiry. Returns false if the session has no leader.
    pub async fn refresh(&self, session: &SessionId) -> Result<bool> {
        self.store
            .expire(&self.keys.session_leader(session), self.session_ttl)
            .await
    }
}
