//! Store key namespace

use crate::state::ids::{ConnectionId, InstanceId, SessionId};
use crate::store::SessionKeys;

/// Builds every key the manager reads or writes
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Hash: one connection record
    pub fn connection(&self, id: &ConnectionId) -> String {
        format!("{}:conn:{}", self.prefix, id)
    }

    /// Set: connection ids in a session
    pub fn session_members(&self, id: &SessionId) -> String {
        format!("{}:session:{}:members", self.prefix, id)
    }

    /// String: connection id of the session leader
    pub fn session_leader(&self, id: &SessionId) -> String {
        format!("{}:session:{}:leader", self.prefix, id)
    }

    /// Every key the session primitives touch for one session
    pub fn session(&self, id: &SessionId) -> SessionKeys {
        SessionKeys {
            record_prefix: format!("{}:conn:", self.prefix),
            members: self.session_members(id),
            leader: self.session_leader(id),
        }
    }

    /// Set: connection ids registered through an instance
    pub fn instance_connections(&self, id: &InstanceId) -> String {
        format!("{}:instance:{}:conns", self.prefix, id)
    }

    /// String: last heartbeat of an instance (Unix ms)
    pub fn instance_heartbeat(&self, id: &InstanceId) -> String {
        format!("{}:instance:{}:heartbeat", self.prefix, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("partyline");
        let conn = ConnectionId::parse("c1").unwrap();
        let session = SessionId::parse("S1").unwrap();
        let instance = InstanceId::parse("api-1").unwrap();

        assert_eq!(keys.connection(&conn), "partyline:conn:c1");
        assert_eq!(keys.session_members(&session), "partyline:session:S1:members");
        assert_eq!(keys.session_leader(&session), "partyline:session:S1:leader");
        assert_eq!(keys.instance_connections(&instance), "partyline:instance:api-1:conns");
        assert_eq!(keys.instance_heartbeat(&instance), "partyline:instance:api-1:heartbeat");

        let session_keys = keys.session(&session);
        assert_eq!(session_keys.record(conn.as_str()), keys.connection(&conn));
        assert_eq!(session_keys.members, keys.session_members(&session));
        assert_eq!(session_keys.leader, keys.session_leader(&session));
    }
}
