//! State Management Module
//!
//! Cross-instance presence tracking: the connection registry, session
//! membership, per-session leader election and the instance heartbeat, all
//! composed by `DistributedStateManager`.

pub mod ids;
mod keys;
mod registry;
mod membership;
pub mod election;
mod heartbeat;
mod manager;

pub use ids::{ConnectionId, SessionId, InstanceId};
pub use keys::KeySpace;
pub use registry::{ConnectionRecord, ConnectionRegistry, SessionUser};
pub use membership::{JoinOutcome, LeaveOutcome, SessionMembership};
pub use election::{Departure, LeaderElection};
pub use heartbeat::InstanceHeartbeat;
pub use manager::{DistributedStateManager, RemovedConnection};
