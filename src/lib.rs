//! Partyline - Distributed Connection & Session State Manager
//!
//! Lets many horizontally scaled backend processes agree on who is
//! connected, who belongs to which collaborative party session, and which
//! single connection currently drives that session. All shared state lives
//! in a Redis-compatible store; the manager itself keeps only its heartbeat
//! timer.
//!
//! # Architecture
//!
//! Every instance builds one `DistributedStateManager` over the shared store
//! and hands it to its real-time transport layer. The manager validates ids,
//! then works through store-level atomic primitives: set-if-absent for the
//! first joiner's leader claim, compare-and-swap for re-election, set
//! add/remove for membership.
//!
//! # Features
//!
//! - Presence records with sliding expiry
//! - TTL'd session membership sets
//! - Exactly one leader per session, deterministic hand-off on departure
//! - Instance heartbeats and ownership-scoped cleanup on shutdown
//! - In-memory store for tests and single-process development

pub mod config;
pub mod error;
pub mod state;
pub mod store;

pub use config::PartylineConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{PartylineConfig, StateConfig};
    pub use crate::error::{Error, Result};
    pub use crate::state::{
        ConnectionRecord, DistributedStateManager, JoinOutcome, LeaveOutcome, RemovedConnection,
        SessionUser,
    };
    pub use crate::store::{MemoryStore, RedisStore, SharedStore};
}
