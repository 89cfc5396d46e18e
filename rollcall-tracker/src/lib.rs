//! Rollcall Tracker
//!
//! The per-node presence tracker server. One tracker runs per logical
//! namespace; it owns the presence CRDT, drives the heartbeat cadence over
//! the pub/sub transport, maintains the liveness status of every peer
//! replica, and reports join/leave diffs to the application handler.
//!
//! Public API calls go through [`Tracker`], a cheap-to-clone handle whose
//! requests are serialized through the actor's mailbox.

mod actor;
pub mod clockset;
pub mod config;
pub mod error;
pub mod handle;
pub mod replica;

pub use clockset::ClockSet;
pub use config::TrackerConfig;
pub use error::TrackerError;
pub use handle::Tracker;
pub use replica::{Replica, ReplicaMap, Status};

// Re-exports so embedders rarely need the leaf crates directly.
pub use rollcall_model::{
    Diff, DiffHandler, HandlerError, Meta, PresenceRef, Session, SessionId, TopicDiff, META_REF,
    META_REF_PREV,
};
