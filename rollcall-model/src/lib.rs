//! Rollcall Model
//!
//! Pure data types and traits for the rollcall presence system, decoupled
//! from the CRDT engine, the network stack, and the tracker server.

pub mod diff;
pub mod handler;
pub mod types;

pub use diff::{Diff, Meta, TopicDiff, META_REF, META_REF_PREV};
pub use handler::{DiffHandler, HandlerError};
pub use types::{generate_vsn, PresenceRef, ReplicaName, ReplicaRef, Session, SessionId, Vsn};
