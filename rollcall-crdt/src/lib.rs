//! Rollcall CRDT
//!
//! A delta-state observed-remove set specialised for presence tracking.
//! Each entry carries a causal tag `(replica_ref, counter)`; removes only
//! delete observed tags, so concurrent adds survive merges. State from
//! replicas flagged down is hidden from the visible view but retained so it
//! can re-appear on recovery without a transfer.

pub mod clock;
pub mod state;

pub use clock::{dominates, merge_context, ClockSummary, Clocks, Context};
pub use state::{Delta, Entry, Snapshot, State, Tag};
