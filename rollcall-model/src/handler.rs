//! Application handler seam
//!
//! The tracker hands every non-empty diff to a [`DiffHandler`]. The handler
//! owns an opaque state value threaded through successive calls. Returning
//! an error is a contract violation and is fatal to the tracker server.

use crate::diff::Diff;

/// Error returned by a diff handler. Always fatal to the owning tracker.
#[derive(Debug, thiserror::Error)]
#[error("diff handler failed: {0}")]
pub struct HandlerError(pub String);

/// Consumer of presence diffs.
///
/// `handle_diff` MUST NOT block on I/O; offload slow work and return.
pub trait DiffHandler: Send + 'static {
    type State: Send + 'static;

    /// Produce the initial handler state. Called once at tracker start.
    fn init(&mut self) -> Self::State;

    /// Consume one diff, returning the next handler state.
    fn handle_diff(&mut self, diff: &Diff, state: Self::State) -> Result<Self::State, HandlerError>;
}
