//! Tracker error types

use rollcall_net_types::PubSubError;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// `update` targeted a `(session, topic, key)` with no live presence.
    #[error("no presence found for the given session, topic, and key")]
    NoPresence,

    /// The tracker actor is no longer running.
    #[error("tracker is not running")]
    ChannelClosed,

    #[error("invalid tracker configuration: {0}")]
    Config(String),

    #[error(transparent)]
    PubSub(#[from] PubSubError),
}
