//! Strong types for replica and session identity
//!
//! Semantic newtypes replacing raw strings and integers at the API surface.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use tokio_util::sync::CancellationToken;

/// The stable node name as reported by the transport.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ReplicaName(String);

impl ReplicaName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ReplicaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaName({})", self.0)
    }
}

impl From<&str> for ReplicaName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ReplicaName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-boot nonce. A restarted node picks a fresh one, signalling to peers
/// that state from its previous incarnation is stale.
pub type Vsn = u64;

/// Generate a boot nonce. Never zero, so an unset vsn is distinguishable.
pub fn generate_vsn() -> Vsn {
    let mut rng = rand::thread_rng();
    loop {
        let vsn = rng.next_u64();
        if vsn != 0 {
            return vsn;
        }
    }
}

/// Replica identity: stable node name plus boot nonce.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ReplicaRef {
    pub name: ReplicaName,
    pub vsn: Vsn,
}

impl ReplicaRef {
    pub fn new(name: impl Into<ReplicaName>, vsn: Vsn) -> Self {
        Self {
            name: name.into(),
            vsn,
        }
    }
}

impl fmt::Display for ReplicaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:x}", self.name, self.vsn)
    }
}

impl fmt::Debug for ReplicaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaRef({self})")
    }
}

/// Opaque handle for a local session. Only meaningful on the replica that
/// created it.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap an externally-assigned session number. Most callers should go
    /// through [`Session::new`] instead.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn into_raw(self) -> u64 {
        self.0
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A trackable local session: an id plus a cancellation token whose firing
/// is the session-terminated signal the tracker watches for.
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    token: CancellationToken,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Signal that this session has terminated. Trackers watching the
    /// session treat this as an implicit untrack of all its presences.
    pub fn terminate(&self) {
        self.token.cancel();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique, stable reference for one presence entry, stored in its metadata
/// under [`crate::META_REF`]. Base64 rendering of a random 64-bit value.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct PresenceRef(String);

impl PresenceRef {
    pub fn generate() -> Self {
        let raw = rand::thread_rng().next_u64();
        Self(BASE64.encode(raw.to_le_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PresenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PresenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PresenceRef({})", self.0)
    }
}

impl From<PresenceRef> for String {
    fn from(r: PresenceRef) -> String {
        r.0
    }
}
