//! Presence metadata and per-topic diffs

use std::collections::BTreeMap;

/// Meta key under which the tracker stores the entry's unique ref.
pub const META_REF: &str = "phx_ref";

/// Meta key holding the previous ref after an update.
pub const META_REF_PREV: &str = "phx_ref_prev";

/// Caller-supplied presence metadata: a JSON object map, augmented by the
/// tracker with [`META_REF`] (and [`META_REF_PREV`] on update).
pub type Meta = serde_json::Map<String, serde_json::Value>;

/// Joins and leaves observed on a single topic.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TopicDiff {
    pub joins: Vec<(String, Meta)>,
    pub leaves: Vec<(String, Meta)>,
}

impl TopicDiff {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// A change to the locally visible presence view, grouped by topic.
pub type Diff = BTreeMap<String, TopicDiff>;

/// Serde adapter encoding a [`Meta`] map as JSON bytes.
///
/// The wire codec is postcard, which is not self-describing and cannot carry
/// `serde_json::Value` directly; fields annotated with
/// `#[serde(with = "rollcall_model::diff::meta_bytes")]` cross the wire as a
/// length-prefixed JSON blob instead.
pub mod meta_bytes {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Meta;

    pub fn serialize<S: Serializer>(meta: &Meta, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = serde_json::to_vec(meta).map_err(S::Error::custom)?;
        serializer.serialize_bytes(&bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Meta, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        serde_json::from_slice(&bytes).map_err(D::Error::custom)
    }
}
