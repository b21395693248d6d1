use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::seq::Seq;

/// One revision entry in a change record's `changes` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    /// Revision identifier, e.g. `"1-967a00dff5e02add41819138abb3284d"`.
    pub rev: String,
}

/// A single record from a changes feed.
///
/// `_changes` records carry `id` and `changes`; `_db_updates` records carry
/// `db_name` and `type` instead, which land in `extra`. Both kinds flow
/// through the feed as long as they carry a sequence token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    /// Sequence token of this change. Always present; the feed treats a
    /// record without one as a protocol violation before this type is
    /// ever constructed.
    pub seq: Seq,

    /// Document identifier, for `_changes` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Leaf revisions touched by this change.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<ChangeRev>,

    /// Full document body, present when `include_docs=true` was sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<JsonValue>,

    /// Whether this change is a deletion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    /// Any further fields the server sent (e.g. `db_name`/`type` on
    /// `_db_updates` entries).
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}
