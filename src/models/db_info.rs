use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::seq::Seq;

/// Metadata returned by the database confirmation request.
///
/// Only `db_name` and `instance_start_time` are required — they identify
/// the resource — and `update_seq` anchors catch-up detection. Everything
/// else the server reports (doc counts, sizes, cluster info) is kept in
/// `extra` for callers that want it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbInfo {
    /// Name of the database.
    pub db_name: String,

    /// Opaque identity token; a string on modern servers, a number on
    /// older ones.
    pub instance_start_time: JsonValue,

    /// The database's sequence value at confirmation time.
    #[serde(default)]
    pub update_seq: Seq,

    /// Remaining server-reported metadata.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}
