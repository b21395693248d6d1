//! Sequence tokens for changes feeds.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A sequence token from a changes feed.
///
/// Single-node servers emit plain integers; clustered servers emit composite
/// tokens such as `"123-g1AAAAxxxx"` whose opaque suffix encodes shard
/// state. Tokens are ordered by their numeric prefix, with the full text
/// form as a tiebreaker, so `Seq::Number(5)` and `Seq::Text("5-abc")`
/// compare the way the server generated them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seq {
    /// A plain numeric sequence value.
    Number(u64),
    /// A composite sequence token, kept verbatim for round-tripping.
    Text(String),
}

impl Seq {
    /// The numeric prefix used for ordering: the value itself for numeric
    /// tokens, the leading digits before the first `-` for composite ones.
    /// Tokens without a numeric prefix order as zero.
    pub fn numeric_prefix(&self) -> u64 {
        match self {
            Seq::Number(n) => *n,
            Seq::Text(s) => s
                .split('-')
                .next()
                .and_then(|prefix| prefix.parse().ok())
                .unwrap_or(0),
        }
    }

    fn text_form(&self) -> Cow<'_, str> {
        match self {
            Seq::Number(n) => Cow::Owned(n.to_string()),
            Seq::Text(s) => Cow::Borrowed(s.as_str()),
        }
    }
}

impl Default for Seq {
    fn default() -> Self {
        Seq::Number(0)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seq::Number(n) => write!(f, "{}", n),
            Seq::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numeric_prefix()
            .cmp(&other.numeric_prefix())
            .then_with(|| self.text_form().cmp(&other.text_form()))
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Seq {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Seq {}

impl Hash for Seq {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.numeric_prefix().hash(state);
        self.text_form().hash(state);
    }
}

impl From<u64> for Seq {
    fn from(value: u64) -> Self {
        Seq::Number(value)
    }
}

impl From<&str> for Seq {
    fn from(value: &str) -> Self {
        Seq::Text(value.to_string())
    }
}

impl From<String> for Seq {
    fn from(value: String) -> Self {
        Seq::Text(value)
    }
}
