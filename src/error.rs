//! Error types for couch-link.

use crate::models::Seq;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while following a changes feed.
///
/// Recoverable conditions (connection errors, non-200 responses, response
/// timeouts, stale sequences) never surface here — the feed handles them
/// internally through reconnection and only reports them via the
/// informational `Timeout` and `Retry` events. Every variant of this enum
/// is terminal for the feed that emitted it.
#[derive(Error, Debug)]
pub enum CouchLinkError {
    /// Invalid or missing configuration, detected before the feed starts.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The one-shot database confirmation request failed or timed out.
    ///
    /// An unreachable database at startup is not treated as transient:
    /// the confirm phase has no retry.
    #[error("Confirm error: {0}")]
    ConfirmError(String),

    /// The server violated the changes-feed protocol: a malformed
    /// confirmation body, a line that does not parse as JSON, or a change
    /// record without a sequence field.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The stream ended deliberately with a terminal `last_seq` sentinel,
    /// which CouchDB sends when the database is deleted or reset.
    #[error("Database deleted after change: {last_seq}")]
    DatabaseDeleted {
        /// Final sequence value carried by the sentinel.
        last_seq: Seq,
    },

    /// No accepted change arrived within the configured inactivity window.
    #[error("No changes for {elapsed:?}")]
    InactivityTimeout {
        /// Time since the last accepted change.
        elapsed: Duration,
    },
}

impl CouchLinkError {
    /// Returns `true` if the feed ended because the database was deleted
    /// or reset (terminal `last_seq` sentinel).
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::DatabaseDeleted { .. })
    }

    /// The final sequence value, if the feed ended with a terminal sentinel.
    pub fn last_seq(&self) -> Option<&Seq> {
        match self {
            Self::DatabaseDeleted { last_seq } => Some(last_seq),
            _ => None,
        }
    }
}

/// Result type for couch-link operations.
pub type Result<T> = std::result::Result<T, CouchLinkError>;
