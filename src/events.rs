//! Typed feed events delivered to the caller.
//!
//! The feed reports everything through one [`FeedEvent`] channel instead of
//! callback registration: lifecycle milestones (`Start`, `Confirm`,
//! `Response`), data (`Change`), progress markers (`Catchup`, `Wait`),
//! failure notifications (`Timeout`, `Retry`) and the terminal signals
//! (`Stop`, `Error`).

use crate::error::CouchLinkError;
use crate::models::{Change, DbInfo, Seq};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Details of a wait-timer expiry on the current connection.
#[derive(Debug, Clone)]
pub struct TimeoutInfo {
    /// Time since the last byte arrived on the connection.
    pub elapsed: Duration,
    /// The configured heartbeat interval the timeout was derived from.
    pub heartbeat: Duration,
    /// Generation id of the connection that timed out.
    pub connection_id: u64,
}

/// Details of a scheduled reconnection attempt.
#[derive(Debug, Clone)]
pub struct RetryInfo {
    /// Cursor the next attempt will resume from.
    pub since: Seq,
    /// Delay before the attempt is made.
    pub after: Duration,
    /// Credential-scrubbed database URL.
    pub db: String,
}

/// Events emitted by a running feed, in order of occurrence.
///
/// After a `Stop` or `Error` event no further events follow; the channel
/// closes once they are drained.
#[derive(Debug)]
pub enum FeedEvent {
    /// The feed has started and is about to confirm the database.
    Start,
    /// The confirmation request is in flight. Carries the scrubbed URL.
    ConfirmRequest {
        /// Credential-scrubbed database URL.
        url: String,
    },
    /// The database answered the confirmation request.
    Confirm(DbInfo),
    /// Delivered changes have reached the sequence the database was at
    /// when following began. Emitted at most once per feed.
    Catchup {
        /// The sequence that crossed the confirmation snapshot.
        seq: Seq,
    },
    /// A streaming query is in flight. Carries the scrubbed URL.
    Query {
        /// Credential-scrubbed changes URL for this attempt.
        url: String,
    },
    /// The feed is idle, listening for the next chunk or heartbeat.
    Wait,
    /// A streaming attempt received a valid response.
    Response,
    /// An accepted change record.
    Change(Change),
    /// The wait timer fired: no bytes arrived within the heartbeat window
    /// and the connection is considered dead.
    Timeout(TimeoutInfo),
    /// A reconnection attempt has been scheduled.
    Retry(RetryInfo),
    /// The feed was stopped by the caller. Terminal.
    Stop(Option<JsonValue>),
    /// The feed died on a fatal condition. Terminal.
    Error(CouchLinkError),
}

impl FeedEvent {
    /// Returns `true` for the two terminal events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedEvent::Stop(_) | FeedEvent::Error(_))
    }
}
