//! Resilient client for CouchDB-style changes feeds.
//!
//! A changes feed is a long-lived HTTP response whose body is a stream of
//! newline-delimited JSON change records, interleaved with blank-line
//! heartbeats and terminated — when the database goes away — by a
//! `last_seq` sentinel. This crate follows such a feed indefinitely:
//!
//! - Confirms the database and resolves symbolic starting cursors
//!   (`now`, negative offsets) before the first query
//! - Streams records with an incremental line decoder, surviving arbitrary
//!   chunk boundaries
//! - Detects dead connections with a heartbeat-derived wait timer and
//!   reconnects with exponential backoff, resuming from the last confirmed
//!   cursor so no change is skipped or re-delivered
//! - Optionally enforces an inactivity window between accepted changes
//! - Filters changes server-side (by filter name) or in-process (by
//!   predicate)
//!
//! # Example
//!
//! ```rust,no_run
//! use couch_link::{Feed, FeedEvent, FeedOptions, Since};
//! use std::time::Duration;
//!
//! # async fn example() -> couch_link::Result<()> {
//! let options = FeedOptions::new("http://localhost:5984/mydb")
//!     .with_heartbeat(Duration::from_secs(10))
//!     .with_since(Since::Now)
//!     .with_include_docs(true);
//!
//! let mut feed = Feed::new(options).follow()?;
//! while let Some(event) = feed.recv().await {
//!     match event {
//!         FeedEvent::Change(change) => {
//!             println!("{} changed at seq {}", change.id.as_deref().unwrap_or("?"), change.seq);
//!         }
//!         FeedEvent::Error(e) => return Err(e),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Recoverable trouble (connection errors, timeouts, non-200 responses,
//! stale sequences) never reaches the caller except through the
//! informational [`FeedEvent::Timeout`] and [`FeedEvent::Retry`] events.
//! Fatal conditions end the feed with exactly one [`FeedEvent::Error`];
//! to resume, construct a new [`Feed`] starting from the last observed
//! sequence.

mod decoder;
pub mod error;
pub mod events;
pub mod feed;
pub mod models;
pub mod options;
pub mod scrub;

pub use error::{CouchLinkError, Result};
pub use events::{FeedEvent, RetryInfo, TimeoutInfo};
pub use feed::{Feed, FeedHandle};
pub use models::{Change, ChangeRev, DbInfo, Seq};
pub use options::{
    FeedFilter, FeedMode, FeedOptions, FilterContext, FilterFn, Since, DEFAULT_HEARTBEAT,
    DEFAULT_MAX_RETRY, HEARTBEAT_TIMEOUT_COEFFICIENT, INITIAL_RETRY_DELAY, LONGPOLL_LIMIT,
};
pub use scrub::scrub_creds;
