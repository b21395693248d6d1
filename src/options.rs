//! Feed configuration.
//!
//! [`FeedOptions`] enumerates every recognized option with its default; the
//! feed never accepts loose key/value bags. Options are immutable once
//! [`Feed::follow`](crate::Feed::follow) has been called.

use crate::error::{CouchLinkError, Result};
use crate::models::Seq;
use reqwest::header::HeaderMap;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default heartbeat interval requested from the server.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// A connection with no bytes at all for `heartbeat × 1.25` is dead.
/// E.g. a 1000 ms heartbeat triggers a timeout after 1250 ms of silence.
pub const HEARTBEAT_TIMEOUT_COEFFICIENT: f64 = 1.25;

/// Default ceiling for the exponential reconnect backoff.
pub const DEFAULT_MAX_RETRY: Duration = Duration::from_secs(60 * 60);

/// First reconnect delay; doubles per consecutive failure.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Longpoll responses are bounded to this many records unless the caller
/// sets a smaller explicit limit.
pub const LONGPOLL_LIMIT: u32 = 100;

/// Feed mode requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedMode {
    /// One long-lived streaming connection; the server pushes records as
    /// they happen.
    #[default]
    Continuous,
    /// Repeated bounded polls; each connection closes after one batch.
    Longpoll,
}

impl FeedMode {
    /// Wire form of the `feed` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Continuous => "continuous",
            FeedMode::Longpoll => "longpoll",
        }
    }
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Starting cursor for a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Since {
    /// An absolute sequence token.
    Seq(Seq),
    /// Start at the database's current sequence; only future changes are
    /// delivered. Equivalent to `Offset(-1)`.
    Now,
    /// A negative offset from the sequence observed at confirmation time:
    /// `Offset(-1)` replays nothing, `Offset(-11)` replays the last ten
    /// changes. Non-negative offsets fail validation; use [`Since::Seq`]
    /// for absolute cursors.
    Offset(i64),
}

impl Default for Since {
    fn default() -> Self {
        Since::Seq(Seq::Number(0))
    }
}

impl Since {
    /// Resolve a symbolic cursor against the confirmed `update_seq`.
    /// Offsets are computed on the numeric prefix and floored at zero.
    pub(crate) fn resolve(&self, update_seq: &Seq) -> Seq {
        match self {
            Since::Seq(seq) => seq.clone(),
            Since::Now => Since::Offset(-1).resolve(update_seq),
            Since::Offset(n) => {
                let base = i64::try_from(update_seq.numeric_prefix()).unwrap_or(i64::MAX);
                Seq::Number(base.saturating_add(*n).saturating_add(1).max(0) as u64)
            }
        }
    }
}

/// Read-only context handed to an in-process filter alongside the document.
#[derive(Debug, Clone)]
pub struct FilterContext {
    /// The query parameters the current connection was opened with.
    pub query: HashMap<String, String>,
}

/// In-process filter predicate: receives a defensive copy of the document
/// body plus the query context, returns whether the change is delivered.
pub type FilterFn = Arc<dyn Fn(&JsonValue, &FilterContext) -> bool + Send + Sync>;

/// Change filtering, either on the server or in-process.
#[derive(Clone)]
pub enum FeedFilter {
    /// A named server-side filter, sent as the `filter` query parameter.
    ServerSide(String),
    /// An in-process predicate. Never sent to the server; forces
    /// `include_docs=true` so the predicate has a document to inspect.
    Local(FilterFn),
}

impl FeedFilter {
    /// Convenience constructor for [`FeedFilter::Local`].
    pub fn local<F>(filter: F) -> Self
    where
        F: Fn(&JsonValue, &FilterContext) -> bool + Send + Sync + 'static,
    {
        FeedFilter::Local(Arc::new(filter))
    }
}

impl fmt::Debug for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedFilter::ServerSide(name) => f.debug_tuple("ServerSide").field(name).finish(),
            FeedFilter::Local(_) => f.write_str("Local(..)"),
        }
    }
}

/// Configuration for a changes feed.
///
/// # Example
///
/// ```rust
/// use couch_link::{FeedMode, FeedOptions, Since};
/// use std::time::Duration;
///
/// let options = FeedOptions::new("http://localhost:5984/mydb")
///     .with_feed(FeedMode::Continuous)
///     .with_heartbeat(Duration::from_secs(10))
///     .with_since(Since::Now)
///     .with_include_docs(true);
/// ```
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Database URL. Required.
    pub db: String,

    /// Feed mode. Default: [`FeedMode::Continuous`].
    pub feed: FeedMode,

    /// Heartbeat interval requested from the server; also drives the
    /// client-side wait and confirm timeouts. Default: 30 s.
    pub heartbeat: Duration,

    /// Fatal inactivity window: die if no accepted change arrives for this
    /// long, regardless of heartbeats. Default: disabled.
    pub inactivity_timeout: Option<Duration>,

    /// Ceiling for the exponential reconnect backoff. Default: 1 h.
    pub max_retry: Duration,

    /// Extra headers sent on every request.
    pub headers: HeaderMap,

    /// Preconfigured HTTP client to use instead of the crate-built one.
    /// The client must not carry a whole-request timeout, or it would cut
    /// long-lived streams short.
    pub http_client: Option<reqwest::Client>,

    /// Passthrough query parameters, e.g. arguments for a server-side
    /// filter. Reserved feed parameters override these on conflict.
    pub query_params: HashMap<String, String>,

    /// Optional change filtering.
    pub filter: Option<FeedFilter>,

    /// Request full document bodies with each change.
    pub include_docs: bool,

    /// Bound on records per response. Longpoll responses are capped at
    /// [`LONGPOLL_LIMIT`] regardless.
    pub limit: Option<u32>,

    /// Starting cursor. Default: sequence 0 (replay everything).
    pub since: Since,
}

impl FeedOptions {
    /// Create options for the given database URL with all defaults.
    pub fn new(db: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            feed: FeedMode::default(),
            heartbeat: DEFAULT_HEARTBEAT,
            inactivity_timeout: None,
            max_retry: DEFAULT_MAX_RETRY,
            headers: HeaderMap::new(),
            http_client: None,
            query_params: HashMap::new(),
            filter: None,
            include_docs: false,
            limit: None,
            since: Since::default(),
        }
    }

    /// Set the feed mode.
    pub fn with_feed(mut self, feed: FeedMode) -> Self {
        self.feed = feed;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the fatal inactivity window.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    /// Set the backoff ceiling.
    pub fn with_max_retry(mut self, max_retry: Duration) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Set extra headers sent on every request.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Use a caller-preconfigured HTTP client.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Add a passthrough query parameter.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// Set the change filter.
    pub fn with_filter(mut self, filter: FeedFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Request full document bodies with each change.
    pub fn with_include_docs(mut self, include_docs: bool) -> Self {
        self.include_docs = include_docs;
        self
    }

    /// Bound the number of records per response.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the starting cursor.
    pub fn with_since(mut self, since: Since) -> Self {
        self.since = since;
        self
    }

    /// Validate the configuration. Called by `follow()` before anything
    /// touches the network.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.db.trim().is_empty() {
            return Err(CouchLinkError::ConfigurationError(
                "Database URL required".to_string(),
            ));
        }

        let parsed = Url::parse(self.db.trim()).map_err(|e| {
            CouchLinkError::ConfigurationError(format!("Invalid database URL '{}': {}", self.db, e))
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(CouchLinkError::ConfigurationError(format!(
                "Unsupported URL scheme '{}'; only http and https are supported",
                parsed.scheme()
            )));
        }

        if let Since::Offset(n) = self.since {
            if n >= 0 {
                return Err(CouchLinkError::ConfigurationError(format!(
                    "since offset must be negative, got {}",
                    n
                )));
            }
        }

        if self.heartbeat.is_zero() {
            return Err(CouchLinkError::ConfigurationError(
                "heartbeat must be greater than zero".to_string(),
            ));
        }

        if self.max_retry < INITIAL_RETRY_DELAY {
            return Err(CouchLinkError::ConfigurationError(format!(
                "max_retry must be at least {:?}",
                INITIAL_RETRY_DELAY
            )));
        }

        Ok(())
    }
}
