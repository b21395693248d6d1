//! The feed-following state machine.
//!
//! Provides a resilient follower for a single changes feed.  Handles:
//!
//! - Connection lifecycle: confirm → query → stream → retry
//! - Dual-timer failure detection (wait timer and optional inactivity timer)
//! - Automatic reconnection with exponential backoff, resuming from the
//!   last confirmed cursor
//! - Catch-up detection against the sequence observed at confirmation
//! - Optional server-side or in-process change filtering
//!
//! The public surface is [`Feed`] (configuration in, [`FeedHandle`] out).
//! All mutable state lives in a background task that owns the single
//! pending connection; the handle talks to it over channels.

use crate::{
    decoder::{FeedLine, LineDecoder},
    error::{CouchLinkError, Result},
    events::{FeedEvent, RetryInfo, TimeoutInfo},
    models::{Change, DbInfo, Seq},
    options::{
        FeedFilter, FeedMode, FeedOptions, FilterContext, HEARTBEAT_TIMEOUT_COEFFICIENT,
        INITIAL_RETRY_DELAY, LONGPOLL_LIMIT,
    },
    scrub::scrub_creds,
};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

/// Capacity of the event channel between the feed task and the handle.
const EVENT_CHANNEL_CAPACITY: usize = 8192;

/// Maximum sleep duration that won't overflow `Instant + Duration`.
/// ~100 years is far enough into the future to be effectively "never";
/// used for the inactivity deadline while it is unarmed.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

// ── Public handle ───────────────────────────────────────────────────────────

/// A configured changes-feed follower.
///
/// # Example
///
/// ```rust,no_run
/// use couch_link::{Feed, FeedEvent, FeedOptions, Since};
///
/// # async fn example() -> couch_link::Result<()> {
/// let options = FeedOptions::new("http://localhost:5984/mydb")
///     .with_since(Since::Now);
/// let mut feed = Feed::new(options).follow()?;
///
/// while let Some(event) = feed.recv().await {
///     match event {
///         FeedEvent::Change(change) => println!("change {}", change.seq),
///         FeedEvent::Error(e) => return Err(e),
///         _ => {}
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Feed {
    options: FeedOptions,
}

impl Feed {
    /// Create a feed from its configuration.
    pub fn new(options: FeedOptions) -> Self {
        Self { options }
    }

    /// Validate the configuration and start following.
    ///
    /// Fails synchronously with [`CouchLinkError::ConfigurationError`] if
    /// the configuration is invalid; nothing touches the network in that
    /// case. Must be called within a tokio runtime.
    pub fn follow(self) -> Result<FeedHandle> {
        self.options.validate()?;

        let client = match &self.options.http_client {
            Some(client) => client.clone(),
            None => build_default_client()?,
        };

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let db_safe = scrub_creds(&self.options.db);
        let now = Instant::now();

        let task = FeedTask {
            options: self.options,
            client,
            events: event_tx,
            cmds: cmd_rx,
            since: Seq::Number(0),
            caught_up: false,
            retry_delay: INITIAL_RETRY_DELAY,
            original_seq: Seq::Number(0),
            change_at: now,
            inactivity_deadline: now + FAR_FUTURE,
            next_connection_id: 1,
            db_safe,
            dead: false,
        };

        Ok(FeedHandle {
            events: event_rx,
            cmds: cmd_tx,
            _task: tokio::spawn(task.run()),
        })
    }
}

/// Handle to a running feed.
///
/// Receives [`FeedEvent`]s and controls termination. Dropping the handle
/// ends the feed.
pub struct FeedHandle {
    events: mpsc::Receiver<FeedEvent>,
    cmds: mpsc::Sender<FeedCmd>,
    _task: JoinHandle<()>,
}

impl FeedHandle {
    /// Receive the next feed event.
    ///
    /// Returns `None` once the feed has terminated and all buffered events
    /// have been drained.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    /// Gracefully stop the feed.
    ///
    /// Exactly one [`FeedEvent::Stop`] echoing `value` follows (unless the
    /// feed already terminated), and nothing after it.
    pub async fn stop(&self, value: Option<JsonValue>) {
        let _ = self.cmds.send(FeedCmd::Stop { value }).await;
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        // Best-effort shutdown signal; the task also notices the closed
        // event channel on its next send.
        let _ = self.cmds.try_send(FeedCmd::Stop { value: None });
    }
}

// ── Internal machinery ──────────────────────────────────────────────────────

/// Commands sent from the handle to the feed task.
enum FeedCmd {
    Stop { value: Option<JsonValue> },
}

/// How a phase of the state machine ended.
enum Flow {
    /// Recoverable failure; go through the retry controller.
    Retry,
    /// Fatal condition; die with the error.
    Die(CouchLinkError),
    /// `stop()` was called.
    Stop(Option<JsonValue>),
    /// The handle is gone; exit silently.
    Closed,
}

fn flow_from_cmd(cmd: Option<FeedCmd>) -> Flow {
    match cmd {
        Some(FeedCmd::Stop { value }) => Flow::Stop(value),
        None => Flow::Closed,
    }
}

/// The single in-flight streaming connection.
///
/// Replaced wholesale on every retry, never mutated in place. Dropping it
/// aborts the transport, so data from a superseded connection can never
/// reach the controller.
struct PendingConnection {
    id: u64,
    created_at: Instant,
    activity_at: Instant,
    decoder: LineDecoder,
}

impl PendingConnection {
    fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            activity_at: now,
            decoder: LineDecoder::new(),
        }
    }
}

/// The background task owning all feed state.
struct FeedTask {
    options: FeedOptions,
    client: reqwest::Client,
    events: mpsc::Sender<FeedEvent>,
    cmds: mpsc::Receiver<FeedCmd>,

    /// Current cursor; non-decreasing once confirmation has resolved it.
    since: Seq,
    caught_up: bool,
    retry_delay: Duration,
    /// The database's sequence value observed at confirmation time.
    original_seq: Seq,
    /// When the last change was accepted (or the current response began).
    change_at: Instant,
    /// Fires when no accepted change arrived within the inactivity window.
    /// Far-future while unarmed.
    inactivity_deadline: Instant,
    next_connection_id: u64,
    db_safe: String,
    dead: bool,
}

impl FeedTask {
    async fn run(mut self) {
        let flow = self.follow_loop().await;
        match flow {
            Flow::Die(error) => self.die(Some(error)).await,
            Flow::Stop(value) => {
                self.die(None).await;
                let _ = self.events.send(FeedEvent::Stop(value)).await;
            }
            // `Retry` never escapes follow_loop; a closed handle needs no
            // events.
            Flow::Closed | Flow::Retry => {
                self.dead = true;
            }
        }
    }

    async fn follow_loop(&mut self) -> Flow {
        if !self.emit(FeedEvent::Start).await {
            return Flow::Closed;
        }

        if let Some(flow) = self.confirm().await {
            return flow;
        }

        loop {
            match self.attempt().await {
                Flow::Retry => {
                    if let Some(flow) = self.pause_before_retry().await {
                        return flow;
                    }
                }
                flow => return flow,
            }
        }
    }

    // ── Confirm phase ───────────────────────────────────────────────────

    /// One-shot database lookup: verifies identity, snapshots the current
    /// sequence, and resolves symbolic starting cursors. No retry — an
    /// unreachable database at startup is fatal.
    async fn confirm(&mut self) -> Option<Flow> {
        log::debug!("[couch-link] Checking database: {}", self.db_safe);
        if !self
            .emit(FeedEvent::ConfirmRequest {
                url: self.db_safe.clone(),
            })
            .await
        {
            return Some(Flow::Closed);
        }

        let mut headers = self.options.headers.clone();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        // Give it time to look up the name, connect, etc.
        let confirm_timeout = self.options.heartbeat * 3;
        let request = self.client.get(self.options.db.trim()).headers(headers);

        let body = tokio::select! {
            biased;
            cmd = self.cmds.recv() => return Some(flow_from_cmd(cmd)),
            result = tokio::time::timeout(confirm_timeout, confirm_body(request)) => match result {
                Err(_) => {
                    return Some(Flow::Die(CouchLinkError::ConfirmError(format!(
                        "Timeout confirming database: {}",
                        self.db_safe
                    ))));
                }
                Ok(Err(e)) => {
                    return Some(Flow::Die(CouchLinkError::ConfirmError(format!(
                        "Confirm request to {} failed: {}",
                        self.db_safe, e
                    ))));
                }
                Ok(Ok(body)) => body,
            },
        };

        let value: JsonValue = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(e) => {
                return Some(Flow::Die(CouchLinkError::ProtocolError(format!(
                    "Malformed confirm body: {}",
                    e
                ))));
            }
        };

        let has_identity = value
            .get("db_name")
            .and_then(JsonValue::as_str)
            .map_or(false, |name| !name.is_empty())
            && value.get("instance_start_time").map_or(false, |v| !v.is_null());
        if !has_identity {
            return Some(Flow::Die(CouchLinkError::ProtocolError(format!(
                "Bad DB response: {}",
                body
            ))));
        }

        let db: DbInfo = match serde_json::from_value(value) {
            Ok(db) => db,
            Err(e) => {
                return Some(Flow::Die(CouchLinkError::ProtocolError(format!(
                    "Bad DB response: {}",
                    e
                ))));
            }
        };

        self.original_seq = db.update_seq.clone();
        log::debug!("[couch-link] Confirmed database: {}", self.db_safe);
        if !self.emit(FeedEvent::Confirm(db)).await {
            return Some(Flow::Closed);
        }

        self.since = self.options.since.resolve(&self.original_seq);
        log::debug!(
            "[couch-link] Following {} from since={}",
            self.db_safe,
            self.since
        );

        // If the next change would come after the current sequence, the
        // caller is already caught up.
        if self.since == self.original_seq {
            self.caught_up = true;
            if !self
                .emit(FeedEvent::Catchup {
                    seq: self.original_seq.clone(),
                })
                .await
            {
                return Some(Flow::Closed);
            }
        }

        None
    }

    // ── Query phase ─────────────────────────────────────────────────────

    /// One streaming attempt: build the request, require a response within
    /// one heartbeat, then stream until something ends the connection.
    async fn attempt(&mut self) -> Flow {
        let (url, query) = match build_changes_query(&self.options, &self.since) {
            Ok(built) => built,
            Err(e) => return Flow::Die(e),
        };
        let url_safe = scrub_creds(url.as_str());
        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;

        log::debug!("[couch-link] Query {}: {}", connection_id, url_safe);
        if !self.emit(FeedEvent::Query { url: url_safe }).await {
            return Flow::Closed;
        }

        let mut headers = self.options.headers.clone();
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("application/json"));
        let request = self.client.get(url).headers(headers);

        // The response headers must arrive within one heartbeat. Dropping
        // the send future on timeout aborts the attempt at the transport
        // level, so a late response cannot reach us.
        let response = tokio::select! {
            biased;
            cmd = self.cmds.recv() => return flow_from_cmd(cmd),
            _ = tokio::time::sleep_until(self.inactivity_deadline),
                if self.options.inactivity_timeout.is_some() =>
            {
                return Flow::Die(self.inactivity_error());
            }
            result = tokio::time::timeout(self.options.heartbeat, request.send()) => match result {
                Err(_) => {
                    log::debug!("[couch-link] Feed response timed out: {}", connection_id);
                    return Flow::Retry;
                }
                Ok(Err(e)) => {
                    log::debug!("[couch-link] Request error {}: {}", connection_id, e);
                    return Flow::Retry;
                }
                Ok(Ok(response)) => response,
            },
        };

        if response.status() != StatusCode::OK {
            log::debug!(
                "[couch-link] Bad changes response {}: {}",
                connection_id,
                response.status()
            );
            return Flow::Retry;
        }

        log::debug!("[couch-link] Good response: {}", connection_id);
        self.retry_delay = INITIAL_RETRY_DELAY;
        if !self.emit(FeedEvent::Response).await {
            return Flow::Closed;
        }

        // The inactivity window covers time between changes, and between
        // this response and the first change; it starts here.
        self.change_at = Instant::now();
        self.rearm_inactivity();

        let context = FilterContext { query };
        self.stream(response, connection_id, &context).await
    }

    // ── Stream phase ────────────────────────────────────────────────────

    /// Consume the response body chunk by chunk until a timer fires, the
    /// stream ends, or a line ends the feed.
    async fn stream(
        &mut self,
        response: reqwest::Response,
        connection_id: u64,
        context: &FilterContext,
    ) -> Flow {
        let mut body = Box::pin(response.bytes_stream());
        let mut conn = PendingConnection::new(connection_id);
        let wait_timeout = self
            .options
            .heartbeat
            .mul_f64(HEARTBEAT_TIMEOUT_COEFFICIENT);
        let mut wait_deadline = Instant::now() + wait_timeout;

        if !self.emit(FeedEvent::Wait).await {
            return Flow::Closed;
        }

        loop {
            tokio::select! {
                biased;
                cmd = self.cmds.recv() => return flow_from_cmd(cmd),
                _ = tokio::time::sleep_until(self.inactivity_deadline),
                    if self.options.inactivity_timeout.is_some() =>
                {
                    return Flow::Die(self.inactivity_error());
                }
                _ = tokio::time::sleep_until(wait_deadline) => {
                    let elapsed = conn.activity_at.elapsed();
                    log::warn!(
                        "[couch-link] Connection {} silent for {:?} (age {:?}), closing it",
                        conn.id,
                        elapsed,
                        conn.created_at.elapsed()
                    );
                    if !self
                        .emit(FeedEvent::Timeout(TimeoutInfo {
                            elapsed,
                            heartbeat: self.options.heartbeat,
                            connection_id: conn.id,
                        }))
                        .await
                    {
                        return Flow::Closed;
                    }
                    return Flow::Retry;
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        conn.activity_at = Instant::now();
                        if let Some(flow) = self.process_chunk(&mut conn, bytes, context).await {
                            return flow;
                        }
                        wait_deadline = Instant::now() + wait_timeout;
                        if !self.emit(FeedEvent::Wait).await {
                            return Flow::Closed;
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("[couch-link] Changes stream error {}: {}", conn.id, e);
                        return Flow::Retry;
                    }
                    None => {
                        log::debug!("[couch-link] Changes feed ended {}", conn.id);
                        return Flow::Retry;
                    }
                },
            }
        }
    }

    /// Decode one chunk's worth of lines. `None` means keep streaming.
    async fn process_chunk(
        &mut self,
        conn: &mut PendingConnection,
        chunk: Bytes,
        context: &FilterContext,
    ) -> Option<Flow> {
        conn.decoder.push(&chunk);

        loop {
            // A Change handler may have called stop() while this chunk was
            // being processed; honor that before touching the next line.
            match self.cmds.try_recv() {
                Ok(FeedCmd::Stop { value }) => return Some(Flow::Stop(value)),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return Some(Flow::Closed),
            }

            let line = match conn.decoder.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some(Flow::Die(e)),
            };

            match line {
                FeedLine::Heartbeat => {
                    log::debug!("[couch-link] Heartbeat: {}", conn.id);
                }
                FeedLine::End { last_seq, pending } => {
                    log::warn!(
                        "[couch-link] Final message on {} (last_seq={}, pending={:?})",
                        conn.id,
                        last_seq,
                        pending
                    );
                    return Some(Flow::Die(CouchLinkError::DatabaseDeleted { last_seq }));
                }
                FeedLine::Change(change) => {
                    if let Some(flow) = self.dispatch_change(*change, conn.id, context).await {
                        return Some(flow);
                    }
                }
            }
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Validate, filter and deliver one change. `None` means move on to
    /// the next line.
    async fn dispatch_change(
        &mut self,
        change: Change,
        connection_id: u64,
        context: &FilterContext,
    ) -> Option<Flow> {
        if change.seq <= self.since {
            log::debug!(
                "[couch-link] Stale seq {} (since={}) on {}, reconnecting",
                change.seq,
                self.since,
                connection_id
            );
            return Some(Flow::Retry);
        }

        if !self.caught_up && change.seq >= self.original_seq {
            self.caught_up = true;
            if !self
                .emit(FeedEvent::Catchup {
                    seq: change.seq.clone(),
                })
                .await
            {
                return Some(Flow::Closed);
            }
        }

        if let Some(FeedFilter::Local(filter)) = &self.options.filter {
            let Some(doc) = &change.doc else {
                return Some(Flow::Die(CouchLinkError::ProtocolError(format!(
                    "In-process filter needs doc in change {}",
                    change.seq
                ))));
            };

            // Hand the predicate a copy so it cannot mutate the record
            // that gets dispatched.
            let doc = doc.clone();
            let filter = Arc::clone(filter);
            let passed =
                catch_unwind(AssertUnwindSafe(|| filter(&doc, context))).unwrap_or_else(|_| {
                    log::warn!(
                        "[couch-link] Filter panicked on change {}, treating as reject",
                        change.seq
                    );
                    false
                });

            if !passed {
                log::debug!("[couch-link] Filter rejected change {}", change.seq);
                return None;
            }
            log::debug!("[couch-link] Filter passed change {}", change.seq);
        }

        self.change_at = Instant::now();
        self.rearm_inactivity();
        self.since = change.seq.clone();
        if !self.emit(FeedEvent::Change(change)).await {
            return Some(Flow::Closed);
        }
        None
    }

    // ── Retry controller ────────────────────────────────────────────────

    /// Announce and sleep out one backoff period, then double the delay up
    /// to the ceiling. `None` means proceed with the next attempt.
    async fn pause_before_retry(&mut self) -> Option<Flow> {
        let delay = self.retry_delay;
        log::debug!(
            "[couch-link] Retrying since={} after {:?}: {}",
            self.since,
            delay,
            self.db_safe
        );
        if !self
            .emit(FeedEvent::Retry(RetryInfo {
                since: self.since.clone(),
                after: delay,
                db: self.db_safe.clone(),
            }))
            .await
        {
            return Some(Flow::Closed);
        }

        self.retry_delay = std::cmp::min(delay * 2, self.options.max_retry);

        let retry_at = Instant::now() + delay;
        tokio::select! {
            biased;
            cmd = self.cmds.recv() => Some(flow_from_cmd(cmd)),
            _ = tokio::time::sleep_until(self.inactivity_deadline),
                if self.options.inactivity_timeout.is_some() =>
            {
                Some(Flow::Die(self.inactivity_error()))
            }
            _ = tokio::time::sleep_until(retry_at) => None,
        }
    }

    // ── Termination ─────────────────────────────────────────────────────

    /// Forceful termination. Idempotent; emits at most one `Error` event.
    /// Timers and the pending connection are select-scoped and already
    /// dropped by the time this runs.
    async fn die(&mut self, error: Option<CouchLinkError>) {
        if self.dead {
            return;
        }
        self.dead = true;

        if let Some(error) = error {
            log::error!("[couch-link] Fatal feed error: {}", error);
            let _ = self.events.send(FeedEvent::Error(error)).await;
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    async fn emit(&self, event: FeedEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    fn rearm_inactivity(&mut self) {
        if let Some(window) = self.options.inactivity_timeout {
            self.inactivity_deadline = Instant::now() + window;
        }
    }

    fn inactivity_error(&self) -> CouchLinkError {
        CouchLinkError::InactivityTimeout {
            elapsed: self.change_at.elapsed(),
        }
    }
}

async fn confirm_body(request: reqwest::RequestBuilder) -> reqwest::Result<String> {
    request.send().await?.text().await
}

fn build_default_client() -> Result<reqwest::Client> {
    // No whole-request timeout: a continuous feed holds one response open
    // indefinitely. Liveness is the wait timer's job.
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| CouchLinkError::ConfigurationError(e.to_string()))
}

/// Build the `_changes` URL for one attempt.
///
/// Passthrough parameters go in first; the reserved feed parameters
/// override them on conflict. Returns the URL and the final parameter map
/// (the read-only query context handed to in-process filters).
fn build_changes_query(
    options: &FeedOptions,
    since: &Seq,
) -> Result<(Url, HashMap<String, String>)> {
    let mut query = options.query_params.clone();
    query.insert("since".to_string(), since.to_string());
    query.insert("feed".to_string(), options.feed.as_str().to_string());
    query.insert(
        "heartbeat".to_string(),
        options.heartbeat.as_millis().to_string(),
    );

    // Bound one polling response.
    let mut limit = options.limit;
    if options.feed == FeedMode::Longpoll && limit.map_or(true, |l| l > LONGPOLL_LIMIT) {
        limit = Some(LONGPOLL_LIMIT);
    }
    if let Some(limit) = limit {
        query.insert("limit".to_string(), limit.to_string());
    }

    let mut include_docs = options.include_docs;
    match &options.filter {
        Some(FeedFilter::ServerSide(name)) => {
            query.insert("filter".to_string(), name.clone());
        }
        Some(FeedFilter::Local(_)) => {
            // An in-process predicate is never sent; it needs the document
            // body instead.
            query.remove("filter");
            if !include_docs {
                log::debug!("[couch-link] Enabling include_docs for in-process filter");
                include_docs = true;
            }
        }
        None => {}
    }
    if include_docs {
        query.insert("include_docs".to_string(), "true".to_string());
    }

    let mut url = Url::parse(options.db.trim()).map_err(|e| {
        CouchLinkError::ConfigurationError(format!("Invalid database URL '{}': {}", options.db, e))
    })?;
    url.path_segments_mut()
        .map_err(|_| {
            CouchLinkError::ConfigurationError(format!(
                "Database URL '{}' cannot carry a path",
                options.db
            ))
        })?
        .pop_if_empty()
        .push("_changes");
    url.query_pairs_mut().extend_pairs(query.iter());

    Ok((url, query))
}
