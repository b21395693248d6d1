//! In-process mock changes-feed server for integration tests.
//!
//! Serves a CouchDB-shaped surface on a loopback port: a metadata document
//! at the database root and a scripted, chunked line stream at `/_changes`.
//! Each `_changes` connection consumes the next script in FIFO order, which
//! lets a test stage fault sequences (abort mid-stream, error statuses,
//! heartbeat runs, terminal sentinels) across reconnects.

#![allow(dead_code)]

use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One step of a scripted `_changes` response.
#[derive(Debug, Clone)]
pub enum Step {
    /// A change record line.
    Change(JsonValue),
    /// A raw line, for protocol-violation tests.
    Raw(String),
    /// An empty keep-alive line.
    Heartbeat,
    /// The terminal sentinel; ends the response cleanly.
    LastSeq { last_seq: JsonValue, pending: u64 },
    /// Send nothing for this long, then continue.
    Sleep(Duration),
    /// Drop the socket without finishing the response body.
    Abort,
    /// End the chunked body cleanly, without a sentinel.
    CleanEnd,
    /// Respond with this status instead of a stream. First step only.
    Status(u16),
    /// Never send response headers. First step only.
    NoResponse,
}

/// Builder for a [`MockServer`].
pub struct MockFeed {
    confirm_body: String,
    confirm_delay: Duration,
    scripts: VecDeque<Vec<Step>>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self {
            confirm_body: confirm_body_with_update_seq(json!(0)),
            confirm_delay: Duration::ZERO,
            scripts: VecDeque::new(),
        }
    }

    /// Set the `update_seq` reported by the confirmation document.
    pub fn with_update_seq(mut self, update_seq: impl Into<JsonValue>) -> Self {
        self.confirm_body = confirm_body_with_update_seq(update_seq.into());
        self
    }

    /// Replace the confirmation body wholesale.
    pub fn with_confirm_body(mut self, body: impl Into<String>) -> Self {
        self.confirm_body = body.into();
        self
    }

    /// Delay the confirmation response.
    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    /// Queue the script for the next `_changes` connection.
    pub fn push_script(mut self, steps: Vec<Step>) -> Self {
        self.scripts.push_back(steps);
        self
    }

    /// Bind a loopback port and start serving.
    pub async fn start(self) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");

        let inner = Arc::new(Inner {
            confirm_body: self.confirm_body,
            confirm_delay: self.confirm_delay,
            scripts: Mutex::new(self.scripts),
            requests: Mutex::new(Vec::new()),
        });

        let accept_inner = Arc::clone(&inner);
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_inner)));
            }
        });

        MockServer {
            url: format!("http://{}/mockdb", addr),
            inner,
            _accept: accept,
        }
    }
}

fn confirm_body_with_update_seq(update_seq: JsonValue) -> String {
    json!({
        "db_name": "mockdb",
        "instance_start_time": "0",
        "update_seq": update_seq,
        "couchdb": "Welcome"
    })
    .to_string()
}

struct Inner {
    confirm_body: String,
    confirm_delay: Duration,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    /// Raw query strings of the `_changes` requests, in arrival order.
    requests: Mutex<Vec<String>>,
}

/// A running mock feed server.
pub struct MockServer {
    url: String,
    inner: Arc<Inner>,
    _accept: JoinHandle<()>,
}

impl MockServer {
    /// Database URL to hand to the feed under test.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Query parameters of each `_changes` request received so far.
    pub fn changes_queries(&self) -> Vec<HashMap<String, String>> {
        self.inner
            .requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|raw| parse_query(raw))
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self._accept.abort();
    }
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn handle_connection(mut stream: TcpStream, inner: Arc<Inner>) {
    let Some(target) = read_request_target(&mut stream).await else {
        return;
    };
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target.as_str(), ""),
    };

    if path.ends_with("/_changes") {
        inner
            .requests
            .lock()
            .expect("requests lock")
            .push(query.to_string());
        let script = inner.scripts.lock().expect("scripts lock").pop_front();
        serve_changes(stream, script).await;
    } else {
        tokio::time::sleep(inner.confirm_delay).await;
        let body = inner.confirm_body.as_bytes();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = stream.write_all(head.as_bytes()).await;
        let _ = stream.write_all(body).await;
        let _ = stream.flush().await;
    }
}

/// Read the request head and return the request target (path + query).
async fn read_request_target(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head_complete(&buf) {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > 64 * 1024 {
            return None;
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let request_line = head.lines().next()?;
    let mut parts = request_line.split_whitespace();
    let _method = parts.next()?;
    parts.next().map(str::to_string)
}

fn head_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

async fn serve_changes(mut stream: TcpStream, script: Option<Vec<Step>>) {
    let steps = script.unwrap_or_default();

    match steps.first() {
        Some(Step::Status(code)) => {
            let body = format!("{{\"error\":\"mock\",\"status\":{}}}\n", code);
            let head = format!(
                "HTTP/1.1 {} MOCK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                code,
                body.len()
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(body.as_bytes()).await;
            let _ = stream.flush().await;
            return;
        }
        Some(Step::NoResponse) => {
            // Hold the socket open silently; the client times out and
            // abandons it.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return;
        }
        _ => {}
    }

    let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
    if stream.write_all(head.as_bytes()).await.is_err() || stream.flush().await.is_err() {
        return;
    }

    for step in steps {
        let wrote = match step {
            Step::Change(value) => write_chunk(&mut stream, format!("{}\n", value).as_bytes()).await,
            Step::Raw(line) => write_chunk(&mut stream, format!("{}\n", line).as_bytes()).await,
            Step::Heartbeat => write_chunk(&mut stream, b"\n").await,
            Step::LastSeq { last_seq, pending } => {
                let line = format!("{}\n", json!({ "last_seq": last_seq, "pending": pending }));
                let _ = write_chunk(&mut stream, line.as_bytes()).await;
                let _ = stream.write_all(b"0\r\n\r\n").await;
                let _ = stream.flush().await;
                return;
            }
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                true
            }
            Step::Abort => {
                let _ = stream.shutdown().await;
                return;
            }
            Step::CleanEnd => {
                let _ = stream.write_all(b"0\r\n\r\n").await;
                let _ = stream.flush().await;
                return;
            }
            // Only meaningful as the first step; ignore elsewhere.
            Step::Status(_) | Step::NoResponse => true,
        };
        if !wrote {
            return;
        }
    }

    // Script exhausted without a terminal step: keep the connection alive
    // with heartbeats so the client never sees a clean end here.
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !write_chunk(&mut stream, b"\n").await {
            return;
        }
    }
}

async fn write_chunk(stream: &mut TcpStream, data: &[u8]) -> bool {
    let size = format!("{:x}\r\n", data.len());
    stream.write_all(size.as_bytes()).await.is_ok()
        && stream.write_all(data).await.is_ok()
        && stream.write_all(b"\r\n").await.is_ok()
        && stream.flush().await.is_ok()
}
