//! Incremental line-oriented decoder for changes-feed bodies.
//!
//! A feed body is a stream of `\n`-terminated lines: empty lines are
//! heartbeats, everything else is a JSON object — either a change record or
//! the terminal `last_seq` sentinel. Chunk boundaries fall anywhere, so the
//! decoder keeps the trailing partial line across chunks.

use crate::error::{CouchLinkError, Result};
use crate::models::{Change, Seq};
use serde_json::Value as JsonValue;

/// A classified line from the feed body.
#[derive(Debug)]
pub(crate) enum FeedLine {
    /// Empty keep-alive line.
    Heartbeat,
    /// A change record.
    Change(Box<Change>),
    /// Terminal sentinel closing the stream deliberately.
    End {
        last_seq: Seq,
        pending: Option<u64>,
    },
}

/// Splits raw body chunks into complete lines.
///
/// One decoder exists per connection and dies with it; a reconnect starts
/// from an empty buffer, discarding any partial line from the old stream.
#[derive(Debug, Default)]
pub(crate) struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw body chunk to the buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract and classify the next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Result<Option<FeedLine>> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };

        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        let line = std::str::from_utf8(&line[..pos]).map_err(|e| {
            CouchLinkError::ProtocolError(format!("Feed line is not valid UTF-8: {}", e))
        })?;
        classify(line.trim_end_matches('\r')).map(Some)
    }
}

fn classify(line: &str) -> Result<FeedLine> {
    if line.is_empty() {
        return Ok(FeedLine::Heartbeat);
    }

    let value: JsonValue = serde_json::from_str(line).map_err(|e| {
        CouchLinkError::ProtocolError(format!("Malformed feed line {:?}: {}", line, e))
    })?;

    if let Some(last_seq) = value.get("last_seq") {
        let last_seq: Seq = serde_json::from_value(last_seq.clone()).map_err(|e| {
            CouchLinkError::ProtocolError(format!("Unreadable last_seq in {:?}: {}", line, e))
        })?;
        let pending = value.get("pending").and_then(JsonValue::as_u64);
        return Ok(FeedLine::End { last_seq, pending });
    }

    if value.get("seq").map_or(true, JsonValue::is_null) {
        return Err(CouchLinkError::ProtocolError(format!(
            "Change has no seq field: {}",
            line
        )));
    }

    let change: Change = serde_json::from_value(value).map_err(|e| {
        CouchLinkError::ProtocolError(format!("Unreadable change record {:?}: {}", line, e))
    })?;
    Ok(FeedLine::Change(Box::new(change)))
}
