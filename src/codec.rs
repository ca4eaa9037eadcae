//! Wire protocol: newline-framed UTF-8 lines.
//!
//! A request line is `!command=payload`, where the payload is an optional
//! JSON value; payload text that is not valid JSON is taken as a JSON
//! string. Lines without the `!` sigil are raw text and fall through to the
//! server's default policy. Responses are JSON envelopes
//! `{"method": ..., "params": ...}` followed by `\n`.
//!
//! serde_json escapes control characters inside strings, so an encoded
//! frame never contains a raw newline and the framing is unambiguous.
//! Trailing `\r` is stripped on decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Leading byte marking a command line.
pub const COMMAND_SIGIL: char = '!';
/// Prefix on default-policy echo replies, distinguishing them from command
/// responses.
pub const ECHO_PREFIX: &str = "echo: ";

/// Client-to-server message: a command name plus structured payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

/// Server-to-client message envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Response {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Parse one decoded line as a request.
///
/// Returns `None` for raw text lines (no sigil, or an empty command name).
/// Command names are normalized to ASCII lowercase.
pub fn parse_request(line: &str) -> Option<Request> {
    let rest = line.strip_prefix(COMMAND_SIGIL)?;
    let (name, payload) = match rest.split_once('=') {
        Some((name, payload)) => (name, payload),
        None => (rest, ""),
    };

    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let payload = payload.trim();
    let payload = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
    };

    Some(Request {
        command: name.to_ascii_lowercase(),
        payload,
    })
}

/// Encode a request as a framed command line.
pub fn encode_request(command: &str, payload: &Value) -> Result<Vec<u8>> {
    let mut line = String::with_capacity(command.len() + 16);
    line.push(COMMAND_SIGIL);
    line.push_str(&command.to_ascii_lowercase());
    line.push('=');
    if !payload.is_null() {
        line.push_str(&serde_json::to_string(payload)?);
    }
    line.push('\n');
    Ok(line.into_bytes())
}

/// Encode a response envelope as a framed JSON line.
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(response)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Encode a default-policy echo reply.
pub fn encode_echo(line: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ECHO_PREFIX.len() + line.len() + 1);
    frame.extend_from_slice(ECHO_PREFIX.as_bytes());
    frame.extend_from_slice(line.as_bytes());
    frame.push(b'\n');
    frame
}

/// Per-connection reassembly buffer for partial reads.
///
/// A readiness notification does not guarantee a full frame is available;
/// bytes accumulate here until at least one delimiter shows up. The buffer
/// is bounded: a peer that streams more than `max_frame` bytes without a
/// newline overflows and gets evicted by the caller.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: Vec<u8>,
    max_frame: usize,
}

impl RecvBuffer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    /// Append received bytes. Returns `false` when the undelimited tail
    /// exceeds the frame limit.
    ///
    /// Only the bytes after the last delimiter count against the limit;
    /// complete lines awaiting a drain do not shield an oversized tail.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        self.buf.extend_from_slice(bytes);
        let tail_start = self
            .buf
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        self.buf.len() - tail_start <= self.max_frame
    }

    /// Extract every complete line currently buffered.
    ///
    /// Lines that are not valid UTF-8 are dropped with a warning; the
    /// connection stays usable.
    pub fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.buf.drain(..=pos).collect();
            raw.pop(); // the delimiter
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            match String::from_utf8(raw) {
                Ok(line) => lines.push(line),
                Err(e) => log::warn!("dropping non-utf8 line: {e}"),
            }
        }
        lines
    }
}
