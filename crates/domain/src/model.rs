//! Core domain types: sessions, turns, permission requests, background
//! processes — the data model in spec §3.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tool::Message;

/// Printable ASCII, `[A-Za-z0-9_-]{1,64}` — the session ID allowlist (§3, §6).
pub fn validate_session_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid session id: {id}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tool_call_count: u64,
    /// Running event sequence number — strictly monotonic, gap-free (§3).
    #[serde(default)]
    pub seq: u64,
}

impl Session {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            model: model.into(),
            title: None,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            tool_call_count: 0,
            seq: 0,
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// `chat` drives the normal conversational agent loop; `do` is a
/// task-execution mode with (by convention of the injected agent) fewer
/// conversational guardrails. The daemon treats both identically — mode is
/// opaque metadata passed through to the agent driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnMode {
    Chat,
    Do,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Queued,
    Active,
    Done,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    /// Process-wide monotonic counter assigned at enqueue time (§3); resets
    /// to 0 on daemon restart — see the open-question decision in DESIGN.md.
    pub ingress_seq: u64,
    pub session_id: String,
    pub client_id: String,
    pub writer_id: String,
    pub content: String,
    pub mode: TurnMode,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A single client decision on a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundProcessState {
    Running,
    Completed,
    Failed,
    Killed,
    Timeout,
}

impl BackgroundProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackgroundProcessState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChunk {
    pub seq: u64,
    pub stream: OutputStream,
    pub text: String,
    pub ts: DateTime<Utc>,
}

/// Bounded FIFO ring of output chunks: evicts from the head once the summed
/// `text` byte length exceeds `max_bytes` (§3, §4.5, property P7).
#[derive(Debug, Clone)]
pub struct OutputRing {
    chunks: VecDeque<OutputChunk>,
    total_bytes: usize,
    max_bytes: usize,
    next_seq: u64,
}

impl OutputRing {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
            next_seq: 0,
        }
    }

    pub fn push(&mut self, stream: OutputStream, text: String) -> OutputChunk {
        let seq = self.next_seq;
        self.next_seq += 1;
        let chunk = OutputChunk {
            seq,
            stream,
            text,
            ts: Utc::now(),
        };
        self.total_bytes += chunk.text.len();
        self.chunks.push_back(chunk.clone());
        while self.total_bytes > self.max_bytes {
            if let Some(evicted) = self.chunks.pop_front() {
                self.total_bytes -= evicted.text.len();
            } else {
                break;
            }
        }
        chunk
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Chunks with `seq > after_seq`, oldest first, up to `limit`.
    pub fn after(&self, after_seq: u64, limit: usize, stream: Option<OutputStream>) -> (Vec<OutputChunk>, bool) {
        let matching: Vec<&OutputChunk> = self
            .chunks
            .iter()
            .filter(|c| c.seq > after_seq)
            .filter(|c| stream.map(|s| s == c.stream).unwrap_or(true))
            .collect();
        let has_more = matching.len() > limit;
        let out = matching.into_iter().take(limit).cloned().collect();
        (out, has_more)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundProcess {
    pub process_id: String,
    pub session_id: String,
    pub os_pid: Option<u32>,
    pub command: String,
    pub cwd: Option<String>,
    pub state: BackgroundProcessState,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_allowlist_accepts_valid() {
        assert!(validate_session_id("sess-e2e-1").is_ok());
        assert!(validate_session_id("a").is_ok());
        assert!(validate_session_id(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn session_id_allowlist_rejects_invalid() {
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"a".repeat(65)).is_err());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("has/slash").is_err());
    }

    #[test]
    fn output_ring_evicts_oldest_when_over_budget() {
        let mut ring = OutputRing::new(10);
        ring.push(OutputStream::Stdout, "12345".into());
        ring.push(OutputStream::Stdout, "67890".into());
        assert_eq!(ring.total_bytes(), 10);
        ring.push(OutputStream::Stdout, "abcde".into());
        assert!(ring.total_bytes() <= 10);
        let (chunks, _) = ring.after(0, 100, None);
        let combined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert!(combined.ends_with("abcde"));
    }

    #[test]
    fn output_ring_after_seq_filters_and_reports_has_more() {
        let mut ring = OutputRing::new(1_000_000);
        for i in 0..5 {
            ring.push(OutputStream::Stdout, format!("chunk{i}"));
        }
        let (chunks, has_more) = ring.after(1, 2, None);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].seq, 2);
        assert!(has_more);
    }
}
