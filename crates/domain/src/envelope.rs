//! Wire envelope (§3, §6) and the event kind constants it carries.

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "3";

/// The envelope wrapping every event delivered over HTTP replay, WS push,
/// or SSE push — identical shape on all three transports (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: String,
    pub event: String,
    #[serde(rename = "daemonId")]
    pub daemon_id: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub seq: u64,
    pub ts: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(
        daemon_id: &str,
        event: &str,
        session_id: Option<String>,
        seq: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: PROTOCOL_VERSION.to_string(),
            event: event.to_string(),
            daemon_id: daemon_id.to_string(),
            session_id,
            seq,
            ts: Utc::now().to_rfc3339(),
            payload,
        }
    }
}

/// Event kind string constants (§3). Grouped by whether they are persisted.
pub mod kind {
    pub const SESSION_SNAPSHOT: &str = "session.snapshot";
    pub const TURN_QUEUED: &str = "turn.queued";
    pub const TURN_START: &str = "turn.start";
    pub const TURN_TOKEN: &str = "turn.token";
    pub const TURN_THINKING: &str = "turn.thinking";
    pub const TOOL_START: &str = "tool.start";
    pub const TOOL_END: &str = "tool.end";
    pub const PERMISSION_REQUEST: &str = "permission.request";
    pub const PERMISSION_RESOLVED: &str = "permission.resolved";
    pub const TURN_PROGRESS: &str = "turn.progress";
    pub const TURN_DONE: &str = "turn.done";
    pub const TURN_ERROR: &str = "turn.error";
    pub const SESSION_UPDATED: &str = "session.updated";
    pub const SESSION_CANCELLED: &str = "session.cancelled";
    pub const BACKGROUND_OUTPUT: &str = "background.output";
    pub const BACKGROUND_STATUS: &str = "background.status";
}

/// High-frequency token/thinking events are ephemeral: delivered live only,
/// never persisted to the event log (§3, §9 open question).
pub fn is_ephemeral(event_kind: &str) -> bool {
    matches!(event_kind, kind::TURN_TOKEN | kind::TURN_THINKING)
}

/// `turn.done.payload.stats` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStats {
    pub tokens: u64,
    #[serde(rename = "promptTokens")]
    pub prompt_tokens: u64,
    #[serde(rename = "completionTokens")]
    pub completion_tokens: u64,
    #[serde(rename = "toolCalls")]
    pub tool_calls: u64,
    pub elapsed: f64,
    pub speed: f64,
    #[serde(rename = "firstTokenLatencyMs")]
    pub first_token_latency_ms: Option<u64>,
}

/// `turn.error.payload` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnErrorPayload {
    #[serde(rename = "turnId")]
    pub turn_id: String,
    #[serde(rename = "writerId")]
    pub writer_id: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_kinds_are_token_and_thinking_only() {
        assert!(is_ephemeral(kind::TURN_TOKEN));
        assert!(is_ephemeral(kind::TURN_THINKING));
        assert!(!is_ephemeral(kind::TURN_DONE));
        assert!(!is_ephemeral(kind::SESSION_SNAPSHOT));
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new("daemon_abc", kind::TURN_DONE, Some("s1".into()), 3, serde_json::json!({"ok": true}));
        let s = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&s).unwrap();
        assert_eq!(back.v, "3");
        assert_eq!(back.seq, 3);
        assert_eq!(back.session_id.as_deref(), Some("s1"));
    }
}
