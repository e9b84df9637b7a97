use serde::Serialize;

/// Structured trace events emitted across the daemon, logged as a single
/// JSON-encoded field on an `info`-level `tracing` event (teacher's
/// `sa_event` convention) so both the stdout sink and the on-disk
/// `daemon.log-lines` sink carry the same structured record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        session_id: String,
        rehydrated: bool,
    },
    SessionEvicted {
        session_id: String,
    },
    TurnEnqueued {
        session_id: String,
        turn_id: String,
        ingress_seq: u64,
    },
    TurnStarted {
        session_id: String,
        turn_id: String,
    },
    TurnCompleted {
        session_id: String,
        turn_id: String,
        status: String,
    },
    PermissionRequested {
        session_id: String,
        request_id: String,
        tool_name: String,
    },
    PermissionResolved {
        request_id: String,
        decision: String,
        conflict: bool,
    },
    ToolDispatched {
        tool_name: String,
        cached: bool,
        duration_ms: u64,
    },
    BackgroundProcessStarted {
        process_id: String,
        session_id: String,
    },
    BackgroundProcessExited {
        process_id: String,
        state: String,
    },
    EventAppended {
        session_id: String,
        seq: u64,
        event: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sd_event");
    }
}
