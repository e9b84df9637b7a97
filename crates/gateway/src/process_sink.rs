//! Bridges background-process lifecycle callbacks into session events
//! (§3, §4.5: `background.output` / `background.status`).

use std::sync::Arc;

use async_trait::async_trait;
use sd_domain::envelope::kind;
use sd_domain::model::{BackgroundProcess, BackgroundProcessState, OutputChunk};
use sd_domain::trace::TraceEvent;
use sd_process::ProcessEventSink;

use crate::runtime::SessionManager;

pub struct SessionEventProcessSink {
    manager: Arc<SessionManager>,
}

impl SessionEventProcessSink {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ProcessEventSink for SessionEventProcessSink {
    async fn on_output(&self, session_id: &str, process_id: &str, chunk: OutputChunk) {
        self.manager.emit(
            session_id,
            kind::BACKGROUND_OUTPUT,
            serde_json::json!({
                "processId": process_id,
                "seq": chunk.seq,
                "stream": chunk.stream,
                "text": chunk.text,
            }),
        );
    }

    async fn on_state_change(&self, session_id: &str, process: BackgroundProcess) {
        match process.state {
            BackgroundProcessState::Running => {
                TraceEvent::BackgroundProcessStarted {
                    process_id: process.process_id.clone(),
                    session_id: session_id.to_string(),
                }
                .emit();
            }
            ref state if state.is_terminal() => {
                TraceEvent::BackgroundProcessExited {
                    process_id: process.process_id.clone(),
                    state: format!("{state:?}"),
                }
                .emit();
            }
            _ => {}
        }
        self.manager.emit(
            session_id,
            kind::BACKGROUND_STATUS,
            serde_json::to_value(process).unwrap_or_default(),
        );
    }
}
