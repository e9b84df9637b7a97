//! SSE fallback for the streaming plane (§4.8): same replay-then-live merge
//! discipline as the WebSocket endpoint, for clients that cannot open a
//! WebSocket. Grounded in the teacher's `run_events_sse` (`api/runs.rs`) —
//! `Sse::new` over an `async_stream::stream!`, `KeepAlive` for the
//! heartbeat frame.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::Stream;
use serde::Deserialize;

use crate::runtime::SessionManager;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/sse/events", get(sse_events))
}

#[derive(Debug, Deserialize)]
struct SseQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "afterSeq", default)]
    after_seq: u64,
}

async fn sse_events(State(state): State<AppState>, Query(q): Query<SseQuery>) -> impl IntoResponse {
    let Some(session_id) = q.session_id else {
        let stream = futures_util::stream::once(async {
            Ok::<_, std::convert::Infallible>(Event::default().event("error").data(r#"{"error":"sessionId is required"}"#))
        });
        return Sse::new(stream).keep_alive(heartbeat()).into_response();
    };

    // Subscribe before reading backlog, same discipline as the WS handler,
    // so no event emitted in the gap is lost (§4.8).
    let Some((sub_id, rx)) = state.session_manager.subscribe(&session_id) else {
        let stream = futures_util::stream::once(async {
            Ok::<_, std::convert::Infallible>(Event::default().event("error").data(r#"{"error":"session not found"}"#))
        });
        return Sse::new(stream).keep_alive(heartbeat()).into_response();
    };

    let backlog = state.event_store.read_events_after(&session_id, q.after_seq).unwrap_or_default();
    let stream = make_event_stream(state.session_manager.clone(), session_id, sub_id, backlog, q.after_seq, rx);
    Sse::new(stream).keep_alive(heartbeat()).into_response()
}

fn heartbeat() -> KeepAlive {
    KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive")
}

struct UnsubscribeGuard {
    manager: Arc<SessionManager>,
    session_id: String,
    sub_id: u64,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        self.manager.unsubscribe(&self.session_id, self.sub_id);
    }
}

fn make_event_stream(
    manager: Arc<SessionManager>,
    session_id: String,
    sub_id: u64,
    backlog: Vec<sd_domain::envelope::Envelope>,
    after_seq: u64,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<sd_domain::envelope::Envelope>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let _guard = UnsubscribeGuard { manager, session_id, sub_id };
        let mut cursor = after_seq;

        for envelope in backlog {
            if envelope.seq > cursor {
                cursor = envelope.seq;
                yield Ok(to_event(&envelope));
            }
        }

        while let Some(envelope) = rx.recv().await {
            if envelope.seq > cursor {
                cursor = envelope.seq;
                yield Ok(to_event(&envelope));
            }
        }
    }
}

fn to_event(envelope: &sd_domain::envelope::Envelope) -> Event {
    let data = serde_json::to_string(envelope).unwrap_or_default();
    Event::default().event(envelope.event.clone()).data(data)
}
