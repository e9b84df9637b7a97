//! WebSocket streaming plane (§4.8): the primary transport for a session's
//! event stream, plus inbound control messages (`turn.submit`,
//! `permission.resolve`, `turn.cancel`).
//!
//! Grounded in the teacher's node WebSocket handler (`nodes/ws.rs`) —
//! `WebSocketUpgrade` + query extraction, `socket.split()`, a reader loop
//! matching on `Message` variants — generalized to the replay-then-live
//! merge discipline §4.8 requires: subscribe before reading backlog so no
//! event emitted in between is lost, then flush backlog and filter live
//! events by the advanced cursor.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use sd_domain::envelope::Envelope;
use sd_domain::model::{PermissionDecision, TurnMode};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "afterSeq", default)]
    after_seq: u64,
}

/// `GET /v3/ws?sessionId=&afterSeq=&token=` — auth is already enforced by
/// the bearer-token middleware wrapping this route (§4.7, §6).
async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>, Query(query): Query<WsQuery>) -> impl IntoResponse {
    let Some(session_id) = query.session_id else {
        return (axum::http::StatusCode::BAD_REQUEST, "sessionId is required").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, query.after_seq))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String, after_seq: u64) {
    let (mut sink, mut stream) = socket.split();

    // Subscribe before reading the backlog: any event emitted in the gap
    // between "read backlog" and "start listening" would otherwise be
    // lost. Events fanned out between now and the backlog flush just queue
    // in this unbounded channel (§4.8 steps 3–5).
    let Some((sub_id, mut rx)) = state.session_manager.subscribe(&session_id) else {
        let _ = send_json(&mut sink, &json!({ "error": "session not found" })).await;
        return;
    };

    let backlog = state.event_store.read_events_after(&session_id, after_seq).unwrap_or_default();
    let mut cursor = after_seq;
    for envelope in backlog {
        if envelope.seq > cursor {
            cursor = envelope.seq;
            if send_envelope(&mut sink, &envelope).await.is_err() {
                state.session_manager.unsubscribe(&session_id, sub_id);
                return;
            }
        }
    }

    loop {
        tokio::select! {
            live = rx.recv() => {
                match live {
                    Some(envelope) => {
                        if envelope.seq > cursor {
                            cursor = envelope.seq;
                            if send_envelope(&mut sink, &envelope).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, &session_id, &text, &mut sink).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.session_manager.unsubscribe(&session_id, sub_id);
}

async fn send_envelope(sink: &mut SplitSink<WebSocket, Message>, envelope: &Envelope) -> Result<(), axum::Error> {
    let text = serde_json::to_string(envelope).unwrap_or_default();
    sink.send(Message::Text(text)).await
}

async fn send_json(sink: &mut SplitSink<WebSocket, Message>, value: &serde_json::Value) -> Result<(), axum::Error> {
    sink.send(Message::Text(value.to_string())).await
}

/// Inbound control plane (§4.8): `hello`, `turn.submit`,
/// `permission.resolve`, `turn.cancel`, each acknowledged with
/// `{type:"ack", action, …}`. Invalid payloads get `{error, details}`
/// without closing the connection.
async fn handle_inbound(state: &AppState, session_id: &str, text: &str, sink: &mut SplitSink<WebSocket, Message>) {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            let _ = send_json(sink, &json!({ "error": "invalid json", "details": e.to_string() })).await;
            return;
        }
    };

    let action = parsed.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match action {
        "hello" => {
            let _ = send_json(sink, &json!({ "type": "ack", "action": "hello" })).await;
        }
        "turn.submit" => handle_turn_submit(state, session_id, &parsed, sink).await,
        "permission.resolve" => handle_permission_resolve(state, &parsed, sink).await,
        "turn.cancel" => handle_turn_cancel(state, session_id, &parsed, sink).await,
        other => {
            let _ = send_json(sink, &json!({ "error": "unknown message type", "details": other })).await;
        }
    }
}

async fn handle_turn_submit(state: &AppState, session_id: &str, parsed: &serde_json::Value, sink: &mut SplitSink<WebSocket, Message>) {
    let client_id = parsed.get("clientId").and_then(|v| v.as_str());
    let writer_id = parsed.get("writerId").and_then(|v| v.as_str());
    let content = parsed.get("content").and_then(|v| v.as_str());

    let (Some(client_id), Some(writer_id), Some(content)) = (client_id, writer_id, content) else {
        let _ = send_json(
            sink,
            &json!({ "error": "invalid turn.submit payload", "details": "clientId, writerId, content are required" }),
        )
        .await;
        return;
    };

    let mode = match parsed.get("mode").and_then(|v| v.as_str()) {
        Some("do") => TurnMode::Do,
        _ => TurnMode::Chat,
    };
    let metadata = parsed.get("metadata").cloned();

    match state.session_manager.submit_turn(session_id, client_id, writer_id, content, mode, metadata) {
        Ok(turn_id) => {
            let _ = send_json(sink, &json!({ "type": "ack", "action": "turn.submit", "turnId": turn_id })).await;
        }
        Err(e) => {
            let _ = send_json(sink, &json!({ "error": e.to_string(), "code": e.turn_error_code() })).await;
        }
    }
}

async fn handle_permission_resolve(state: &AppState, parsed: &serde_json::Value, sink: &mut SplitSink<WebSocket, Message>) {
    let request_id = parsed.get("requestId").and_then(|v| v.as_str());
    let Some(request_id) = request_id else {
        let _ = send_json(sink, &json!({ "error": "invalid permission.resolve payload", "details": "requestId is required" })).await;
        return;
    };

    let decision: Option<PermissionDecision> = parsed.get("decision").and_then(|v| serde_json::from_value(v.clone()).ok());
    let Some(decision) = decision else {
        let _ = send_json(sink, &json!({ "error": "invalid permission.resolve payload", "details": "decision must be \"allow\" or \"deny\"" })).await;
        return;
    };

    let outcome = state.session_manager.permissions().resolve(request_id, decision);
    if outcome.ok {
        let _ = send_json(sink, &json!({ "type": "ack", "action": "permission.resolve", "requestId": request_id })).await;
    } else if outcome.conflict {
        let _ = send_json(sink, &json!({ "error": "permission request already resolved" })).await;
    } else {
        let _ = send_json(sink, &json!({ "error": "permission request unknown" })).await;
    }
}

async fn handle_turn_cancel(state: &AppState, session_id: &str, parsed: &serde_json::Value, sink: &mut SplitSink<WebSocket, Message>) {
    let turn_id = parsed.get("turnId").and_then(|v| v.as_str());
    let writer_id = parsed.get("writerId").and_then(|v| v.as_str());

    match state.session_manager.cancel(session_id, turn_id, writer_id) {
        Ok(cancelled) => {
            let _ = send_json(sink, &json!({ "type": "ack", "action": "turn.cancel", "cancelled": cancelled })).await;
        }
        Err(e) => {
            let _ = send_json(sink, &json!({ "error": e.to_string() })).await;
        }
    }
}
