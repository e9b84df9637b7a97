//! REST routes (§4.7): session and turn lifecycle, permission resolution,
//! event replay, and background-process control.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use sd_domain::error::Error;
use sd_domain::model::{OutputStream, PermissionDecision, TurnMode};
use sd_process::StartRequest;
use serde::Deserialize;

use super::{ApiError, ApiResult};
use crate::state::AppState;

pub fn protected_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/turns", post(submit_turn))
        .route("/sessions/:id/cancel", post(cancel_turn))
        .route("/sessions/:id/permissions/:request_id", post(resolve_permission))
        .route("/sessions/:id/events", get(replay_events))
        .route("/background", get(list_background))
        .route("/background/start", post(start_background))
        .route("/background/:id/status", get(background_status))
        .route("/background/:id/output", get(background_output))
        .route("/background/:id/kill", post(kill_background))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_secs = (chrono::Utc::now() - state.started_at).num_seconds().max(0);
    Json(serde_json::json!({
        "name": "sessiond",
        "version": sd_domain::envelope::PROTOCOL_VERSION,
        "daemonId": state.daemon_id,
        "startedAt": state.started_at.to_rfc3339(),
        "uptimeSecs": uptime_secs,
        "sessions": state.session_manager.session_count(),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.session_manager.pool();
    Json(serde_json::json!({
        "workers": {
            "count": pool.worker_count(),
            "busy": pool.busy(),
            "queued": pool.queued(),
        },
        "backgroundProcesses": state.processes.list(None).len(),
    }))
}

#[derive(Deserialize)]
struct CreateSessionBody {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(default = "default_model")]
    model: String,
}

fn default_model() -> String {
    "default".into()
}

async fn create_session(State(state): State<AppState>, Json(body): Json<CreateSessionBody>) -> ApiResult<impl IntoResponse> {
    let session = state.session_manager.get_or_create_session(&body.session_id, &body.model)?;
    Ok(Json(session))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    state
        .session_manager
        .get_session(&id)
        .map(Json)
        .ok_or_else(|| ApiError(Error::NotFound(format!("session not found: {id}"))))
}

#[derive(Deserialize)]
struct SubmitTurnBody {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "writerId")]
    writer_id: String,
    content: String,
    #[serde(default)]
    mode: WireTurnMode,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(rename = "lastSeenSeq", default)]
    last_seen_seq: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum WireTurnMode {
    #[default]
    Chat,
    Do,
}

impl From<WireTurnMode> for TurnMode {
    fn from(w: WireTurnMode) -> Self {
        match w {
            WireTurnMode::Chat => TurnMode::Chat,
            WireTurnMode::Do => TurnMode::Do,
        }
    }
}

async fn submit_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubmitTurnBody>,
) -> ApiResult<impl IntoResponse> {
    let turn_id = state.session_manager.submit_turn_checked(
        &id,
        &body.client_id,
        &body.writer_id,
        &body.content,
        body.mode.into(),
        body.metadata,
        body.last_seen_seq,
    )?;
    Ok(Json(serde_json::json!({ "turnId": turn_id })))
}

#[derive(Deserialize, Default)]
struct CancelBody {
    #[serde(rename = "turnId", default)]
    turn_id: Option<String>,
    #[serde(rename = "writerId", default)]
    writer_id: Option<String>,
}

async fn cancel_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = state
        .session_manager
        .cancel(&id, body.turn_id.as_deref(), body.writer_id.as_deref())?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

#[derive(Deserialize)]
struct ResolvePermissionBody {
    decision: PermissionDecision,
}

async fn resolve_permission(
    State(state): State<AppState>,
    Path((_session_id, request_id)): Path<(String, String)>,
    Json(body): Json<ResolvePermissionBody>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.session_manager.permissions().resolve(&request_id, body.decision);
    if outcome.ok {
        Ok(Json(serde_json::json!({ "ok": true })))
    } else if outcome.conflict {
        Err(ApiError(Error::PermissionConflict))
    } else {
        Err(ApiError(Error::PermissionUnknown))
    }
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    #[serde(rename = "afterSeq", default)]
    after_seq: u64,
}

async fn replay_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<EventsQuery>,
) -> ApiResult<impl IntoResponse> {
    let events = state.event_store.read_events_after(&id, q.after_seq)?;
    Ok(Json(events))
}

#[derive(Deserialize, Default)]
struct ListBackgroundQuery {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

async fn list_background(State(state): State<AppState>, Query(q): Query<ListBackgroundQuery>) -> impl IntoResponse {
    Json(state.processes.list(q.session_id.as_deref()))
}

#[derive(Deserialize)]
struct StartBackgroundBody {
    #[serde(rename = "sessionId")]
    session_id: String,
    command: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(rename = "timeoutMs", default)]
    timeout_ms: Option<u64>,
}

async fn start_background(State(state): State<AppState>, Json(body): Json<StartBackgroundBody>) -> ApiResult<impl IntoResponse> {
    let process = state
        .processes
        .start(StartRequest {
            session_id: body.session_id,
            command: body.command,
            label: body.label,
            cwd: body.cwd,
            timeout_ms: body.timeout_ms,
        })
        .await?;
    Ok(Json(process))
}

async fn background_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    state
        .processes
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError(Error::NotFound(format!("background process not found: {id}"))))
}

#[derive(Deserialize, Default)]
struct OutputQuery {
    #[serde(rename = "afterSeq", default)]
    after_seq: u64,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    stream: Option<String>,
}

fn default_limit() -> usize {
    200
}

async fn background_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<OutputQuery>,
) -> ApiResult<impl IntoResponse> {
    let stream = match q.stream.as_deref() {
        Some("stdout") => Some(OutputStream::Stdout),
        Some("stderr") => Some(OutputStream::Stderr),
        _ => None,
    };
    let (chunks, has_more) = state.processes.output(&id, q.after_seq, q.limit, stream)?;
    Ok(Json(serde_json::json!({ "chunks": chunks, "hasMore": has_more })))
}

#[derive(Deserialize, Default)]
struct KillBody {
    #[serde(default)]
    signal: Option<i32>,
}

async fn kill_background(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<KillBody>,
) -> ApiResult<impl IntoResponse> {
    state.processes.kill(&id, body.signal.unwrap_or(libc::SIGTERM)).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
