//! Session manager (§4.6): the core orchestrator tying the event store,
//! turn queue, permission coordinator, tool worker pool, and injected agent
//! driver together into one per-session drain loop.
//!
//! Grounded in the teacher's `runtime::mod` session-actor shape (one
//! in-memory entry per session guarded by its own lock, fanned out to
//! subscribers through a channel) — generalized to the turn-queue/
//! single-active-turn/cancellation/permission discipline of §4.2–§4.4.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sd_domain::agent::{Agent, AgentInput, AgentOutput, AgentStreamEvent, InferenceClient, PermissionRequester, StreamSink, ToolExecutor};
use sd_domain::cancel::CancelToken;
use sd_domain::config::Config;
use sd_domain::envelope::{kind, Envelope, TurnErrorPayload, TurnStats};
use sd_domain::error::{Error, Result};
use sd_domain::model::{PermissionDecision, Session, Turn, TurnMode};
use sd_domain::tool::Message;
use sd_domain::trace::TraceEvent;
use sd_sessions::EventStore;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::cache::ToolResultCache;
use super::permission::PermissionCoordinator;
use super::preflight::Preflight;
use super::tool_pool::WorkerPool;
use super::turn_queue::TurnQueue;

struct ActiveTurn {
    turn_id: String,
    writer_id: String,
    cancel: CancelToken,
}

struct SessionEntry {
    session: Session,
    queue: TurnQueue,
    active: Option<ActiveTurn>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<Envelope>)>,
    cache: ToolResultCache,
    draining: bool,
    last_activity: DateTime<Utc>,
}

pub struct SessionManager {
    daemon_id: String,
    event_store: Arc<EventStore>,
    agent: Arc<dyn Agent>,
    preflight: Preflight,
    permissions: Arc<PermissionCoordinator>,
    pool: Arc<WorkerPool>,
    config: Config,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionEntry>>>>,
    ingress_seq: AtomicU64,
    subscriber_seq: AtomicU64,
}

impl SessionManager {
    pub fn new(
        daemon_id: String,
        event_store: Arc<EventStore>,
        agent: Arc<dyn Agent>,
        inference: Arc<dyn InferenceClient>,
        tool_executor: Arc<dyn ToolExecutor>,
        config: Config,
    ) -> Arc<Self> {
        let permissions = Arc::new(PermissionCoordinator::new(std::time::Duration::from_secs(
            config.permissions.auto_deny_timeout_secs,
        )));
        let pool = WorkerPool::new(tool_executor, &config.pool);
        let preflight = Preflight::new(inference, &config.preflight);
        Arc::new(Self {
            daemon_id,
            event_store,
            agent,
            preflight,
            permissions,
            pool,
            config,
            sessions: Mutex::new(HashMap::new()),
            ingress_seq: AtomicU64::new(0),
            subscriber_seq: AtomicU64::new(0),
        })
    }

    /// The tool worker pool backing this manager's sessions, exposed for
    /// the `/v3/metrics` snapshot (§12).
    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    pub fn permissions(&self) -> Arc<PermissionCoordinator> {
        self.permissions.clone()
    }

    /// Create a session if it doesn't exist yet (hydrating from the event
    /// store's latest snapshot when present), or return the existing
    /// in-memory entry untouched — idempotent (§4.6 "Session create").
    pub fn get_or_create_session(&self, session_id: &str, model: &str) -> Result<Session> {
        sd_domain::model::validate_session_id(session_id)?;
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get(session_id) {
            return Ok(entry.lock().session.clone());
        }

        let existing_snapshot = self.event_store.read_snapshot(session_id)?;
        let rehydrated = existing_snapshot.is_some();
        let session = existing_snapshot.unwrap_or_else(|| Session::new(session_id, model));

        TraceEvent::SessionCreated {
            session_id: session_id.to_string(),
            rehydrated,
        }
        .emit();

        sessions.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(SessionEntry {
                session: session.clone(),
                queue: TurnQueue::new(),
                active: None,
                subscribers: Vec::new(),
                cache: ToolResultCache::new(self.config.cache.clone()),
                draining: false,
                last_activity: Utc::now(),
            })),
        );
        drop(sessions);
        self.emit(session_id, kind::SESSION_SNAPSHOT, serde_json::to_value(&session).unwrap_or_default());
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().get(session_id).map(|e| e.lock().session.clone())
    }

    /// Count of sessions currently held in memory, for the `/v3/health`
    /// runtime-stats contract (§4.7).
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Subscribe to a session's event stream. Returns a subscriber ID (used
    /// to unsubscribe) and the receiving half of an unbounded channel.
    pub fn subscribe(&self, session_id: &str) -> Option<(u64, mpsc::UnboundedReceiver<Envelope>)> {
        let sessions = self.sessions.lock();
        let entry = sessions.get(session_id)?;
        let mut entry = entry.lock();
        let id = self.subscriber_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        entry.subscribers.push((id, tx));
        Some((id, rx))
    }

    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        if let Some(entry) = self.sessions.lock().get(session_id) {
            entry.lock().subscribers.retain(|(id, _)| *id != subscriber_id);
        }
    }

    /// Enqueue a turn, assign it the next process-wide `ingressSeq`, emit
    /// `turn.queued`, and kick off the session's drain loop if it isn't
    /// already running (§4.2, §4.6).
    pub fn submit_turn(
        self: &Arc<Self>,
        session_id: &str,
        client_id: &str,
        writer_id: &str,
        content: &str,
        mode: TurnMode,
        metadata: Option<serde_json::Value>,
    ) -> Result<String> {
        self.submit_turn_checked(session_id, client_id, writer_id, content, mode, metadata, None)
    }

    /// Same as [`Self::submit_turn`], but additionally enforces the
    /// optimistic-concurrency hint: if the caller's `last_seen_seq` is
    /// behind the session's current `seq`, the submit is rejected with
    /// `StateConflict` rather than silently racing ahead of what the
    /// caller has actually observed (§4.6 "Submit turn").
    pub fn submit_turn_checked(
        self: &Arc<Self>,
        session_id: &str,
        client_id: &str,
        writer_id: &str,
        content: &str,
        mode: TurnMode,
        metadata: Option<serde_json::Value>,
        last_seen_seq: Option<u64>,
    ) -> Result<String> {
        self.event_store.check_headroom()?;
        if let Some(last_seen) = last_seen_seq {
            let current = self
                .sessions
                .lock()
                .get(session_id)
                .map(|e| e.lock().session.seq)
                .ok_or_else(|| Error::NotFound(format!("session not found: {session_id}")))?;
            if last_seen < current {
                return Err(Error::StateConflict(format!(
                    "lastSeenSeq {last_seen} behind current seq {current}"
                )));
            }
        }
        let ingress_seq = self.ingress_seq.fetch_add(1, Ordering::SeqCst);
        let turn_id = Uuid::new_v4().to_string();
        let turn = Turn {
            turn_id: turn_id.clone(),
            ingress_seq,
            session_id: session_id.to_string(),
            client_id: client_id.to_string(),
            writer_id: writer_id.to_string(),
            content: content.to_string(),
            mode,
            metadata,
            created_at: Utc::now(),
        };

        let should_spawn = {
            let sessions = self.sessions.lock();
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| Error::NotFound(format!("session not found: {session_id}")))?;
            let mut entry = entry.lock();
            entry.queue.enqueue(turn);
            entry.last_activity = Utc::now();
            if entry.draining {
                false
            } else {
                entry.draining = true;
                true
            }
        };

        TraceEvent::TurnEnqueued {
            session_id: session_id.to_string(),
            turn_id: turn_id.clone(),
            ingress_seq,
        }
        .emit();
        self.emit(
            session_id,
            kind::TURN_QUEUED,
            serde_json::json!({ "turnId": turn_id, "ingressSeq": ingress_seq }),
        );

        if should_spawn {
            let this = self.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move { this.drain(&session_id).await });
        }

        Ok(turn_id)
    }

    /// Cancel turns for a session, by `turn_id`, by `writer_id`, or (if
    /// both are `None`) everything — matching a client disconnect or
    /// explicit session-wide cancel (§4.2 "Cancellation"). `turn_id` takes
    /// priority when both are given.
    pub fn cancel(&self, session_id: &str, turn_id: Option<&str>, writer_id: Option<&str>) -> Result<Vec<String>> {
        let sessions = self.sessions.lock();
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| Error::NotFound(format!("session not found: {session_id}")))?;
        let mut entry = entry.lock();

        let mut cancelled = Vec::new();
        match (turn_id, writer_id) {
            (Some(id), _) => {
                if let Some(active) = &entry.active {
                    if active.turn_id == id {
                        active.cancel.cancel();
                        cancelled.push(id.to_string());
                    }
                }
                if let Some(t) = entry.queue.cancel_by_turn_id(id) {
                    cancelled.push(t.turn_id);
                }
            }
            (None, Some(writer)) => {
                if let Some(active) = &entry.active {
                    if active.writer_id == writer {
                        active.cancel.cancel();
                        cancelled.push(active.turn_id.clone());
                    }
                }
                for t in entry.queue.cancel_by_writer(writer) {
                    cancelled.push(t.turn_id);
                }
            }
            (None, None) => {
                if let Some(active) = &entry.active {
                    active.cancel.cancel();
                    cancelled.push(active.turn_id.clone());
                }
                while let Some(t) = entry.queue.dequeue() {
                    cancelled.push(t.turn_id);
                }
            }
        }
        drop(entry);

        self.emit(
            session_id,
            kind::SESSION_CANCELLED,
            serde_json::json!({ "turnIds": cancelled }),
        );
        Ok(cancelled)
    }

    /// The per-session drain loop: pulls turns off the queue one at a time
    /// (single-active-turn invariant, §4.2), runs preflight, and invokes the
    /// injected agent. Exits once the queue is empty.
    async fn drain(self: Arc<Self>, session_id: &str) {
        loop {
            let turn = {
                let sessions = self.sessions.lock();
                let Some(entry) = sessions.get(session_id) else { return };
                let mut entry = entry.lock();
                match entry.queue.dequeue() {
                    Some(t) => Some(t),
                    None => {
                        entry.draining = false;
                        None
                    }
                }
            };

            let Some(turn) = turn else { return };
            self.run_turn(session_id, turn).await;
        }
    }

    async fn run_turn(self: &Arc<Self>, session_id: &str, turn: Turn) {
        let cancel = CancelToken::new();
        {
            let sessions = self.sessions.lock();
            if let Some(entry) = sessions.get(session_id) {
                entry.lock().active = Some(ActiveTurn {
                    turn_id: turn.turn_id.clone(),
                    writer_id: turn.writer_id.clone(),
                    cancel: cancel.clone(),
                });
            }
        }

        TraceEvent::TurnStarted {
            session_id: session_id.to_string(),
            turn_id: turn.turn_id.clone(),
        }
        .emit();
        self.emit(session_id, kind::TURN_START, serde_json::json!({ "turnId": turn.turn_id }));

        let model = self
            .get_session(session_id)
            .map(|s| s.model)
            .unwrap_or_default();

        let model = match self.preflight.check(&model).await {
            Ok(canonical) => {
                if canonical != model {
                    self.canonicalize_model(session_id, &canonical);
                }
                canonical
            }
            Err(e) => {
                self.emit_turn_error(session_id, &turn, &e);
                self.clear_active(session_id);
                return;
            }
        };

        let start = std::time::Instant::now();
        let existing_messages = self.get_session(session_id).map(|s| s.messages).unwrap_or_default();

        let tool_executor = SessionToolExecutor {
            manager: self.clone(),
            session_id: session_id.to_string(),
        };
        let permission_requester = SessionPermissionRequester {
            manager: self.clone(),
            session_id: session_id.to_string(),
        };
        let stream_sink = SessionStreamSink {
            manager: self.clone(),
            session_id: session_id.to_string(),
            first_token_at: Mutex::new(None),
            start,
        };

        let input = AgentInput {
            user_content: &turn.content,
            existing_messages,
            cancel: cancel.clone(),
            tool_executor: &tool_executor,
            permissions: &permission_requester,
            stream: &stream_sink,
        };

        let result = self.agent.run_turn(&model, input).await;
        let first_token_latency_ms: Option<u64> = (*stream_sink.first_token_at.lock()).map(|d| d as u64);

        match result {
            Ok(AgentOutput { messages, tool_calls, prompt_tokens, completion_tokens }) => {
                let elapsed = start.elapsed().as_secs_f64();
                let tokens = prompt_tokens + completion_tokens;
                let speed = if elapsed > 0.0 { completion_tokens as f64 / elapsed } else { 0.0 };
                self.emit(
                    session_id,
                    kind::TURN_DONE,
                    serde_json::json!({
                        "turnId": turn.turn_id,
                        "stats": TurnStats {
                            tokens,
                            prompt_tokens,
                            completion_tokens,
                            tool_calls,
                            elapsed,
                            speed,
                            first_token_latency_ms,
                        },
                    }),
                );
                self.persist_messages(session_id, messages, tool_calls);
                TraceEvent::TurnCompleted {
                    session_id: session_id.to_string(),
                    turn_id: turn.turn_id.clone(),
                    status: "done".into(),
                }
                .emit();
            }
            Err(e) => {
                self.emit_turn_error(session_id, &turn, &e);
                TraceEvent::TurnCompleted {
                    session_id: session_id.to_string(),
                    turn_id: turn.turn_id.clone(),
                    status: "error".into(),
                }
                .emit();
            }
        }

        self.clear_active(session_id);
    }

    fn emit_turn_error(&self, session_id: &str, turn: &Turn, error: &Error) {
        let payload = TurnErrorPayload {
            turn_id: turn.turn_id.clone(),
            writer_id: turn.writer_id.clone(),
            client_id: turn.client_id.clone(),
            message: error.turn_error_message(),
            code: error.turn_error_code().map(|c| c.to_string()),
        };
        self.emit(session_id, kind::TURN_ERROR, serde_json::to_value(payload).unwrap_or_default());
    }

    /// Rewrite the session's stored model ID to the canonical loaded-model
    /// name the preflight check matched (§4.6 "Canonicalize the session's
    /// model ID to the match").
    fn canonicalize_model(&self, session_id: &str, canonical: &str) {
        if let Some(entry) = self.sessions.lock().get(session_id) {
            entry.lock().session.model = canonical.to_string();
        }
    }

    fn clear_active(&self, session_id: &str) {
        if let Some(entry) = self.sessions.lock().get(session_id) {
            entry.lock().active = None;
        }
    }

    fn persist_messages(&self, session_id: &str, messages: Vec<Message>, tool_calls: u64) {
        let snapshot = {
            let sessions = self.sessions.lock();
            let Some(entry) = sessions.get(session_id) else { return };
            let mut entry = entry.lock();
            entry.session.messages = messages;
            entry.session.tool_call_count += tool_calls;
            entry.session.updated_at = Utc::now();
            entry.session.clone()
        };
        let store = self.event_store.clone();
        let session_id_owned = session_id.to_string();
        let snapshot_for_write = snapshot.clone();
        tokio::spawn(async move {
            if let Err(e) = store.write_snapshot(&session_id_owned, &snapshot_for_write).await {
                tracing::warn!(session_id = %session_id_owned, error = %e, "failed to persist session snapshot");
            }
        });
        self.emit(
            session_id,
            kind::SESSION_UPDATED,
            serde_json::json!({
                "updatedAt": snapshot.updated_at.to_rfc3339(),
                "toolCallCount": snapshot.tool_call_count,
            }),
        );
    }

    /// Append (unless ephemeral) and fan out one event. The sequence number
    /// is the session's own monotonic `seq`, not the process-wide
    /// `ingressSeq` (§3).
    pub fn emit(&self, session_id: &str, event_kind: &str, payload: serde_json::Value) {
        let sessions = self.sessions.lock();
        let Some(entry) = sessions.get(session_id) else { return };
        let mut entry = entry.lock();
        let seq = entry.session.next_seq();
        entry.last_activity = Utc::now();
        let envelope = Envelope::new(&self.daemon_id, event_kind, Some(session_id.to_string()), seq, payload);

        entry.subscribers.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
        drop(entry);

        if !sd_domain::envelope::is_ephemeral(event_kind) {
            let store = self.event_store.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = store.append_event(&session_id, &envelope).await {
                    tracing::warn!(session_id, error = %e, "failed to append event");
                }
            });
        }
    }

    /// Sweep idle sessions out of memory: no subscribers, no active or
    /// queued turns, idle past `sessions.idle_evict_minutes` (§3, §4.6).
    /// Durable state already lives in the event store, so eviction from
    /// memory is not data loss.
    pub fn evict_idle(&self) {
        let cutoff = Utc::now() - chrono::Duration::minutes(self.config.sessions.idle_evict_minutes);
        let mut sessions = self.sessions.lock();
        sessions.retain(|session_id, entry| {
            let entry = entry.lock();
            let idle = entry.last_activity < cutoff;
            let quiescent = entry.subscribers.is_empty() && entry.active.is_none() && entry.queue.is_empty();
            let evict = idle && quiescent;
            if evict {
                TraceEvent::SessionEvicted { session_id: session_id.clone() }.emit();
            }
            !evict
        });
        self.permissions.gc();
    }
}

struct NoopExecutor;

#[async_trait]
impl ToolExecutor for NoopExecutor {
    async fn run_tool(&self, _name: &str, _args: serde_json::Value, _cancel: &CancelToken) -> Result<String> {
        Err(Error::Other("tool pool not wired".into()))
    }
}

struct SessionToolExecutor {
    manager: Arc<SessionManager>,
    session_id: String,
}

#[async_trait]
impl ToolExecutor for SessionToolExecutor {
    async fn run_tool(&self, name: &str, args: serde_json::Value, cancel: &CancelToken) -> Result<String> {
        use super::cache::ToolClass;

        let call_id = Uuid::new_v4().to_string();
        self.manager.emit(
            &self.session_id,
            kind::TOOL_START,
            serde_json::json!({ "callId": call_id, "toolName": name, "arguments": args }),
        );

        let args_json = args.to_string();
        let class = {
            let sessions = self.manager.sessions.lock();
            sessions.get(&self.session_id).map(|e| e.lock().cache.classify(name))
        };

        let dispatch_start = std::time::Instant::now();
        let mut served_from_cache = false;
        let result = match class {
            Some(ToolClass::Write) => {
                let r = self.manager.pool.run_tool(name.to_string(), args.clone(), cancel.clone()).await;
                if let Some(entry) = self.manager.sessions.lock().get(&self.session_id) {
                    entry.lock().cache.clear();
                }
                r
            }
            Some(ToolClass::Cacheable { path_arg }) => {
                let mtime = path_arg
                    .and_then(|k| args.get(&k).and_then(|v| v.as_str()).map(|p| p.to_string()))
                    .and_then(|p| std::fs::metadata(p).ok())
                    .and_then(|m| m.modified().ok());
                let cached = self
                    .manager
                    .sessions
                    .lock()
                    .get(&self.session_id)
                    .and_then(|e| e.lock().cache.get(name, &args_json, mtime));
                match cached {
                    Some(v) => {
                        served_from_cache = true;
                        Ok(v)
                    }
                    None => {
                        let r = self.manager.pool.run_tool(name.to_string(), args.clone(), cancel.clone()).await;
                        if let Ok(v) = &r {
                            if let Some(entry) = self.manager.sessions.lock().get(&self.session_id) {
                                entry.lock().cache.put(name, &args_json, v.clone(), mtime);
                            }
                        }
                        r
                    }
                }
            }
            _ => self.manager.pool.run_tool(name.to_string(), args.clone(), cancel.clone()).await,
        };

        TraceEvent::ToolDispatched {
            tool_name: name.to_string(),
            cached: served_from_cache,
            duration_ms: dispatch_start.elapsed().as_millis() as u64,
        }
        .emit();

        let (result_text, is_error) = match &result {
            Ok(v) => (v.clone(), false),
            Err(e) => (e.to_string(), true),
        };
        self.manager.emit(
            &self.session_id,
            kind::TOOL_END,
            serde_json::json!({ "callId": call_id, "toolName": name, "result": result_text, "isError": is_error }),
        );

        result
    }
}

struct SessionPermissionRequester {
    manager: Arc<SessionManager>,
    session_id: String,
}

#[async_trait]
impl PermissionRequester for SessionPermissionRequester {
    async fn request_permission(&self, tool_name: &str, arguments: serde_json::Value) -> Result<PermissionDecision> {
        let (request_id, rx) = self.manager.permissions.request(
            self.session_id.clone(),
            tool_name.to_string(),
            arguments.clone(),
        );
        self.manager.emit(
            &self.session_id,
            kind::PERMISSION_REQUEST,
            serde_json::json!({ "requestId": request_id, "toolName": tool_name, "arguments": arguments }),
        );
        let decision = rx.await.unwrap_or(PermissionDecision::Deny);
        self.manager.emit(
            &self.session_id,
            kind::PERMISSION_RESOLVED,
            serde_json::json!({ "requestId": request_id, "decision": decision }),
        );
        Ok(decision)
    }
}

struct SessionStreamSink {
    manager: Arc<SessionManager>,
    session_id: String,
    first_token_at: Mutex<Option<i64>>,
    start: std::time::Instant,
}

#[async_trait]
impl StreamSink for SessionStreamSink {
    async fn on_event(&self, event: AgentStreamEvent) {
        match event {
            AgentStreamEvent::Token { text } => {
                let mut first = self.first_token_at.lock();
                if first.is_none() {
                    *first = Some(self.start.elapsed().as_millis() as i64);
                }
                self.manager.emit(&self.session_id, kind::TURN_TOKEN, serde_json::json!({ "text": text }));
            }
            AgentStreamEvent::Reasoning { text } => {
                self.manager.emit(&self.session_id, kind::TURN_THINKING, serde_json::json!({ "text": text }));
            }
            AgentStreamEvent::ToolStart { .. } | AgentStreamEvent::ToolEnd { .. } => {
                // Tool lifecycle events are emitted by `SessionToolExecutor`
                // directly, since it owns call IDs and cache classification.
            }
            AgentStreamEvent::Usage { .. } => {
                // Rolled into `turn.done.payload.stats` from the agent's
                // final `AgentOutput` instead of a separate event.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_domain::agent::AgentOutput;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn run_turn(&self, _model: &str, input: AgentInput<'_>) -> Result<AgentOutput> {
            input.stream.on_event(AgentStreamEvent::Token { text: "hi".into() }).await;
            let mut messages = input.existing_messages;
            messages.push(Message::user(input.user_content));
            messages.push(Message::assistant("hi"));
            Ok(AgentOutput { messages, tool_calls: 0, prompt_tokens: 1, completion_tokens: 1 })
        }
    }

    struct FakeInference;

    #[async_trait]
    impl InferenceClient for FakeInference {
        async fn list_loaded_models(&self) -> Result<Vec<String>> {
            Ok(vec!["m-default".into()])
        }
    }

    fn manager() -> (tempfile::TempDir, Arc<SessionManager>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::new(dir.path(), 0));
        let mgr = SessionManager::new(
            "daemon_test".into(),
            store,
            Arc::new(EchoAgent),
            Arc::new(FakeInference),
            Arc::new(NoopExecutor),
            Config::default(),
        );
        (dir, mgr)
    }

    #[tokio::test]
    async fn submit_turn_runs_and_emits_done() {
        let (_dir, mgr) = manager();
        mgr.get_or_create_session("s1", "m-default").unwrap();
        let (_id, mut rx) = mgr.subscribe("s1").unwrap();
        mgr.submit_turn("s1", "c1", "w1", "hello", TurnMode::Chat, None).unwrap();

        let mut saw_done = false;
        for _ in 0..10 {
            if let Ok(Some(env)) = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await {
                if env.event == kind::TURN_DONE {
                    saw_done = true;
                    break;
                }
            } else {
                break;
            }
        }
        assert!(saw_done);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (_dir, mgr) = manager();
        let a = mgr.get_or_create_session("s1", "m-default").unwrap();
        let b = mgr.get_or_create_session("s1", "different-model").unwrap();
        assert_eq!(a.model, b.model);
    }

    #[tokio::test]
    async fn unknown_model_yields_turn_error_with_code() {
        let (_dir, mgr) = manager();
        mgr.get_or_create_session("s1", "not-loaded").unwrap();
        let (_id, mut rx) = mgr.subscribe("s1").unwrap();
        mgr.submit_turn("s1", "c1", "w1", "hello", TurnMode::Chat, None).unwrap();

        let mut turn_error = None;
        for _ in 0..10 {
            match tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await {
                Ok(Some(env)) if env.event == kind::TURN_ERROR => {
                    turn_error = Some(env);
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        let env = turn_error.expect("expected a turn.error event");
        assert_eq!(env.payload["code"], "no-model-loaded");
    }
}
