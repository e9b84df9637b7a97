//! Permission coordinator (§4.3): request/decide with first-decision-wins
//! race semantics and auto-deny timeouts.
//!
//! Grounded in the teacher's `ApprovalStore` (a `RwLock<HashMap<Uuid,
//! PendingApproval>>` paired with a `oneshot` channel that unblocks the
//! waiting caller) — generalized with a second `recentlyResolved` map so a
//! *duplicate* resolve (409 conflict) can be told apart from an *unknown*
//! one (404), and with an internal timeout timer (rather than a timeout on
//! the receiver side) so the auto-deny path is driven by the coordinator
//! itself (§9 "Permission CAS").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use sd_domain::model::PermissionDecision;
use sd_domain::trace::TraceEvent;
use tokio::sync::oneshot;
use uuid::Uuid;

struct Pending {
    session_id: String,
    tool_name: String,
    arguments: serde_json::Value,
    respond: Option<oneshot::Sender<PermissionDecision>>,
}

/// Outcome of a `resolve` call (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub ok: bool,
    pub conflict: bool,
    pub message: Option<String>,
}

pub struct PermissionCoordinator {
    pending: Mutex<HashMap<String, Pending>>,
    /// GC'd after `timeout` elapses past resolution — bounds memory to the
    /// timeout horizon (§9).
    recently_resolved: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
    timeout: Duration,
}

impl PermissionCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            recently_resolved: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Raise a new permission request. Returns the request ID, the
    /// session/tool/args for building the `permission.request` event, and a
    /// future that resolves to the winning decision. An auto-deny timer is
    /// armed for `timeout` (default 120s, §4.3/§5); if nothing resolves the
    /// request first, it fires `deny` and removes the pending entry without
    /// populating `recentlyResolved` (late resolves then see `unknown`, not
    /// `conflict` — §4.3 "Timeout").
    pub fn request(
        self: &Arc<Self>,
        session_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    ) -> (String, oneshot::Receiver<PermissionDecision>) {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        TraceEvent::PermissionRequested {
            session_id: session_id.clone(),
            request_id: request_id.clone(),
            tool_name: tool_name.clone(),
        }
        .emit();

        self.pending.lock().insert(
            request_id.clone(),
            Pending {
                session_id,
                tool_name,
                arguments,
                respond: Some(tx),
            },
        );

        let this = self.clone();
        let timeout = self.timeout;
        let id_for_timer = request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.auto_deny(&id_for_timer);
        });

        (request_id, rx)
    }

    fn auto_deny(&self, request_id: &str) {
        let mut pending = self.pending.lock();
        if let Some(mut entry) = pending.remove(request_id) {
            if let Some(tx) = entry.respond.take() {
                let _ = tx.send(PermissionDecision::Deny);
            }
        }
    }

    /// Resolve a pending request. First decision wins (§4.3, P4):
    /// - pending & unresolved → `{ok:true, conflict:false}`, fulfils the
    ///   decision future, records in `recentlyResolved`.
    /// - already resolved (present in `recentlyResolved`) → `{ok:false,
    ///   conflict:true}` (409).
    /// - otherwise (never existed, or timed out) → `{ok:false,
    ///   conflict:false}` (404).
    pub fn resolve(&self, request_id: &str, decision: PermissionDecision) -> ResolveOutcome {
        let found = {
            let mut pending = self.pending.lock();
            pending.remove(request_id)
        };

        match found {
            Some(mut entry) => {
                if let Some(tx) = entry.respond.take() {
                    let _ = tx.send(decision);
                }
                self.recently_resolved
                    .lock()
                    .insert(request_id.to_string(), Utc::now());
                TraceEvent::PermissionResolved {
                    request_id: request_id.to_string(),
                    decision: format!("{decision:?}"),
                    conflict: false,
                }
                .emit();
                ResolveOutcome { ok: true, conflict: false, message: None }
            }
            None => {
                if self.recently_resolved.lock().contains_key(request_id) {
                    TraceEvent::PermissionResolved {
                        request_id: request_id.to_string(),
                        decision: format!("{decision:?}"),
                        conflict: true,
                    }
                    .emit();
                    ResolveOutcome {
                        ok: false,
                        conflict: true,
                        message: Some("already resolved".into()),
                    }
                } else {
                    ResolveOutcome {
                        ok: false,
                        conflict: false,
                        message: Some("unknown".into()),
                    }
                }
            }
        }
    }

    /// Drop `recentlyResolved` entries older than the timeout window — run
    /// periodically alongside other sweeps (§3, §9).
    pub fn gc(&self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.timeout).unwrap_or_default();
        self.recently_resolved.lock().retain(|_, at| *at > cutoff);
    }

    pub fn tool_name_of(&self, request_id: &str) -> Option<String> {
        self.pending.lock().get(request_id).map(|p| p.tool_name.clone())
    }

    pub fn list_pending(&self) -> Vec<(String, String, String, serde_json::Value)> {
        self.pending
            .lock()
            .iter()
            .map(|(id, p)| (id.clone(), p.session_id.clone(), p.tool_name.clone(), p.arguments.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(timeout: Duration) -> Arc<PermissionCoordinator> {
        Arc::new(PermissionCoordinator::new(timeout))
    }

    #[tokio::test]
    async fn first_resolve_wins_second_sees_conflict() {
        let coord = coordinator(Duration::from_secs(120));
        let (id, rx) = coord.request("s1".into(), "exec".into(), serde_json::json!({}));

        let first = coord.resolve(&id, PermissionDecision::Allow);
        let second = coord.resolve(&id, PermissionDecision::Deny);

        assert!(first.ok && !first.conflict);
        assert!(!second.ok && second.conflict);

        let decision = rx.await.unwrap();
        assert_eq!(decision, PermissionDecision::Allow);
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_not_conflict() {
        let coord = coordinator(Duration::from_secs(120));
        let outcome = coord.resolve("nope", PermissionDecision::Allow);
        assert!(!outcome.ok);
        assert!(!outcome.conflict);
    }

    #[tokio::test]
    async fn timeout_auto_denies_and_late_resolve_is_unknown_not_conflict() {
        let coord = coordinator(Duration::from_millis(20));
        let (id, rx) = coord.request("s1".into(), "exec".into(), serde_json::json!({}));

        let decision = tokio::time::timeout(Duration::from_millis(500), rx)
            .await
            .expect("auto-deny should fire")
            .unwrap();
        assert_eq!(decision, PermissionDecision::Deny);

        // A late resolve after the timeout path (which does not populate
        // `recentlyResolved`) must see `unknown`, not `conflict` (§4.3).
        let late = coord.resolve(&id, PermissionDecision::Allow);
        assert!(!late.ok);
        assert!(!late.conflict);
    }
}
