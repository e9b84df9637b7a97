//! Append-only per-session event log plus latest-snapshot file (§4.1).
//!
//! Grounded in the teacher's `TranscriptWriter` (append-only JSONL,
//! skip-malformed-on-read), generalized with: snapshot file, strict
//! `seq`-ordered replay, in-flight session-directory creation dedup, and a
//! disk-headroom check before every append.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sd_domain::envelope::Envelope;
use sd_domain::error::{Error, Result};
use sd_domain::model::{validate_session_id, Session};
use sd_domain::trace::TraceEvent;
use tokio::sync::Notify;

const SNAPSHOT_FILE: &str = "snapshot.json";
const EVENTS_FILE: &str = "events.json-lines";

pub struct EventStore {
    root: PathBuf,
    min_free_bytes: u64,
    /// In-flight session-directory creations, keyed by session ID, so
    /// concurrent callers for the same ID await the same creation future
    /// instead of racing separate `mkdir`s (§9 "directory creation
    /// deduplication").
    creating: Mutex<HashMap<String, Arc<Notify>>>,
}

impl EventStore {
    pub fn new(root: impl Into<PathBuf>, min_free_bytes: u64) -> Self {
        Self {
            root: root.into(),
            min_free_bytes,
            creating: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve and validate the on-disk directory for `session_id`,
    /// rejecting anything that doesn't match the allowlist or that would
    /// resolve outside the sessions root (§3, §9, property P8). No
    /// filesystem access happens before this check passes.
    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        let dir = self.root.join(session_id);
        // `session_id` contains no path separators (enforced by the
        // allowlist regex), so `dir`'s parent is always `self.root`
        // exactly; this is the path-containment guard in addition to the
        // allowlist itself.
        if dir.parent() != Some(self.root.as_path()) {
            return Err(Error::InvalidInput(format!(
                "session id resolves outside sessions root: {session_id}"
            )));
        }
        Ok(dir)
    }

    /// Create the session directory once, deduplicating concurrent callers
    /// for the same ID via an in-flight creation map.
    async fn ensure_session_dir(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(session_id)?;
        if dir.exists() {
            return Ok(dir);
        }

        let notify = {
            let mut creating = self.creating.lock();
            if let Some(existing) = creating.get(session_id) {
                Some(existing.clone())
            } else {
                creating.insert(session_id.to_string(), Arc::new(Notify::new()));
                None
            }
        };

        if let Some(notify) = notify {
            // Someone else is creating this directory; wait for them.
            notify.notified().await;
            return Ok(dir);
        }

        let result = std::fs::create_dir_all(&dir).map_err(Error::Io);

        let mut creating = self.creating.lock();
        if let Some(n) = creating.remove(session_id) {
            n.notify_waiters();
        }
        result?;
        Ok(dir)
    }

    /// Disk headroom check, exposed so callers that accept work before it
    /// reaches the append-only log (e.g. turn submission) can reject early
    /// instead of letting a fire-and-forget `append_event` swallow it.
    pub fn check_headroom(&self) -> Result<()> {
        if free_bytes(&self.root).unwrap_or(u64::MAX) < self.min_free_bytes {
            return Err(Error::StorageFull(
                "insufficient disk headroom for event log".into(),
            ));
        }
        Ok(())
    }

    /// Append one event envelope to the session's log. Creates the session
    /// directory on first use (deduplicated). Fails with `StorageFull` if
    /// free disk space is below the configured minimum.
    pub async fn append_event(&self, session_id: &str, envelope: &Envelope) -> Result<()> {
        self.check_headroom()?;
        let dir = self.ensure_session_dir(session_id).await?;
        let path = dir.join(EVENTS_FILE);
        let line = serde_json::to_string(envelope)?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        writeln!(file, "{line}").map_err(Error::Io)?;

        TraceEvent::EventAppended {
            session_id: session_id.to_string(),
            seq: envelope.seq,
            event: envelope.event.clone(),
        }
        .emit();

        Ok(())
    }

    /// Atomically overwrite the snapshot file (write to a temp file, then
    /// rename, so a crash mid-write never leaves a half-written snapshot).
    pub async fn write_snapshot(&self, session_id: &str, snapshot: &Session) -> Result<()> {
        self.check_headroom()?;
        let dir = self.ensure_session_dir(session_id).await?;
        let path = dir.join(SNAPSHOT_FILE);
        let tmp_path = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&tmp_path, json).map_err(Error::Io)?;
        std::fs::rename(&tmp_path, &path).map_err(Error::Io)?;
        Ok(())
    }

    /// Latest snapshot, or `None` if the session has never been persisted.
    pub fn read_snapshot(&self, session_id: &str) -> Result<Option<Session>> {
        let dir = self.session_dir(session_id)?;
        let path = dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        match serde_json::from_str(&raw) {
            Ok(s) => Ok(Some(s)),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "skipping malformed snapshot");
                Ok(None)
            }
        }
    }

    /// Events with `seq > after_seq`, ascending by `seq`. Malformed lines
    /// are skipped with a warning, never fail the whole read (§4.1).
    pub fn read_events_after(&self, session_id: &str, after_seq: u64) -> Result<Vec<Envelope>> {
        let dir = self.session_dir(session_id)?;
        let path = dir.join(EVENTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(line) {
                Ok(env) if env.seq > after_seq => events.push(env),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "skipping malformed event line");
                }
            }
        }
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.session_dir(session_id)
            .map(|d| d.exists())
            .unwrap_or(false)
    }

    pub fn list_sessions(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    if validate_session_id(name).is_ok() {
                        out.push(name.to_string());
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(unix)]
fn free_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    // The directory may not exist yet on first run; fall back to its
    // nearest existing ancestor so the headroom check still means something.
    let mut probe = path.to_path_buf();
    while !probe.exists() {
        if !probe.pop() {
            return None;
        }
    }
    let c_path = CString::new(probe.to_str()?).ok()?;
    unsafe {
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        if libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) != 0 {
            return None;
        }
        let stat = stat.assume_init();
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn free_bytes(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_domain::envelope::{kind, Envelope};

    fn store() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path(), 0);
        (dir, store)
    }

    #[tokio::test]
    async fn append_and_read_events_after() {
        let (_dir, store) = store();
        for i in 1..=3u64 {
            let env = Envelope::new("daemon_1", kind::TURN_DONE, Some("s1".into()), i, serde_json::json!({"i": i}));
            store.append_event("s1", &env).await.unwrap();
        }
        let events = store.read_events_after("s1", 1).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 2);
        assert_eq!(events[1].seq, 3);
    }

    #[tokio::test]
    async fn after_seq_past_max_yields_empty() {
        let (_dir, store) = store();
        let env = Envelope::new("d", kind::TURN_DONE, Some("s1".into()), 1, serde_json::json!({}));
        store.append_event("s1", &env).await.unwrap();
        let events = store.read_events_after("s1", 100).unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_not_fatal() {
        let (_dir, store) = store();
        let env = Envelope::new("d", kind::TURN_DONE, Some("s1".into()), 1, serde_json::json!({}));
        store.append_event("s1", &env).await.unwrap();

        let dir = store.session_dir("s1").unwrap();
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.join(EVENTS_FILE))
            .unwrap();
        writeln!(f, "{{not valid json").unwrap();

        let env2 = Envelope::new("d", kind::TURN_DONE, Some("s1".into()), 2, serde_json::json!({}));
        store.append_event("s1", &env2).await.unwrap();

        let events = store.read_events_after("s1", 0).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn rejects_invalid_session_id_before_touching_disk() {
        let (_dir, store) = store();
        let err = store.read_events_after("../etc", 0).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let (_dir, store) = store();
        let session = Session::new("s1", "m-default");
        store.write_snapshot("s1", &session).await.unwrap();
        let back = store.read_snapshot("s1").unwrap().unwrap();
        assert_eq!(back.id, "s1");
        assert_eq!(back.model, "m-default");
    }

    #[test]
    fn read_snapshot_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.read_snapshot("nope").unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_ensure_dir_is_deduplicated() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                let env = Envelope::new("d", kind::TURN_DONE, Some("s1".into()), i + 1, serde_json::json!({}));
                s.append_event("s1", &env).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let events = store.read_events_after("s1", 0).unwrap();
        assert_eq!(events.len(), 8);
    }
}
