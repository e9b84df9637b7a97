//! Background process manager (§4.5).
//!
//! Grounded in the teacher's `ProcessManager`/`exec` monitor-task pattern
//! (spawn a supervising tokio task per child, report status through shared
//! state) but reworked so: argv comes from the shell-free tokenizer, output
//! is kept in `sd_domain::model::OutputRing` rather than a flat string
//! buffer, and kill uses real POSIX signals with SIGTERM→SIGKILL escalation
//! instead of always hard-killing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sd_domain::config::ProcessConfig;
use sd_domain::error::{Error, Result};
use sd_domain::model::{BackgroundProcess, BackgroundProcessState, OutputChunk, OutputRing, OutputStream};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::tokenizer::tokenize;

/// Receives output and state-change notifications for background
/// processes. Implemented by the owning session manager so that output
/// chunks and state transitions become `background.output` /
/// `background.status` events (§3, §4.5).
#[async_trait]
pub trait ProcessEventSink: Send + Sync {
    async fn on_output(&self, session_id: &str, process_id: &str, chunk: OutputChunk);
    async fn on_state_change(&self, session_id: &str, process: BackgroundProcess);
}

struct Entry {
    meta: Mutex<BackgroundProcess>,
    ring: Mutex<OutputRing>,
    signal_tx: mpsc::Sender<i32>,
}

pub struct StartRequest {
    pub session_id: String,
    pub command: String,
    pub label: Option<String>,
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
}

pub struct BackgroundProcessManager {
    config: ProcessConfig,
    sink: Arc<dyn ProcessEventSink>,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl BackgroundProcessManager {
    pub fn new(config: ProcessConfig, sink: Arc<dyn ProcessEventSink>) -> Self {
        Self {
            config,
            sink,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn running_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| !e.meta.lock().state.is_terminal())
            .count()
    }

    /// Launch a detached child process. Rejects with `StateConflict` once
    /// `maxConcurrent` running processes are already tracked (§4.5).
    pub async fn start(&self, req: StartRequest) -> Result<BackgroundProcess> {
        if self.running_count() >= self.config.max_concurrent {
            return Err(Error::StateConflict(format!(
                "max concurrent background processes reached ({})",
                self.config.max_concurrent
            )));
        }

        let argv = tokenize(&req.command)?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        if let Some(ref cwd) = req.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::InvalidInput(format!("failed to spawn background process: {e}"))
        })?;
        let os_pid = child.id();
        let process_id = uuid::Uuid::new_v4().to_string();

        let meta = BackgroundProcess {
            process_id: process_id.clone(),
            session_id: req.session_id.clone(),
            os_pid,
            command: req.command.clone(),
            cwd: req.cwd.clone(),
            state: BackgroundProcessState::Running,
            exit_code: None,
            started_at: Utc::now(),
            ended_at: None,
            timeout_ms: req.timeout_ms,
        };

        let (signal_tx, signal_rx) = mpsc::channel::<i32>(4);
        let entry = Arc::new(Entry {
            meta: Mutex::new(meta.clone()),
            ring: Mutex::new(OutputRing::new(self.config.max_buffer_bytes)),
            signal_tx,
        });
        self.entries.lock().insert(process_id.clone(), entry.clone());

        self.sink.on_state_change(&req.session_id, meta.clone()).await;

        spawn_monitor(
            child_take_pipes(&mut child),
            child,
            entry,
            self.sink.clone(),
            req.session_id,
            signal_rx,
            self.config.sigterm_grace_secs,
            req.timeout_ms,
        );

        Ok(meta)
    }

    /// Output chunks with `seq > after_seq`, filtered by stream, plus
    /// `hasMore` (§4.5).
    pub fn output(
        &self,
        process_id: &str,
        after_seq: u64,
        limit: usize,
        stream: Option<OutputStream>,
    ) -> Result<(Vec<OutputChunk>, bool)> {
        let entries = self.entries.lock();
        let entry = entries
            .get(process_id)
            .ok_or_else(|| Error::NotFound(format!("background process {process_id}")))?;
        Ok(entry.ring.lock().after(after_seq, limit, stream))
    }

    pub fn get(&self, process_id: &str) -> Option<BackgroundProcess> {
        self.entries.lock().get(process_id).map(|e| e.meta.lock().clone())
    }

    pub fn list(&self, session_id: Option<&str>) -> Vec<BackgroundProcess> {
        self.entries
            .lock()
            .values()
            .map(|e| e.meta.lock().clone())
            .filter(|m| session_id.map(|s| s == m.session_id).unwrap_or(true))
            .collect()
    }

    /// Send `signal` (default SIGTERM) to a process. Escalation to SIGKILL
    /// is handled by the monitor task.
    pub async fn kill(&self, process_id: &str, signal: i32) -> Result<()> {
        let entry = {
            let entries = self.entries.lock();
            entries
                .get(process_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("background process {process_id}")))?
        };
        if entry.meta.lock().state.is_terminal() {
            return Ok(());
        }
        entry
            .signal_tx
            .send(signal)
            .await
            .map_err(|_| Error::Other("process monitor no longer listening".into()))
    }

    pub async fn kill_session(&self, session_id: &str) -> Result<()> {
        let ids: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.meta.lock().session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let _ = self.kill(&id, libc::SIGTERM).await;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.kill(&id, libc::SIGTERM).await;
        }
        Ok(())
    }

    /// Drop processes that have been in a terminal state for longer than
    /// `prune_after_secs` (§3: "pruned 5 minutes after reaching a terminal
    /// state").
    pub fn prune(&self) {
        let cutoff = chrono::Duration::seconds(self.config.prune_after_secs as i64);
        let now = Utc::now();
        self.entries.lock().retain(|_, e| {
            let meta = e.meta.lock();
            match meta.ended_at {
                Some(ended) => now.signed_duration_since(ended) < cutoff,
                None => true,
            }
        });
    }
}

struct Pipes {
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
}

fn child_take_pipes(child: &mut tokio::process::Child) -> Pipes {
    Pipes {
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_monitor(
    pipes: Pipes,
    mut child: tokio::process::Child,
    entry: Arc<Entry>,
    sink: Arc<dyn ProcessEventSink>,
    session_id: String,
    mut signal_rx: mpsc::Receiver<i32>,
    sigterm_grace_secs: u64,
    timeout_ms: Option<u64>,
) {
    tokio::spawn(async move {
        let out_entry = entry.clone();
        let out_sink = sink.clone();
        let out_session = session_id.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = pipes.stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let chunk = out_entry.ring.lock().push(OutputStream::Stdout, line);
                    out_sink.on_output(&out_session, &out_entry.meta.lock().process_id.clone(), chunk).await;
                }
            }
        });

        let err_entry = entry.clone();
        let err_sink = sink.clone();
        let err_session = session_id.clone();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = pipes.stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let chunk = err_entry.ring.lock().push(OutputStream::Stderr, line);
                    err_sink.on_output(&err_session, &err_entry.meta.lock().process_id.clone(), chunk).await;
                }
            }
        });

        let timeout_fut = async {
            match timeout_ms {
                Some(ms) => tokio::time::sleep(std::time::Duration::from_millis(ms)).await,
                None => std::future::pending::<()>().await,
            }
        };

        let final_state;
        let exit_code;

        tokio::select! {
            result = child.wait() => {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                exit_code = result.ok().and_then(|s| s.code());
                final_state = if exit_code == Some(0) {
                    BackgroundProcessState::Completed
                } else {
                    BackgroundProcessState::Failed
                };
            }
            signal = signal_rx.recv() => {
                let signal = signal.unwrap_or(libc::SIGTERM);
                send_signal(&child, signal);
                if signal != libc::SIGKILL {
                    wait_then_escalate(&mut child, sigterm_grace_secs).await;
                }
                let _ = child.wait().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                exit_code = None;
                final_state = BackgroundProcessState::Killed;
            }
            _ = timeout_fut => {
                send_signal(&child, libc::SIGTERM);
                wait_then_escalate(&mut child, sigterm_grace_secs).await;
                let _ = child.wait().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                exit_code = None;
                final_state = BackgroundProcessState::Timeout;
            }
        }

        let meta = {
            let mut meta = entry.meta.lock();
            meta.state = final_state;
            meta.exit_code = exit_code;
            meta.ended_at = Some(Utc::now());
            meta.clone()
        };
        sink.on_state_change(&session_id, meta).await;
    });
}

fn send_signal(child: &tokio::process::Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, signal);
        }
    }
}

/// Wait up to `grace_secs` for the child to exit on its own; if it hasn't,
/// escalate to SIGKILL (§4.5).
async fn wait_then_escalate(child: &mut tokio::process::Child, grace_secs: u64) {
    let grace = std::time::Duration::from_secs(grace_secs);
    tokio::select! {
        _ = child.wait() => {}
        _ = tokio::time::sleep(grace) => {
            send_signal(child, libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink {
        outputs: AtomicUsize,
        states: AtomicUsize,
    }

    #[async_trait]
    impl ProcessEventSink for NullSink {
        async fn on_output(&self, _session_id: &str, _process_id: &str, _chunk: OutputChunk) {
            self.outputs.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_state_change(&self, _session_id: &str, _process: BackgroundProcess) {
            self.states.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> (Arc<NullSink>, BackgroundProcessManager) {
        let sink = Arc::new(NullSink {
            outputs: AtomicUsize::new(0),
            states: AtomicUsize::new(0),
        });
        let mgr = BackgroundProcessManager::new(ProcessConfig::default(), sink.clone());
        (sink, mgr)
    }

    #[tokio::test]
    async fn start_and_collect_output() {
        let (_sink, mgr) = manager();
        let meta = mgr
            .start(StartRequest {
                session_id: "s1".into(),
                command: "echo hello".into(),
                label: None,
                cwd: None,
                timeout_ms: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let (chunks, _has_more) = mgr.output(&meta.process_id, 0, 100, None).unwrap();
        assert!(chunks.iter().any(|c| c.text.contains("hello")));
    }

    #[tokio::test]
    async fn rejects_when_over_max_concurrent() {
        let sink = Arc::new(NullSink {
            outputs: AtomicUsize::new(0),
            states: AtomicUsize::new(0),
        });
        let mut cfg = ProcessConfig::default();
        cfg.max_concurrent = 1;
        let mgr = BackgroundProcessManager::new(cfg, sink);
        mgr.start(StartRequest {
            session_id: "s1".into(),
            command: "sleep 2".into(),
            label: None,
            cwd: None,
            timeout_ms: None,
        })
        .await
        .unwrap();

        let err = mgr
            .start(StartRequest {
                session_id: "s1".into(),
                command: "echo two".into(),
                label: None,
                cwd: None,
                timeout_ms: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)));
    }

    #[tokio::test]
    async fn kill_transitions_to_killed() {
        let (_sink, mgr) = manager();
        let meta = mgr
            .start(StartRequest {
                session_id: "s1".into(),
                command: "sleep 30".into(),
                label: None,
                cwd: None,
                timeout_ms: None,
            })
            .await
            .unwrap();
        mgr.kill(&meta.process_id, libc::SIGTERM).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let updated = mgr.get(&meta.process_id).unwrap();
        assert_eq!(updated.state, BackgroundProcessState::Killed);
    }

    #[test]
    fn invalid_command_is_rejected_before_spawn() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (_sink, mgr) = manager();
            let err = mgr
                .start(StartRequest {
                    session_id: "s1".into(),
                    command: "'unterminated".into(),
                    label: None,
                    cwd: None,
                    timeout_ms: None,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)));
        });
    }
}
