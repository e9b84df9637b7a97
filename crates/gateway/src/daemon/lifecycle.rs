//! Daemon process lifecycle: start-if-not-running, health-checked readiness
//! polling, and graceful stop (§4.9, §6 "ensureRunning").
//!
//! Grounded in the teacher's detached-subprocess bootstrap, generalized
//! with a PID-liveness + `/v3/health` contract check so a stale state file
//! left behind by a crashed daemon is never mistaken for a running one.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use super::state_file::{self, DaemonState};

/// Returns the base URL of a running daemon, starting one if necessary.
pub async fn ensure_running(data_dir: &Path, exe: &Path) -> Result<String> {
    if let Some(state) = state_file::read_state(data_dir) {
        if state_file::process_alive(state.pid) && health_check(data_dir, &state).await {
            return Ok(format!("http://{}:{}", state.host, state.port));
        }
        tracing::warn!(pid = state.pid, "stale daemon state; clearing before respawn");
        state_file::clear(data_dir);
    }

    spawn_detached(exe, data_dir)?;
    poll_until_ready(data_dir).await
}

/// Not just "did something answer on that port" — `/v3/health`'s
/// `daemonId` must match the state file's, so a stale port claimed by an
/// unrelated process after a crash is never mistaken for this daemon
/// still running (§4.9 "responds OK with matching contract").
async fn health_check(data_dir: &Path, state: &DaemonState) -> bool {
    let Some(token) = state_file::read_token(data_dir) else {
        return false;
    };
    let url = format!("http://{}:{}/v3/health", state.host, state.port);
    let Ok(resp) = reqwest::Client::new()
        .get(url)
        .bearer_auth(token)
        .timeout(Duration::from_secs(2))
        .send()
        .await
    else {
        return false;
    };
    if !resp.status().is_success() {
        return false;
    }
    resp.json::<serde_json::Value>()
        .await
        .map(|body| body.get("daemonId").and_then(|v| v.as_str()) == Some(state.daemon_id.as_str()))
        .unwrap_or(false)
}

fn spawn_detached(exe: &Path, data_dir: &Path) -> Result<()> {
    std::process::Command::new(exe)
        .arg("serve")
        .env("SD_DATA_DIR", data_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn daemon process")?;
    Ok(())
}

async fn poll_until_ready(data_dir: &Path) -> Result<String> {
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(state) = state_file::read_state(data_dir) {
            if health_check(data_dir, &state).await {
                return Ok(format!("http://{}:{}", state.host, state.port));
            }
        }
    }
    bail!("daemon did not become ready within the startup window")
}

/// Stop a running daemon: SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn stop(data_dir: &Path, grace: Duration) -> Result<()> {
    let Some(state) = state_file::read_state(data_dir) else {
        return Ok(());
    };
    if !state_file::process_alive(state.pid) {
        state_file::clear(data_dir);
        return Ok(());
    }

    send_signal(state.pid, libc::SIGTERM);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !state_file::process_alive(state.pid) {
            state_file::clear(data_dir);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    send_signal(state.pid, libc::SIGKILL);
    state_file::clear(data_dir);
    Ok(())
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: i32) {
    unsafe {
        libc::kill(pid as i32, sig);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _sig: i32) {}
