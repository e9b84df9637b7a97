//! On-disk daemon state: where a running daemon publishes its address and
//! credential so CLI clients and `ensureRunning` can find it without
//! guessing a port (§4.9, §6 "On-disk state").

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STATE_FILE: &str = "state.json";
pub const TOKEN_FILE: &str = "token";
pub const PID_FILE: &str = "daemon.pid";
pub const LOG_FILE: &str = "daemon.log-lines";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub pid: u32,
    #[serde(rename = "daemonId")]
    pub daemon_id: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "logsPath")]
    pub logs_path: PathBuf,
}

/// The bearer token minted once per daemon lifetime, shared into request
/// handlers via axum `State`.
#[derive(Clone)]
pub struct DaemonToken(pub String);

/// Mint a fresh bearer token. No `rand` crate is in the dependency set, so
/// two concatenated UUID v4s (128 bits of OS-RNG entropy each, per the
/// `uuid` crate's `v4` feature) stand in for a purpose-built token
/// generator — comfortably over the 128-bit floor in §6.
pub fn mint_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STATE_FILE)
}
pub fn token_path(data_dir: &Path) -> PathBuf {
    data_dir.join(TOKEN_FILE)
}
pub fn pid_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE)
}
pub fn log_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_FILE)
}

/// Publish the state file, token file (user-only permissions), and PID
/// file together. Called once at daemon startup, after the listener is
/// bound and before it starts accepting (§4.9).
pub fn write_state(data_dir: &Path, state: &DaemonState, token: &str) -> Result<()> {
    fs::create_dir_all(data_dir).context("creating data dir")?;
    let json = serde_json::to_string_pretty(state).context("serializing daemon state")?;
    fs::write(state_path(data_dir), json).context("writing state file")?;
    write_token(data_dir, token)?;
    fs::write(pid_path(data_dir), state.pid.to_string()).context("writing pid file")?;
    Ok(())
}

fn write_token(data_dir: &Path, token: &str) -> Result<()> {
    let path = token_path(data_dir);
    fs::write(&path, token).context("writing token file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms)?;
    }
    Ok(())
}

pub fn read_state(data_dir: &Path) -> Option<DaemonState> {
    let raw = fs::read_to_string(state_path(data_dir)).ok()?;
    serde_json::from_str(&raw).ok()
}

pub fn read_token(data_dir: &Path) -> Option<String> {
    fs::read_to_string(token_path(data_dir))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Remove all lifecycle files. Safe to call when none exist.
pub fn clear(data_dir: &Path) {
    let _ = fs::remove_file(state_path(data_dir));
    let _ = fs::remove_file(token_path(data_dir));
    let _ = fs::remove_file(pid_path(data_dir));
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // Signal 0: no-op existence probe (§4.9 "stale state").
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let state = DaemonState {
            pid: std::process::id(),
            daemon_id: "daemon_1".into(),
            host: "127.0.0.1".into(),
            port: 9999,
            started_at: Utc::now(),
            logs_path: dir.path().join(LOG_FILE),
        };
        write_state(dir.path(), &state, "tok123").unwrap();

        let back = read_state(dir.path()).unwrap();
        assert_eq!(back.daemon_id, "daemon_1");
        assert_eq!(read_token(dir.path()).unwrap(), "tok123");
    }

    #[test]
    fn clear_removes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = DaemonState {
            pid: std::process::id(),
            daemon_id: "d".into(),
            host: "127.0.0.1".into(),
            port: 1,
            started_at: Utc::now(),
            logs_path: dir.path().join(LOG_FILE),
        };
        write_state(dir.path(), &state, "tok").unwrap();
        clear(dir.path());
        assert!(read_state(dir.path()).is_none());
        assert!(read_token(dir.path()).is_none());
    }

    #[test]
    fn mint_token_is_long_and_distinct() {
        let a = mint_token();
        let b = mint_token();
        assert!(a.len() >= 32);
        assert_ne!(a, b);
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
