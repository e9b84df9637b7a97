//! Daemon configuration tree.
//!
//! Loaded from a TOML file (if present) and overlaid with environment
//! variables; every field has a default so an empty file (or no file at
//! all) produces a runnable daemon bound to loopback-only defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub preflight: PreflightConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

impl Config {
    /// Load from `path` if it exists, then apply environment overrides.
    /// Missing file is not an error — defaults apply.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        } else {
            Config::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SD_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("SD_PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Ok(v) = std::env::var("SD_DATA_DIR") {
            self.daemon.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SD_LOG_LEVEL") {
            self.daemon.log_level = v;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server (§4.7, §6 Bind)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Extra ports tried in order if `port` is already bound.
    #[serde(default = "d_port_fallbacks")]
    pub port_fallback_count: u16,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            port_fallback_count: d_port_fallbacks(),
            cors: CorsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// P9: the daemon must refuse to bind to anything but a loopback
    /// address, even if an operator overrides `SD_HOST`/the config file.
    /// Checked by parsed IP rather than string match so `0.0.0.0`,
    /// hostnames, and IPv6 non-loopback forms are all rejected too.
    pub fn validate_loopback(&self) -> Result<(), String> {
        match self.host.parse::<std::net::IpAddr>() {
            Ok(addr) if addr.is_loopback() => Ok(()),
            Ok(addr) => Err(format!("refusing to bind non-loopback address {addr}")),
            Err(_) => Err(format!("host {:?} is not a valid loopback IP address", self.host)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Loopback-only by default, per §4.7.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Daemon lifecycle (§4.9, §6 On-disk state)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Root directory for state file, token, logs, and per-session stores.
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "d_log_level")]
    pub log_level: String,
    /// Minimum free bytes on the data-dir filesystem; below this,
    /// `appendEvent` fails with `StorageFull`.
    #[serde(default = "d_min_free_bytes")]
    pub min_free_bytes: u64,
    /// Grace period for SIGTERM before SIGKILL on daemon stop.
    #[serde(default = "d_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            log_level: d_log_level(),
            min_free_bytes: d_min_free_bytes(),
            stop_grace_secs: d_stop_grace_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission coordinator (§4.3)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Auto-deny timeout in seconds, default 120s per §4.3/§5.
    #[serde(default = "d_permission_timeout_secs")]
    pub auto_deny_timeout_secs: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            auto_deny_timeout_secs: d_permission_timeout_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model preflight (§4.6, §5)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    #[serde(default = "d_preflight_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "d_preflight_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            timeout_ms: d_preflight_timeout_ms(),
            cache_ttl_secs: d_preflight_cache_ttl_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool worker pool (§4.4)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "d_min_workers")]
    pub min_workers: usize,
    /// 0 means derive `min(8, cpus-1)` at startup.
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default = "d_idle_reap_secs")]
    pub idle_reap_secs: u64,
    #[serde(default = "d_pool_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Workers pre-spawned at daemon start to remove cold-start latency.
    #[serde(default = "d_warmup_workers")]
    pub warmup_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: d_min_workers(),
            max_workers: 0,
            idle_reap_secs: d_idle_reap_secs(),
            sweep_interval_secs: d_pool_sweep_interval_secs(),
            warmup_workers: d_warmup_workers(),
        }
    }
}

impl PoolConfig {
    pub fn effective_max_workers(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        std::cmp::min(8, cpus.saturating_sub(1).max(1))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Background process manager (§4.5)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent: usize,
    /// Max buffered output bytes per process, default 1 MiB per §3.
    #[serde(default = "d_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    /// SIGTERM→SIGKILL escalation grace period, default 5s per §4.5/§5.
    #[serde(default = "d_sigterm_grace_secs")]
    pub sigterm_grace_secs: u64,
    /// Terminal-state processes are pruned after this many seconds, default
    /// 5 minutes per §3.
    #[serde(default = "d_process_prune_secs")]
    pub prune_after_secs: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_concurrent: d_max_concurrent(),
            max_buffer_bytes: d_max_buffer_bytes(),
            sigterm_grace_secs: d_sigterm_grace_secs(),
            prune_after_secs: d_process_prune_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-result cache (§3, §4.6)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "d_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "d_cache_max_size")]
    pub max_size: usize,
    /// Tool names that invalidate the entire session cache on call (§3,
    /// §4.6 `runToolWithCache`).
    #[serde(default = "d_write_tools")]
    pub write_tools: Vec<String>,
    /// Tool names eligible for read-through caching.
    #[serde(default = "d_cacheable_tools")]
    pub cacheable_tools: Vec<String>,
    /// JSON argument key holding a filesystem path, used to invalidate a
    /// cache entry when the underlying file's mtime has changed (§3
    /// "path-keyed tools").
    #[serde(default = "d_path_arg_key")]
    pub path_arg_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: d_cache_ttl_secs(),
            max_size: d_cache_max_size(),
            write_tools: d_write_tools(),
            cacheable_tools: d_cacheable_tools(),
            path_arg_key: d_path_arg_key(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session manager (§4.6 Eviction)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Eviction sweep interval, default 5 minutes per §4.6.
    #[serde(default = "d_eviction_sweep_secs")]
    pub eviction_sweep_secs: u64,
    /// Idle threshold before an unsubscribed, idle session is evicted from
    /// memory (not disk), default 30 minutes per §3/§4.6.
    #[serde(default = "d_idle_evict_minutes")]
    pub idle_evict_minutes: i64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            eviction_sweep_secs: d_eviction_sweep_secs(),
            idle_evict_minutes: d_idle_evict_minutes(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default value helpers (serde)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    9999
}
fn d_port_fallbacks() -> u16 {
    5
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://127.0.0.1:*".into(), "http://localhost:*".into()]
}
fn d_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn d_log_level() -> String {
    "info".into()
}
fn d_min_free_bytes() -> u64 {
    64 * 1024 * 1024
}
fn d_stop_grace_secs() -> u64 {
    5
}
fn d_permission_timeout_secs() -> u64 {
    120
}
fn d_preflight_timeout_ms() -> u64 {
    8_000
}
fn d_preflight_cache_ttl_secs() -> u64 {
    10
}
fn d_min_workers() -> usize {
    1
}
fn d_idle_reap_secs() -> u64 {
    60
}
fn d_pool_sweep_interval_secs() -> u64 {
    30
}
fn d_warmup_workers() -> usize {
    2
}
fn d_max_concurrent() -> usize {
    5
}
fn d_max_buffer_bytes() -> usize {
    1024 * 1024
}
fn d_sigterm_grace_secs() -> u64 {
    5
}
fn d_process_prune_secs() -> u64 {
    300
}
fn d_cache_ttl_secs() -> u64 {
    60
}
fn d_cache_max_size() -> usize {
    256
}
fn d_write_tools() -> Vec<String> {
    vec![
        "write_file".into(),
        "edit_file".into(),
        "apply_patch".into(),
        "delete_file".into(),
        "exec".into(),
    ]
}
fn d_cacheable_tools() -> Vec<String> {
    vec!["read_file".into(), "list_dir".into(), "grep".into(), "glob".into()]
}
fn d_path_arg_key() -> String {
    "path".into()
}
fn d_eviction_sweep_secs() -> u64 {
    300
}
fn d_idle_evict_minutes() -> i64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_loopback() {
        let cfg = Config::default();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 9999);
        assert!(cfg.server.validate_loopback().is_ok());
    }

    #[test]
    fn non_loopback_host_is_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.host = "0.0.0.0".into();
        assert!(cfg.validate_loopback().is_err());
        cfg.host = "192.168.1.5".into();
        assert!(cfg.validate_loopback().is_err());
        cfg.host = "::1".into();
        assert!(cfg.validate_loopback().is_ok());
    }

    #[test]
    fn pool_max_workers_derives_when_zero() {
        let cfg = PoolConfig::default();
        assert!(cfg.effective_max_workers() >= 1);
        assert!(cfg.effective_max_workers() <= 8);
    }

    #[test]
    fn permission_timeout_defaults_to_120s() {
        assert_eq!(PermissionsConfig::default().auto_deny_timeout_secs, 120);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/sd.toml")).unwrap();
        assert_eq!(cfg.server.port, 9999);
    }
}
