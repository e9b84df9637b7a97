//! Command-line entry point (§12 "doctor-style CLI subcommand"). Argument
//! parsing itself sits outside the daemon's spec'd behavior (§1 Non-goals),
//! but the process still needs *a* entry point — grounded in the teacher's
//! `clap`-based `Cli`/`Command` subcommand split (`cli/mod.rs`).

pub mod doctor;
pub mod systemd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sd_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "sessiond", version, about = "Local agent session daemon")]
pub struct Cli {
    /// Path to the TOML config file (defaults to `SD_CONFIG`, or `./sd.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon in the foreground (default when no subcommand is given).
    Serve,
    /// Check data directory writability and port availability without starting the server.
    Doctor,
    /// Stop a running daemon: SIGTERM, then SIGKILL after the grace period.
    Stop,
    /// Report whether a daemon is running and its bound address.
    Status,
    /// Platform service unit generation.
    #[command(subcommand)]
    Systemd(SystemdCommand),
}

#[derive(Debug, Subcommand)]
pub enum SystemdCommand {
    /// Generate a systemd unit file and print it to stdout.
    Generate {
        /// Linux user to run the service as.
        #[arg(long, default_value = "sessiond")]
        user: String,
        /// Working directory for the service.
        #[arg(long)]
        working_dir: Option<String>,
        /// Path to the config file, passed through as `SD_CONFIG`.
        #[arg(long, default_value = "sd.toml")]
        config: String,
    },
}

/// Resolve and load configuration: `--config`, then `SD_CONFIG`, then
/// `./sd.toml`. A missing file is not an error (§11 "every field
/// defaulting"); `SD_*` environment overrides are applied afterward by
/// `Config::load` itself.
pub fn load_config(explicit: Option<&std::path::Path>) -> anyhow::Result<(Config, PathBuf)> {
    let path = explicit
        .map(PathBuf::from)
        .or_else(|| std::env::var("SD_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("sd.toml"));
    let config = Config::load(&path)?;
    Ok((config, path))
}
