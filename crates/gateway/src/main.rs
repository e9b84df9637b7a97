use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use sd_domain::config::Config;
use sd_gateway::agent_default::HttpAgent;
use sd_gateway::cli::{Cli, Command, SystemdCommand};
use sd_gateway::daemon::state_file::{self, DaemonState, DaemonToken};
use sd_gateway::inference::HttpInferenceClient;
use sd_gateway::process_sink::SessionEventProcessSink;
use sd_gateway::runtime::SessionManager;
use sd_gateway::state::AppState;
use sd_gateway::tools_default::DefaultToolExecutor;
use sd_process::BackgroundProcessManager;
use sd_sessions::EventStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            let (config, config_path) = sd_gateway::cli::load_config(cli.config.as_deref())?;
            init_tracing(&config);
            run_server(config, &config_path).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = sd_gateway::cli::load_config(cli.config.as_deref())?;
            let passed = sd_gateway::cli::doctor::run(&config, &config_path).await;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Stop) => {
            let (config, _) = sd_gateway::cli::load_config(cli.config.as_deref())?;
            sd_gateway::daemon::lifecycle::stop(&config.daemon.data_dir, std::time::Duration::from_secs(config.daemon.stop_grace_secs)).await?;
            println!("stopped");
            Ok(())
        }
        Some(Command::Status) => {
            let (config, _) = sd_gateway::cli::load_config(cli.config.as_deref())?;
            match state_file::read_state(&config.daemon.data_dir) {
                Some(state) if state_file::process_alive(state.pid) => {
                    println!("running: pid {} at {}:{}", state.pid, state.host, state.port);
                }
                _ => {
                    println!("not running");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Some(Command::Systemd(SystemdCommand::Generate { user, working_dir, config })) => {
            println!("{}", sd_gateway::cli::systemd::generate(&user, working_dir.as_deref(), &config));
            Ok(())
        }
    }
}

/// Structured logging to stdout (JSON) and to `daemon.log-lines` under the
/// data directory (§11), both driven by the same `RUST_LOG`-style filter
/// (default `info`), grounded in the teacher's `EnvFilter` + `.json()`
/// setup, generalized to a second `registry()` layer for the file sink.
fn init_tracing(config: &Config) {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{},sd_gateway=debug", config.daemon.log_level)))
    };

    let stdout_layer = tracing_subscriber::fmt::layer().json().with_filter(filter());

    let file_layer = std::fs::create_dir_all(&config.daemon.data_dir)
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(state_file::log_path(&config.daemon.data_dir))
        })
        .map(|file| tracing_subscriber::fmt::layer().json().with_writer(std::sync::Mutex::new(file)).with_filter(filter()))
        .ok();

    let registry = tracing_subscriber::registry().with(stdout_layer);
    match file_layer {
        Some(layer) => registry.with(layer).init(),
        None => registry.init(),
    }
}

/// Start the daemon in the foreground: bind the listener, publish on-disk
/// state, serve until a termination signal, then clear that state (§4.9,
/// §12 "graceful shutdown").
async fn run_server(config: Config, _config_path: &std::path::Path) -> anyhow::Result<()> {
    tracing::info!("sessiond starting");

    let daemon_id = format!("daemon_{}", uuid::Uuid::new_v4().simple());
    let token_value = state_file::mint_token();
    let token = Arc::new(DaemonToken(token_value.clone()));

    let event_store = Arc::new(EventStore::new(config.daemon.data_dir.join("sessions"), config.daemon.min_free_bytes));

    let inference_url = std::env::var("SD_INFERENCE_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());
    let agent: Arc<dyn sd_domain::agent::Agent> = Arc::new(HttpAgent::new(inference_url.clone()));
    let inference: Arc<dyn sd_domain::agent::InferenceClient> = Arc::new(HttpInferenceClient::new(inference_url));
    let tool_executor: Arc<dyn sd_domain::agent::ToolExecutor> = Arc::new(DefaultToolExecutor::new(config.daemon.data_dir.join("workspace")));

    let session_manager = SessionManager::new(daemon_id.clone(), event_store.clone(), agent, inference, tool_executor, config.clone());

    let process_sink = Arc::new(SessionEventProcessSink::new(session_manager.clone()));
    let processes = Arc::new(BackgroundProcessManager::new(config.process.clone(), process_sink));

    let state = AppState {
        daemon_id: daemon_id.clone(),
        started_at: chrono::Utc::now(),
        session_manager: session_manager.clone(),
        event_store: event_store.clone(),
        processes: processes.clone(),
        token,
        config: config.clone(),
    };

    spawn_sweeps(state.clone());

    let app = sd_gateway::api::build(state.clone());

    let (listener, bound_port) = bind_with_fallback(&config).await?;
    tracing::info!(host = %config.server.host, port = bound_port, "sessiond listening");

    let daemon_state = DaemonState {
        pid: std::process::id(),
        daemon_id,
        host: config.server.host.clone(),
        port: bound_port,
        started_at: state.started_at,
        logs_path: state_file::log_path(&config.daemon.data_dir),
    };
    state_file::write_state(&config.daemon.data_dir, &daemon_state, &token_value).context("publishing daemon state")?;

    let data_dir = config.daemon.data_dir.clone();
    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;
    state_file::clear(&data_dir);
    result.context("server error")
}

/// Try the configured port, then up to `port_fallback_count` ports above it
/// (§4.7). Refuses to bind anything but the configured host — this daemon
/// never exposes a non-loopback interface by accident.
async fn bind_with_fallback(config: &Config) -> anyhow::Result<(tokio::net::TcpListener, u16)> {
    config.server.validate_loopback().map_err(|e| anyhow::anyhow!(e))?;

    let mut last_err = None;
    for offset in 0..=config.server.port_fallback_count {
        let port = config.server.port + offset;
        let addr = format!("{}:{port}", config.server.host);
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "bind failed, trying next port");
                last_err = Some(e);
            }
        }
    }
    Err(anyhow::anyhow!(
        "no available port in range {}..={} ({})",
        config.server.port,
        config.server.port + config.server.port_fallback_count,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("installing SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining");
}

/// Background sweeps: session eviction (piggybacking permission GC),
/// background-process pruning, and tool worker pool idle reaping (§4.4,
/// §4.5, §4.6).
fn spawn_sweeps(state: AppState) {
    {
        let manager = state.session_manager.clone();
        let period = std::time::Duration::from_secs(state.config.sessions.eviction_sweep_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                manager.evict_idle();
            }
        });
    }

    {
        let processes = state.processes.clone();
        let period = std::time::Duration::from_secs(state.config.process.prune_after_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                processes.prune();
            }
        });
    }

    // The tool worker pool needs no external sweep: each worker retires
    // itself after sitting idle past `idle_reap` via its own
    // `tokio::time::timeout` wait (see `WorkerPool::run_worker`), which
    // satisfies the same "idle reap" budget (§4.4, §5) without a
    // synchronized tick.
}
