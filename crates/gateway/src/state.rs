//! Shared axum application state: everything a request handler needs to
//! reach the runtime without threading a dozen separate extractors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sd_domain::config::Config;
use sd_process::BackgroundProcessManager;
use sd_sessions::EventStore;

use crate::daemon::state_file::DaemonToken;
use crate::runtime::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub daemon_id: String,
    pub started_at: DateTime<Utc>,
    pub session_manager: Arc<SessionManager>,
    pub event_store: Arc<EventStore>,
    pub processes: Arc<BackgroundProcessManager>,
    pub token: Arc<DaemonToken>,
    pub config: Config,
}
