//! Application state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vibecheck_connectors::AgentRuntime;

use crate::connections::ConnectionManager;
use crate::manager::SessionManager;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub connections: Arc<ConnectionManager>,
    pub psk: String,
    pub static_dir: Option<PathBuf>,
    pub heartbeat_interval: Duration,
}

impl AppState {
    pub fn new(
        psk: impl Into<String>,
        logs_root: impl Into<PathBuf>,
        runtime: Option<Arc<dyn AgentRuntime>>,
        static_dir: Option<PathBuf>,
        heartbeat_interval: Duration,
    ) -> Self {
        let psk = psk.into();
        let connections = Arc::new(ConnectionManager::new(psk.clone()));
        let sessions = Arc::new(SessionManager::new(
            logs_root,
            Some(connections.clone()),
            runtime,
        ));
        Self {
            sessions,
            connections,
            psk,
            static_dir,
            heartbeat_interval,
        }
    }
}
