//! Session manager
//!
//! Registry of live bridges, merged with sessions discovered on disk.
//! Constructed once in `main` and shared through `AppState`.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;
use vibecheck_connectors::AgentRuntime;
use vibecheck_protocol::{AttachMode, BridgeState, FleetStatus, SessionDetail, SessionSummary};

use crate::bridge::{BridgeError, SessionBridge};
use crate::connections::ConnectionManager;
use crate::discovery::{discover_sessions, DiscoveredSession};

pub struct SessionManager {
    logs_root: PathBuf,
    connections: Option<Arc<ConnectionManager>>,
    runtime: Option<Arc<dyn AgentRuntime>>,
    sessions: DashMap<String, Arc<SessionBridge>>,
}

impl SessionManager {
    pub fn new(
        logs_root: impl Into<PathBuf>,
        connections: Option<Arc<ConnectionManager>>,
        runtime: Option<Arc<dyn AgentRuntime>>,
    ) -> Self {
        Self {
            logs_root: logs_root.into(),
            connections,
            runtime,
            sessions: DashMap::new(),
        }
    }

    /// Sessions on disk, with live bridge status overlaid where one exists.
    pub fn discover(&self) -> Vec<SessionSummary> {
        discover_sessions(&self.logs_root)
            .into_iter()
            .map(|found| self.summarize(found))
            .collect()
    }

    /// Existing bridge for `session_id`, or a new one. Without an explicit
    /// mode, sessions found on disk attach observe-only and unknown ids are
    /// managed.
    pub fn attach(&self, session_id: &str, mode: Option<AttachMode>) -> Arc<SessionBridge> {
        if let Some(bridge) = self.live(session_id) {
            if let Some(mode) = mode {
                bridge.set_attach_mode(mode);
            }
            return bridge;
        }

        let mode = mode.unwrap_or_else(|| {
            if self.on_disk(session_id).is_some() {
                AttachMode::ObserveOnly
            } else {
                AttachMode::Managed
            }
        });

        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(
                    component = "session_manager",
                    event = "manager.session.attached",
                    session_id = %session_id,
                    attach_mode = mode.as_str(),
                    "Attached session bridge"
                );
                SessionBridge::new(
                    session_id,
                    mode,
                    self.connections.clone(),
                    self.runtime.clone(),
                )
            })
            .value()
            .clone()
    }

    /// Stop and discard a bridge. Returns false if none was attached.
    pub fn detach(&self, session_id: &str) -> bool {
        let Some((_, bridge)) = self.sessions.remove(session_id) else {
            return false;
        };
        bridge.stop();
        info!(
            component = "session_manager",
            event = "manager.session.detached",
            session_id = %session_id,
            "Detached session bridge"
        );
        true
    }

    /// Stop every attached bridge. Used on shutdown.
    pub fn detach_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter(|id| self.detach(id)).count()
    }

    /// Attach in managed mode, run `message` and wait for the queue to drain.
    #[allow(dead_code)]
    pub async fn start_session(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<Arc<SessionBridge>, BridgeError> {
        let bridge = self.attach(session_id, Some(AttachMode::Managed));
        bridge.start_session(message).await?;
        Ok(bridge)
    }

    pub fn has_known_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id) || self.on_disk(session_id).is_some()
    }

    /// Disk sessions in directory order, then live-only bridges by id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut listed = self.discover();
        let mut live_only: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|entry| !listed.iter().any(|s| &s.id == entry.key()))
            .map(|entry| {
                let bridge = entry.value();
                SessionSummary {
                    id: entry.key().clone(),
                    started_at: None,
                    last_activity: None,
                    message_count: bridge.backlog_len(),
                    status: bridge.state(),
                    attach_mode: bridge.attach_mode(),
                    controllable: bridge.controllable(),
                }
            })
            .collect();
        live_only.sort_by(|a, b| a.id.cmp(&b.id));
        listed.extend(live_only);
        listed
    }

    pub fn fleet_status(&self) -> FleetStatus {
        let listed = self.list();
        let mut status = FleetStatus {
            total: listed.len(),
            ..FleetStatus::default()
        };
        for session in &listed {
            match session.status {
                BridgeState::Running => status.running += 1,
                BridgeState::WaitingApproval | BridgeState::WaitingInput => status.waiting += 1,
                BridgeState::Idle => status.idle += 1,
                BridgeState::Disconnected => {}
            }
        }
        status
    }

    pub fn session_detail(&self, session_id: &str) -> Result<SessionDetail, BridgeError> {
        if let Some(bridge) = self.live(session_id) {
            let attach_mode = bridge.attach_mode();
            return Ok(SessionDetail {
                id: session_id.to_string(),
                state: bridge.state(),
                attach_mode,
                controllable: attach_mode.controllable(),
                pending_approval: bridge.pending_approval_ids(),
                pending_input: bridge.pending_input_ids(),
                backlog: bridge.backlog(None),
                started_at: None,
                last_activity: None,
                message_count: None,
            });
        }

        let found = self
            .on_disk(session_id)
            .ok_or_else(|| BridgeError::UnknownSession(session_id.to_string()))?;
        Ok(SessionDetail {
            id: session_id.to_string(),
            state: BridgeState::Disconnected,
            attach_mode: AttachMode::ObserveOnly,
            controllable: false,
            pending_approval: Vec::new(),
            pending_input: Vec::new(),
            backlog: Vec::new(),
            started_at: found.started_at,
            last_activity: found.last_activity,
            message_count: Some(found.message_count),
        })
    }

    fn live(&self, session_id: &str) -> Option<Arc<SessionBridge>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    fn on_disk(&self, session_id: &str) -> Option<DiscoveredSession> {
        discover_sessions(&self.logs_root)
            .into_iter()
            .find(|found| found.id == session_id)
    }

    fn summarize(&self, found: DiscoveredSession) -> SessionSummary {
        let (status, attach_mode) = match self.live(&found.id) {
            Some(bridge) => (bridge.state(), bridge.attach_mode()),
            None => (BridgeState::Disconnected, AttachMode::ObserveOnly),
        };
        SessionSummary {
            id: found.id,
            started_at: found.started_at,
            last_activity: found.last_activity,
            message_count: found.message_count,
            status,
            attach_mode,
            controllable: attach_mode.controllable(),
        }
    }
}
