//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::Event;

/// Lifecycle state of a session bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Idle,
    Running,
    WaitingApproval,
    WaitingInput,
    Disconnected,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Idle => "idle",
            BridgeState::Running => "running",
            BridgeState::WaitingApproval => "waiting_approval",
            BridgeState::WaitingInput => "waiting_input",
            BridgeState::Disconnected => "disconnected",
        }
    }

    /// Waiting on a human (approval or free-text input).
    pub fn is_waiting(&self) -> bool {
        matches!(self, BridgeState::WaitingApproval | BridgeState::WaitingInput)
    }
}

/// How a bridge is attached to its agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// Wraps an agent loop the host is already running.
    Live,
    Replay,
    /// Mirrors a session discovered on disk; cannot be driven.
    ObserveOnly,
    /// Builds its own agent loop on the first injected message.
    Managed,
}

impl AttachMode {
    pub fn controllable(&self) -> bool {
        !matches!(self, AttachMode::ObserveOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachMode::Live => "live",
            AttachMode::Replay => "replay",
            AttachMode::ObserveOnly => "observe_only",
            AttachMode::Managed => "managed",
        }
    }
}

/// One row of `GET /api/sessions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub started_at: Option<String>,
    pub last_activity: Option<String>,
    pub message_count: usize,
    pub status: BridgeState,
    pub attach_mode: AttachMode,
    pub controllable: bool,
}

/// Fleet-wide counts for `GET /api/state`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStatus {
    pub total: usize,
    pub running: usize,
    pub waiting: usize,
    pub idle: usize,
}

/// Full detail for `GET /api/sessions/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub id: String,
    pub state: BridgeState,
    pub attach_mode: AttachMode,
    pub controllable: bool,
    pub pending_approval: Vec<String>,
    pub pending_input: Vec<String>,
    pub backlog: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
}

/// Oldest outstanding approval, for state inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApprovalInfo {
    pub call_id: String,
    pub tool_name: String,
    pub args: Map<String, Value>,
}

/// Oldest outstanding input request, for state inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInputInfo {
    pub request_id: String,
    pub question: String,
    pub options: Vec<String>,
}

/// Body of `GET /api/sessions/{id}/state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub state: BridgeState,
    pub attach_mode: AttachMode,
    pub controllable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApprovalInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_input: Option<PendingInputInfo>,
}

/// Simple `{"status": ...}` acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}
