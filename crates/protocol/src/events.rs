//! Server → Client events
//!
//! Every event carries an `id`, a wall-clock `timestamp` (float seconds) and
//! a `type` discriminator; the remaining fields depend on the variant.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::new_event_id;
use crate::types::{AttachMode, BridgeState};

/// A single wire event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "new_event_id")]
    pub id: String,
    #[serde(default = "now_seconds")]
    pub timestamp: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Variant payloads, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Assistant {
        content: String,
    },
    ToolCall {
        tool_name: String,
        args: Map<String, Value>,
        call_id: String,
    },
    ToolResult {
        call_id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    ApprovalRequest {
        call_id: String,
        tool_name: String,
        args: Map<String, Value>,
    },
    ApprovalResolution {
        call_id: String,
        approved: bool,
        #[serde(default)]
        edited_args: Option<Map<String, Value>>,
    },
    InputRequest {
        request_id: String,
        question: String,
        #[serde(default)]
        options: Vec<String>,
    },
    InputResolution {
        request_id: String,
        response: String,
    },
    State {
        state: BridgeState,
        attach_mode: AttachMode,
        controllable: bool,
    },
    UserMessage {
        content: String,
    },
    Connected {
        session_id: String,
    },
    Heartbeat {},
}

impl EventKind {
    /// The `type` discriminator this variant serializes with.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::Assistant { .. } => "assistant",
            EventKind::ToolCall { .. } => "tool_call",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::ApprovalRequest { .. } => "approval_request",
            EventKind::ApprovalResolution { .. } => "approval_resolution",
            EventKind::InputRequest { .. } => "input_request",
            EventKind::InputResolution { .. } => "input_resolution",
            EventKind::State { .. } => "state",
            EventKind::UserMessage { .. } => "user_message",
            EventKind::Connected { .. } => "connected",
            EventKind::Heartbeat {} => "heartbeat",
        }
    }
}

impl Event {
    /// Stamp a payload with a fresh id and the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: new_event_id(),
            timestamp: now_seconds(),
            kind,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(EventKind::Assistant {
            content: content.into(),
        })
    }

    pub fn user_message(content: impl Into<String>) -> Self {
        Self::new(EventKind::UserMessage {
            content: content.into(),
        })
    }

    pub fn connected(session_id: impl Into<String>) -> Self {
        Self::new(EventKind::Connected {
            session_id: session_id.into(),
        })
    }

    pub fn heartbeat() -> Self {
        Self::new(EventKind::Heartbeat {})
    }

    pub fn state(state: BridgeState, attach_mode: AttachMode) -> Self {
        Self::new(EventKind::State {
            state,
            attach_mode,
            controllable: attach_mode.controllable(),
        })
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Parse an event, rejecting unknown discriminators and missing fields.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
