//! vibecheck Connectors
//!
//! The boundary between a session bridge and an agent runtime. An agent
//! loop produces a lazy stream of [`AgentEvent`]s per turn and suspends on
//! the [`AgentCallbacks`] it was given whenever a tool call needs approval
//! or the agent wants to ask the user something.

pub mod args;
pub mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use args::{ArgsError, JsonArgs, ToolArgs, TypedArgs};
pub use stdio::StdioRuntime;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process communication error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Agent runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("No {0} callback registered")]
    MissingCallbacks(&'static str),

    #[error("Request cancelled: {0}")]
    Cancelled(String),
}

/// Events emitted by an agent loop during a turn
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The user prompt as the agent recorded it
    UserMessage {
        message_id: Option<String>,
        content: String,
    },

    /// Assistant text
    Assistant {
        message_id: Option<String>,
        content: String,
    },

    /// Tool invocation
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },

    /// Tool completion; `error` wins over `result` when both are set
    ToolResult {
        tool_call_id: String,
        result: Option<Value>,
        error: Option<String>,
    },

    /// Anything the bridge has no mapping for (reasoning deltas, usage, ...)
    Other { kind: String },
}

impl AgentEvent {
    pub fn kind(&self) -> &str {
        match self {
            AgentEvent::UserMessage { .. } => "user_message",
            AgentEvent::Assistant { .. } => "assistant",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Other { kind } => kind,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            AgentEvent::UserMessage { message_id, .. } | AgentEvent::Assistant { message_id, .. } => {
                message_id.as_deref()
            }
            _ => None,
        }
    }
}

/// Message role as reported to a [`MessageObserver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// A message appended to the agent's conversation history
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedMessage {
    pub message_id: Option<String>,
    pub role: MessageRole,
    pub content: Option<String>,
}

/// Outcome of an approval callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalReply {
    pub approved: bool,
    pub feedback: Option<String>,
}

impl ApprovalReply {
    pub fn approve(feedback: Option<String>) -> Self {
        Self {
            approved: true,
            feedback,
        }
    }

    pub fn reject(feedback: Option<String>) -> Self {
        Self {
            approved: false,
            feedback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
}

/// A multi-question request for user input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInputRequest {
    #[serde(default)]
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub question: String,
    pub answer: String,
    pub is_other: bool,
}

/// Reply to a [`UserInputRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserInputReply {
    /// Per-question answers, for runtimes with a structured answer type
    Answers {
        answers: Vec<Answer>,
        cancelled: bool,
    },
    /// Free text, for runtimes without one
    Plain { response: String },
}

/// Hooks an agent loop suspends on. Registered once per loop.
#[async_trait]
pub trait AgentCallbacks: Send + Sync {
    /// Ask whether `tool_name` may run. Approved edits are applied to `args`
    /// in place before returning.
    async fn approve_tool(
        &self,
        tool_name: &str,
        args: &mut dyn ToolArgs,
        tool_call_id: &str,
    ) -> Result<ApprovalReply, ConnectorError>;

    async fn ask_user(&self, request: &UserInputRequest)
        -> Result<UserInputReply, ConnectorError>;
}

/// Sees every message the agent appends to its history.
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, message: &ObservedMessage);
}

/// One agent conversation.
pub trait AgentLoop: Send + Sync {
    fn set_callbacks(&self, callbacks: Arc<dyn AgentCallbacks>);

    /// Install `observer`, returning the one it replaces.
    fn set_message_observer(
        &self,
        observer: Arc<dyn MessageObserver>,
    ) -> Option<Arc<dyn MessageObserver>>;

    /// Run one turn for `prompt`. The stream ends when the turn completes.
    fn act<'a>(&'a self, prompt: &'a str) -> BoxStream<'a, Result<AgentEvent, ConnectorError>>;
}

/// Factory for agent loops.
pub trait AgentRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn create_loop(&self) -> Result<Arc<dyn AgentLoop>, ConnectorError>;

    /// Whether loops accept [`UserInputReply::Answers`].
    fn supports_structured_answers(&self) -> bool {
        true
    }
}

/// Runtime used when no agent is configured; every construction fails.
#[derive(Debug, Clone)]
pub struct UnavailableRuntime {
    reason: String,
}

impl UnavailableRuntime {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl AgentRuntime for UnavailableRuntime {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn create_loop(&self) -> Result<Arc<dyn AgentLoop>, ConnectorError> {
        Err(ConnectorError::RuntimeUnavailable(self.reason.clone()))
    }

    fn supports_structured_answers(&self) -> bool {
        false
    }
}
