//! Agent event → wire event conversion
//!
//! Both the turn stream and the message observer report user and assistant
//! messages. They share one `seen` set so each message id is published once.

use std::collections::HashSet;

use serde_json::{Map, Value};
use vibecheck_connectors::{AgentEvent, MessageRole, ObservedMessage};
use vibecheck_protocol::EventKind;

/// Convert one turn event. Returns `None` for unmapped kinds and for
/// messages already published.
pub fn translate(event: AgentEvent, seen: &mut HashSet<String>) -> Option<EventKind> {
    match event {
        AgentEvent::UserMessage {
            message_id,
            content,
        } => first_sighting(message_id.as_deref(), seen).then_some(EventKind::UserMessage { content }),
        AgentEvent::Assistant {
            message_id,
            content,
        } => first_sighting(message_id.as_deref(), seen).then_some(EventKind::Assistant { content }),
        AgentEvent::ToolCall {
            tool_call_id,
            tool_name,
            args,
        } => Some(EventKind::ToolCall {
            tool_name,
            args: args_to_map(args),
            call_id: tool_call_id,
        }),
        AgentEvent::ToolResult {
            tool_call_id,
            result,
            error,
        } => Some(match error.filter(|e| !e.is_empty()) {
            Some(error) => EventKind::ToolResult {
                call_id: tool_call_id,
                output: error,
                is_error: true,
            },
            None => EventKind::ToolResult {
                call_id: tool_call_id,
                output: result_text(result),
                is_error: false,
            },
        }),
        AgentEvent::Other { .. } => None,
    }
}

/// Convert a message seen by the observer hook. Only non-empty user and
/// assistant messages are published.
pub fn translate_observed(
    message: &ObservedMessage,
    seen: &mut HashSet<String>,
) -> Option<EventKind> {
    if !first_sighting(message.message_id.as_deref(), seen) {
        return None;
    }
    let content = message.content.as_deref().filter(|c| !c.is_empty())?;
    match message.role {
        MessageRole::Assistant => Some(EventKind::Assistant {
            content: content.to_string(),
        }),
        MessageRole::User => Some(EventKind::UserMessage {
            content: content.to_string(),
        }),
        MessageRole::System | MessageRole::Tool => None,
    }
}

/// Plain key/value form of tool arguments for transport.
pub fn args_to_map(args: Value) -> Map<String, Value> {
    match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            let text = match other {
                Value::String(s) => s,
                other => other.to_string(),
            };
            map.insert("value".into(), Value::String(text));
            map
        }
    }
}

fn result_text(result: Option<Value>) -> String {
    match result {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    }
}

fn first_sighting(message_id: Option<&str>, seen: &mut HashSet<String>) -> bool {
    match message_id {
        Some(id) => seen.insert(id.to_string()),
        None => true,
    }
}
