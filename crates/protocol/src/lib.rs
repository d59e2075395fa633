//! vibecheck Protocol
//!
//! Shared types for communication between the vibecheck server and its
//! web/mobile clients. Events are serialized as JSON over WebSocket; the
//! remaining types are the HTTP request and response bodies.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod events;
pub mod types;

pub use client::{ApproveRequest, InputResponseRequest, MessageRequest};
pub use events::{Event, EventKind};
pub use types::*;

/// Generate a short random event id (8 lowercase hex characters).
pub fn new_event_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
