//! Connection manager
//!
//! Tracks which sockets are subscribed to which session's room and fans
//! events out to them. A socket is represented by the sending half of its
//! writer task's channel; a failed or timed-out send marks it dead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vibecheck_protocol::Event;

use crate::auth::credential_matches;

pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_UNKNOWN_SESSION: u16 = 4404;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type ConnectionId = u64;

/// Frames queued for a socket's writer task.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Text(Utf8Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

/// Handle to one connected socket.
#[derive(Debug, Clone)]
pub struct ClientSocket {
    id: ConnectionId,
    tx: mpsc::Sender<OutboundMessage>,
}

impl ClientSocket {
    /// A new handle plus the receiver its writer task drains.
    pub fn channel() -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let socket = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (socket, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, message: OutboundMessage) -> bool {
        self.tx.send_timeout(message, SEND_TIMEOUT).await.is_ok()
    }

    pub async fn pong(&self, payload: Bytes) -> bool {
        self.send(OutboundMessage::Pong(payload)).await
    }

    /// Queue a close frame without waiting.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.try_send(OutboundMessage::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[derive(Default)]
struct Rooms {
    rooms: HashMap<String, Vec<ClientSocket>>,
    socket_to_session: HashMap<ConnectionId, String>,
}

pub struct ConnectionManager {
    expected_psk: String,
    rooms: Mutex<Rooms>,
}

impl ConnectionManager {
    pub fn new(expected_psk: impl Into<String>) -> Self {
        Self {
            expected_psk: expected_psk.into(),
            rooms: Mutex::new(Rooms::default()),
        }
    }

    pub fn is_authorized(&self, credential: Option<&str>) -> bool {
        credential.is_some_and(|c| credential_matches(c, &self.expected_psk))
    }

    /// Admit `socket` into `session_id`'s room. A bad credential closes the
    /// socket with 4401 and admits nothing.
    pub fn connect(&self, socket: &ClientSocket, session_id: &str, credential: Option<&str>) -> bool {
        if !self.is_authorized(credential) {
            warn!(
                component = "connections",
                event = "connections.unauthorized",
                session_id = %session_id,
                connection_id = socket.id,
                "Rejecting socket with bad credential"
            );
            socket.close(CLOSE_UNAUTHORIZED, "Unauthorized");
            return false;
        }

        let mut rooms = self.lock();
        if let Some(previous) = rooms.socket_to_session.remove(&socket.id) {
            remove_from_room(&mut rooms, &previous, socket.id);
        }
        rooms
            .rooms
            .entry(session_id.to_string())
            .or_default()
            .push(socket.clone());
        rooms
            .socket_to_session
            .insert(socket.id, session_id.to_string());

        info!(
            component = "connections",
            event = "connections.connected",
            session_id = %session_id,
            connection_id = socket.id,
            "Socket joined session room"
        );
        true
    }

    /// Remove a socket from its room, dropping the room once empty.
    pub fn disconnect(&self, socket_id: ConnectionId) {
        let mut rooms = self.lock();
        let Some(session_id) = rooms.socket_to_session.remove(&socket_id) else {
            return;
        };
        remove_from_room(&mut rooms, &session_id, socket_id);
        debug!(
            component = "connections",
            event = "connections.disconnected",
            session_id = %session_id,
            connection_id = socket_id,
            "Socket left session room"
        );
    }

    /// Deliver `event` to every socket in `session_id`'s room. Returns the
    /// number of sockets that accepted it; the rest are disconnected.
    pub async fn broadcast(&self, session_id: &str, event: &Event) -> usize {
        let members = {
            let rooms = self.lock();
            rooms.rooms.get(session_id).cloned().unwrap_or_default()
        };
        self.deliver(members, event).await
    }

    /// Deliver `event` to every connected socket regardless of room.
    #[allow(dead_code)]
    pub async fn broadcast_all(&self, event: &Event) -> usize {
        let members: Vec<ClientSocket> = {
            let rooms = self.lock();
            rooms.rooms.values().flatten().cloned().collect()
        };
        self.deliver(members, event).await
    }

    /// Send one event to one socket.
    pub async fn send_personal(&self, socket: &ClientSocket, event: &Event) -> bool {
        match encode(event) {
            Some(text) => socket.send(OutboundMessage::Text(text)).await,
            None => false,
        }
    }

    pub fn total_clients(&self) -> usize {
        self.lock().socket_to_session.len()
    }

    pub fn session_clients(&self, session_id: &str) -> usize {
        self.lock().rooms.get(session_id).map_or(0, Vec::len)
    }

    async fn deliver(&self, members: Vec<ClientSocket>, event: &Event) -> usize {
        if members.is_empty() {
            return 0;
        }
        let Some(text) = encode(event) else {
            return 0;
        };

        let results = join_all(members.iter().map(|socket| {
            let text = text.clone();
            async move { (socket.id, socket.send(OutboundMessage::Text(text)).await) }
        }))
        .await;

        let mut delivered = 0;
        for (socket_id, ok) in results {
            if ok {
                delivered += 1;
            } else {
                debug!(
                    component = "connections",
                    event = "connections.send_failed",
                    connection_id = socket_id,
                    "Dropping dead socket"
                );
                self.disconnect(socket_id);
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn remove_from_room(rooms: &mut Rooms, session_id: &str, socket_id: ConnectionId) {
    if let Some(members) = rooms.rooms.get_mut(session_id) {
        members.retain(|socket| socket.id != socket_id);
        if members.is_empty() {
            rooms.rooms.remove(session_id);
        }
    }
}

fn encode(event: &Event) -> Option<Utf8Bytes> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            warn!(
                component = "connections",
                event = "connections.serialize_failed",
                error = %e,
                "Failed to serialize event"
            );
            None
        }
    }
}
