//! WebSocket event stream
//!
//! `GET /ws/events/{session_id}?psk=...` streams one session's events. The
//! credential is checked after the upgrade so a bad one can be reported
//! with close code 4401; unknown sessions close with 4404.

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};
use vibecheck_protocol::Event;

use crate::auth::PSK_HEADER;
use crate::connections::{
    ClientSocket, ConnectionManager, OutboundMessage, CLOSE_UNAUTHORIZED, CLOSE_UNKNOWN_SESSION,
};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    psk: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let credential = params.psk.or_else(|| {
        headers
            .get(PSK_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, credential))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    credential: Option<String>,
) {
    let (client, mut outbound_rx) = ClientSocket::channel();
    let conn_id = client.id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let (frame, closing) = match message {
                OutboundMessage::Text(text) => (Message::Text(text), false),
                OutboundMessage::Pong(data) => (Message::Pong(data), false),
                OutboundMessage::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            if ws_tx.send(frame).await.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
            if closing {
                break;
            }
        }
    });

    if !state.connections.is_authorized(credential.as_deref()) {
        warn!(
            component = "websocket",
            event = "ws.connection.unauthorized",
            session_id = %session_id,
            connection_id = conn_id,
            "Closing socket with bad credential"
        );
        reject(client, send_task, CLOSE_UNAUTHORIZED, "Unauthorized").await;
        return;
    }

    if !state.sessions.has_known_session(&session_id) {
        info!(
            component = "websocket",
            event = "ws.connection.unknown_session",
            session_id = %session_id,
            connection_id = conn_id,
            "Closing socket for unknown session"
        );
        reject(client, send_task, CLOSE_UNKNOWN_SESSION, "Unknown session").await;
        return;
    }

    let bridge = state.sessions.attach(&session_id, None);
    if !bridge.admit(client.clone(), credential).await {
        drop(client);
        let _ = send_task.await;
        return;
    }

    info!(
        component = "websocket",
        event = "ws.connection.opened",
        session_id = %session_id,
        connection_id = conn_id,
        room_size = state.connections.session_clients(&session_id),
        "WebSocket connection opened"
    );

    let heartbeat = spawn_heartbeat(
        state.connections.clone(),
        client.clone(),
        state.heartbeat_interval,
    );

    // Client frames are not part of the protocol; the loop only answers
    // pings and notices the disconnect.
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Ping(data)) => {
                client.pong(data).await;
            }
            Ok(Message::Close(_)) => {
                debug!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    session_id = %session_id,
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    session_id = %session_id,
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    heartbeat.abort();
    state.connections.disconnect(conn_id);
    send_task.abort();
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        session_id = %session_id,
        connection_id = conn_id,
        "WebSocket connection closed"
    );
}

/// Send a close frame and wait for the writer to flush it.
async fn reject(client: ClientSocket, send_task: JoinHandle<()>, code: u16, reason: &str) {
    client.close(code, reason);
    drop(client);
    let _ = send_task.await;
}

fn spawn_heartbeat(
    connections: std::sync::Arc<ConnectionManager>,
    client: ClientSocket,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if !connections.send_personal(&client, &Event::heartbeat()).await {
                break;
            }
        }
    })
}
