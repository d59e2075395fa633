//! HTTP API handlers
//!
//! Errors render as `{"detail": "..."}` with the matching status code.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use vibecheck_protocol::{
    client::{ApproveRequest, InputResponseRequest, MessageRequest},
    FleetStatus, SessionDetail, SessionSummary, StatePayload, StatusResponse,
};

use crate::bridge::{BridgeError, SessionBridge};
use crate::state::AppState;

const MESSAGE_NOT_FORWARDED: &str =
    "Agent runtime unavailable; message was not forwarded to the agent loop";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    InvalidBody(#[from] JsonRejection),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidBody(rejection) => rejection.status(),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::UnknownSession(_) => Self::NotFound(err.to_string()),
            BridgeError::RuntimeUnavailable(_)
            | BridgeError::NotControllable(_)
            | BridgeError::Stopped(_) => {
                Self::ServiceUnavailable(MESSAGE_NOT_FORWARDED.to_string())
            }
            BridgeError::RequestCancelled(_) => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(
                component = "api",
                event = "api.error",
                status = status.as_u16(),
                error = %self,
                "Request failed"
            );
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Known sessions (live or on disk) get a bridge; anything else is a 404.
fn session_or_404(state: &AppState, session_id: &str) -> ApiResult<Arc<SessionBridge>> {
    if !state.sessions.has_known_session(session_id) {
        return Err(BridgeError::UnknownSession(session_id.to_string()).into());
    }
    Ok(state.sessions.attach(session_id, None))
}

pub async fn root(State(state): State<AppState>) -> Response {
    if let Some(dir) = &state.static_dir {
        if let Ok(index) = tokio::fs::read_to_string(dir.join("index.html")).await {
            return Html(index).into_response();
        }
    }
    Json(json!({ "name": "vibecheck", "status": "ok" })).into_response()
}

pub async fn health() -> Json<StatusResponse> {
    Json(StatusResponse::new("ok"))
}

pub async fn fleet_state(State(state): State<AppState>) -> Json<FleetStatus> {
    Json(state.sessions.fleet_status())
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}

pub async fn session_detail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionDetail>> {
    Ok(Json(state.sessions.session_detail(&session_id)?))
}

pub async fn session_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatePayload>> {
    let bridge = session_or_404(&state, &session_id)?;
    Ok(Json(bridge.state_payload()))
}

pub async fn approve(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<ApproveRequest>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let bridge = session_or_404(&state, &session_id)?;
    let Json(body) = body?;
    if !bridge.resolve_approval(&body.call_id, body.approved, body.edited_args) {
        return Err(ApiError::NotFound(format!(
            "No pending approval for call_id={}",
            body.call_id
        )));
    }
    info!(
        component = "api",
        event = "api.approval.resolved",
        session_id = %session_id,
        call_id = %body.call_id,
        approved = body.approved,
        "Approval resolved over HTTP"
    );
    Ok(Json(StatusResponse::new("ok")))
}

pub async fn input_response(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<InputResponseRequest>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let bridge = session_or_404(&state, &session_id)?;
    let Json(body) = body?;
    if !bridge.resolve_input(&body.request_id, &body.response) {
        return Err(ApiError::NotFound(format!(
            "No pending input for request_id={}",
            body.request_id
        )));
    }
    Ok(Json(StatusResponse::new("ok")))
}

pub async fn message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<MessageRequest>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let bridge = session_or_404(&state, &session_id)?;
    let Json(body) = body?;
    if !bridge.inject_message(&body.content) {
        return Err(ApiError::ServiceUnavailable(
            MESSAGE_NOT_FORWARDED.to_string(),
        ));
    }
    Ok(Json(StatusResponse::new("queued")))
}

/// Fallback so unknown `/api` routes still answer with a JSON body.
pub async fn not_found() -> ApiError {
    ApiError::NotFound("Not Found".to_string())
}
