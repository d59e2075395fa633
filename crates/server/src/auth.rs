//! Shared-secret (PSK) middleware.
//!
//! Every request outside the exempt paths must carry the PSK in the `X-PSK`
//! header or the `psk` query parameter. The socket endpoint under `/ws/`
//! checks the credential itself so it can close with 4401 after upgrading.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Query, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::api::ApiError;

pub const PSK_HEADER: &str = "x-psk";
pub const PSK_QUERY_PARAM: &str = "psk";

const EXEMPT_PATHS: &[&str] = &["/", "/api/health", "/manifest.json", "/sw.js", "/favicon.ico"];
const EXEMPT_PREFIXES: &[&str] = &["/static/", "/assets/", "/icons/", "/ws/"];

pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path) || EXEMPT_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Compare without short-circuiting on the first differing byte.
pub fn credential_matches(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    let mut diff = provided.len() ^ expected.len();
    for (i, byte) in expected.iter().enumerate() {
        let other = provided.get(i).copied().unwrap_or(!byte);
        diff |= usize::from(byte ^ other);
    }
    diff == 0
}

/// Pull the credential from the header, falling back to the query string.
pub fn credential_from_request<B>(req: &Request<B>) -> Option<String> {
    if let Some(value) = req.headers().get(PSK_HEADER) {
        if let Ok(value) = value.to_str() {
            return Some(value.to_string());
        }
    }
    let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(req.uri()).ok()?;
    params.remove(PSK_QUERY_PARAM)
}

pub async fn psk_middleware(
    State(expected_psk): State<String>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if is_exempt(&path) {
        return next.run(req).await;
    }

    match credential_from_request(&req) {
        Some(credential) if credential_matches(&credential, &expected_psk) => next.run(req).await,
        _ => {
            debug!(
                component = "auth",
                event = "auth.rejected",
                path = %path,
                "Rejecting request without valid PSK"
            );
            ApiError::Unauthorized.into_response()
        }
    }
}
