use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use super::{error_response, AppState};

/// Constant-time string comparison to avoid leaking token length or prefix
/// through response timing.
pub fn token_matches(provided: &str, expected: &str) -> bool {
    provided.len() == expected.len()
        && provided
            .as_bytes()
            .iter()
            .zip(expected.as_bytes().iter())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Require `Authorization: Bearer <admin_token>` on every API request when a
/// token is configured. WebSocket upgrades cannot set headers from a browser,
/// so the terminal route additionally accepts a `token` query parameter
/// (checked in the upgrade handler).
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let admin_token = &state.config.server.admin_token;
    if admin_token.is_empty() {
        return next.run(request).await;
    }

    // The WebSocket route authenticates via query parameter in its own
    // handler; let the upgrade request through.
    if request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if token_matches(provided, admin_token) {
        next.run(request).await
    } else {
        error_response(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "invalid or missing bearer token",
        )
    }
}
