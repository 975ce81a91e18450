pub mod auth;
pub mod terminal;
pub mod workspaces;

use std::sync::Arc;

use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::error::Error;
use crate::term::PtySessionManager;
use crate::workspace::Orchestrator;

/// Shared state for all API handlers, passed via axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub sessions: Arc<PtySessionManager>,
    pub config: Arc<Config>,
}

/// Response envelope for successful API responses.
#[derive(serde::Serialize)]
pub struct ApiResponse<T: serde::Serialize> {
    pub data: T,
    pub meta: ApiMeta,
}

/// Response envelope for error API responses.
#[derive(serde::Serialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
    pub meta: ApiMeta,
}

#[derive(serde::Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(serde::Serialize)]
pub struct ApiMeta {
    pub request_id: String,
}

impl ApiMeta {
    pub fn new() -> Self {
        Self { request_id: uuid::Uuid::new_v4().to_string() }
    }
}

impl Default for ApiMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data, meta: ApiMeta::new() }
    }
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail { code: code.into(), message: message.into() },
            meta: ApiMeta::new(),
        }
    }
}

/// Helper to convert an ApiError into an axum JSON response.
pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    use axum::response::IntoResponse;
    let body = ApiError::new(code, message);
    (status, axum::Json(body)).into_response()
}

/// Helper to convert a successful payload into an ApiResponse JSON.
pub fn ok_response<T: serde::Serialize>(data: T) -> Response {
    use axum::response::IntoResponse;
    let body = ApiResponse::new(data);
    (StatusCode::OK, axum::Json(body)).into_response()
}

/// Map a core error onto an HTTP error response.
pub fn core_error_response(err: Error) -> Response {
    match err {
        Error::Validation(msg) => error_response(StatusCode::BAD_REQUEST, "VALIDATION", msg),
        Error::Precondition(msg) => error_response(StatusCode::CONFLICT, "PRECONDITION", msg),
        Error::NotFound(id) => error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("workspace not found: {}", id),
        ),
        Error::Runtime(e) => error_response(StatusCode::BAD_GATEWAY, "RUNTIME", e.to_string()),
        Error::Store(e) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string())
        }
    }
}

/// Resolve a workspace id from a name-or-UUID path segment.
pub async fn resolve_workspace_id(
    orchestrator: &Orchestrator,
    id_or_name: &str,
) -> Result<uuid::Uuid, Response> {
    if let Ok(uuid) = uuid::Uuid::parse_str(id_or_name) {
        return Ok(uuid);
    }
    match orchestrator.find_by_name(id_or_name).await {
        Some(uuid) => Ok(uuid),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "workspace not found",
        )),
    }
}

/// Middleware that adds security headers to all responses.
async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let h = response.headers_mut();
    h.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    h.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    h.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

/// Build the full axum Router for the daemon.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(workspaces::routes())
        .merge(terminal::routes());

    let api = api
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware))
        .with_state(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::exact(
            HeaderValue::from_str(&format!(
                "http://{}:{}",
                state.config.server.bind_addr, state.config.server.port
            ))
            .unwrap_or_else(|_| HeaderValue::from_static("http://localhost:7171")),
        ))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .nest("/api", api)
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .layer(cors)
        .layer(middleware::from_fn(security_headers))
}

/// Run the HTTP server until ctrl-c, then tear down terminal sessions.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    if state.config.server.bind_addr != "127.0.0.1"
        && state.config.server.bind_addr != "::1"
        && state.config.server.admin_token.is_empty()
    {
        tracing::warn!(
            "server bound to {} with no admin_token set; anyone on the network has full access",
            state.config.server.bind_addr
        );
    }

    let addr = format!("{}:{}", state.config.server.bind_addr, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "server listening");

    let sessions = state.sessions.clone();
    let router = build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    sessions.shutdown_all().await;
    info!("terminal sessions torn down, exiting");
    Ok(())
}
