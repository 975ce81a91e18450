use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::registry::{Workspace, WorkspaceState};
use crate::workspace::CreateParams;

use super::{core_error_response, ok_response, resolve_workspace_id, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workspaces", get(list_workspaces))
        .route("/workspaces", post(create_workspace))
        .route("/workspaces/{id}", get(get_workspace))
        .route("/workspaces/{id}", delete(delete_workspace))
        .route("/workspaces/{id}/start", post(start_workspace))
        .route("/workspaces/{id}/stop", post(stop_workspace))
        .route("/workspaces/{id}/retry", post(retry_workspace))
}

// ---------------------------------------------------------------------------
// Serializable workspace info for API responses
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WorkspaceInfo {
    id: String,
    name: String,
    description: String,
    image: String,
    state: String,
    container_ref: Option<String>,
    created_at: String,
    updated_at: String,
    last_error: Option<String>,
    terminal_subscribers: usize,
}

impl WorkspaceInfo {
    fn new(ws: &Workspace, terminal_subscribers: usize) -> Self {
        Self {
            id: ws.id.to_string(),
            name: ws.name.clone(),
            description: ws.description.clone(),
            image: ws.image.clone(),
            state: ws.state.to_string(),
            container_ref: ws.container_ref.as_ref().map(|c| c.0.clone()),
            created_at: ws.created_at.to_rfc3339(),
            updated_at: ws.updated_at.to_rfc3339(),
            last_error: ws.last_error.clone(),
            terminal_subscribers,
        }
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListQuery {
    state_filter: Option<String>,
}

#[derive(Deserialize)]
struct CreateRequest {
    name: Option<String>,
    description: Option<String>,
    image: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_workspaces(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let workspaces = state.orchestrator.list().await;

    let state_filter = query.state_filter.as_deref().and_then(|s| match s {
        "creating" => Some(WorkspaceState::Creating),
        "stopped" => Some(WorkspaceState::Stopped),
        "starting" => Some(WorkspaceState::Starting),
        "running" => Some(WorkspaceState::Running),
        "stopping" => Some(WorkspaceState::Stopping),
        "deleting" => Some(WorkspaceState::Deleting),
        "error" => Some(WorkspaceState::Error),
        _ => None,
    });

    let mut infos = Vec::new();
    for ws in workspaces
        .iter()
        .filter(|ws| state_filter.is_none_or(|sf| ws.state == sf))
    {
        let subs = state.sessions.subscriber_count(ws.id).await;
        infos.push(WorkspaceInfo::new(ws, subs));
    }
    ok_response(infos)
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Response {
    let params = CreateParams {
        name: req.name,
        description: req.description,
        image: req.image,
    };
    match state.orchestrator.create(params).await {
        Ok(ws) => ok_response(WorkspaceInfo::new(&ws, 0)),
        Err(e) => core_error_response(e),
    }
}

async fn get_workspace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match resolve_workspace_id(&state.orchestrator, &id).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.orchestrator.get(id).await {
        Ok(ws) => {
            let subs = state.sessions.subscriber_count(id).await;
            ok_response(WorkspaceInfo::new(&ws, subs))
        }
        Err(e) => core_error_response(e),
    }
}

async fn start_workspace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match resolve_workspace_id(&state.orchestrator, &id).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.orchestrator.start(id).await {
        Ok(ws) => ok_response(WorkspaceInfo::new(&ws, 0)),
        Err(e) => core_error_response(e),
    }
}

async fn stop_workspace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match resolve_workspace_id(&state.orchestrator, &id).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.orchestrator.stop(id).await {
        Ok(ws) => ok_response(WorkspaceInfo::new(&ws, 0)),
        Err(e) => core_error_response(e),
    }
}

async fn retry_workspace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match resolve_workspace_id(&state.orchestrator, &id).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.orchestrator.retry(id).await {
        Ok(ws) => ok_response(WorkspaceInfo::new(&ws, 0)),
        Err(e) => core_error_response(e),
    }
}

async fn delete_workspace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match resolve_workspace_id(&state.orchestrator, &id).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.orchestrator.delete(id).await {
        Ok(ws) => ok_response(WorkspaceInfo::new(&ws, 0)),
        Err(e) => core_error_response(e),
    }
}
