use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::term::SessionEvent;

use super::{auth::token_matches, error_response, resolve_workspace_id, AppState};

pub fn routes() -> Router<AppState> {
    Router::new().route("/workspaces/{id}/terminal", get(terminal_upgrade))
}

/// Query parameters for the WebSocket upgrade (authentication).
#[derive(Deserialize)]
struct TerminalQuery {
    token: Option<String>,
}

/// Control messages the client may send as text frames. Everything else the
/// client sends must be binary frames of raw terminal bytes.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientControl {
    Resize { cols: u16, rows: u16 },
}

/// WebSocket upgrade handler with token authentication.
///
/// Browsers cannot set an Authorization header on a WebSocket upgrade, so
/// when `admin_token` is configured the client must pass `?token=<admin_token>`.
async fn terminal_upgrade(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let admin_token = &state.config.server.admin_token;
    if !admin_token.is_empty() {
        let provided = query.token.as_deref().unwrap_or("");
        if !token_matches(provided, admin_token) {
            return error_response(
                axum::http::StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "invalid or missing terminal auth token",
            );
        }
    }

    let workspace_id = match resolve_workspace_id(&state.orchestrator, &id).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    ws.on_upgrade(move |socket| run_bridge(socket, state, workspace_id))
}

fn control_frame(kind: &str, fields: serde_json::Value) -> Message {
    let mut obj = serde_json::json!({ "type": kind });
    if let (Some(map), Some(extra)) = (obj.as_object_mut(), fields.as_object()) {
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
    }
    Message::Text(obj.to_string().into())
}

/// The long-lived relay loop for one terminal connection.
///
/// Binary frames pass through unmodified in both directions; text frames
/// carry control messages. Both relay directions are multiplexed in one
/// select loop, and every hop is a bounded buffered channel, so input and
/// output proceed without head-of-line blocking while a stalled socket
/// backpressures the PTY instead of buffering without limit.
async fn run_bridge(mut socket: WebSocket, state: AppState, workspace_id: Uuid) {
    let mut sub = match state.sessions.acquire(workspace_id).await {
        Ok(sub) => sub,
        Err(e) => {
            let code = match &e {
                Error::Precondition(_) => "WORKSPACE_NOT_RUNNING",
                Error::NotFound(_) => "NOT_FOUND",
                _ => "TERMINAL_ATTACH_FAILED",
            };
            warn!(workspace_id = %workspace_id, error = %e, "terminal attach rejected");
            let _ = socket
                .send(control_frame(
                    "error",
                    serde_json::json!({ "code": code, "message": e.to_string() }),
                ))
                .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    debug!(workspace_id = %workspace_id, token = sub.token, "terminal bridge open");

    loop {
        tokio::select! {
            event = sub.events.recv() => match event {
                Some(SessionEvent::Output(chunk)) => {
                    if socket.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                Some(SessionEvent::Ended(reason)) => {
                    let _ = socket
                        .send(control_frame(
                            "session_ended",
                            serde_json::json!({ "reason": reason.as_str() }),
                        ))
                        .await;
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            },

            message = socket.recv() => match message {
                Some(Ok(Message::Binary(data))) => {
                    if sub.input.send(Bytes::from(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientControl>(&text) {
                        Ok(ClientControl::Resize { cols, rows }) => {
                            if let Err(e) =
                                state.sessions.resize(workspace_id, cols, rows).await
                            {
                                debug!(
                                    workspace_id = %workspace_id,
                                    error = %e,
                                    "resize ignored"
                                );
                            }
                        }
                        Err(e) => {
                            debug!(workspace_id = %workspace_id, error = %e, "bad control frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                // Ping/pong are handled by axum.
                Some(Ok(_)) => {}
            }
        }
    }

    state.sessions.release(workspace_id, sub.token).await;
    debug!(workspace_id = %workspace_id, token = sub.token, "terminal bridge closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resize_control() {
        let msg: ClientControl =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        let ClientControl::Resize { cols, rows } = msg;
        assert_eq!((cols, rows), (120, 40));
    }

    #[test]
    fn unknown_control_rejected() {
        assert!(serde_json::from_str::<ClientControl>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn control_frame_merges_fields() {
        let frame = control_frame("session_ended", serde_json::json!({"reason": "shell_exited"}));
        let Message::Text(text) = frame else { panic!("expected text frame") };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "session_ended");
        assert_eq!(value["reason"], "shell_exited");
    }
}
