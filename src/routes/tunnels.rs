//! REST endpoints for TCP tunnel management.
//!
//! - `POST   /api/sessions/{id}/tunnels` — open a tunnel
//! - `GET    /api/sessions/{id}/tunnels` — list a session's tunnels
//! - `DELETE /api/tunnels/{id}`          — close a tunnel

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::relay::Role;
use crate::AppState;

#[derive(Deserialize)]
pub struct OpenTunnelRequest {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// `POST /api/sessions/{id}/tunnels` — open a tunnel in `connecting`.
///
/// The host endpoint is asked to perform the remote bind over the `tunnel`
/// channel; its `open_result` message drives `connecting → active|error`.
pub async fn open_tunnel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<OpenTunnelRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.remote_host.is_empty() {
        return Err(ApiError::Validation("remote_host must not be empty".into()));
    }
    if req.local_port == 0 || req.remote_port == 0 {
        return Err(ApiError::Validation("ports must be non-zero".into()));
    }

    let session = state
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| ApiError::NotFound {
            kind: "session",
            id: session_id.clone(),
        })?;
    if session.state.is_terminal() {
        return Err(ApiError::SessionClosed);
    }

    let profile = state
        .profiles
        .get(&session.profile_id)
        .await
        .ok_or_else(|| ApiError::NotFound {
            kind: "profile",
            id: session.profile_id.clone(),
        })?;

    let tunnel = state
        .tunnels
        .open(
            &session_id,
            &profile,
            req.local_port,
            &req.remote_host,
            req.remote_port,
        )
        .await?;

    // Ask the host side to establish the remote bind.
    let _ = state
        .relay
        .send_control(
            &session_id,
            Role::Host,
            &json!({
                "type": "tunnel.open",
                "tunnelId": tunnel.id,
                "localPort": tunnel.local_port,
                "remoteHost": tunnel.remote_host,
                "remotePort": tunnel.remote_port,
            }),
        )
        .await;

    Ok(Json(json!({
        "tunnel_id": tunnel.id,
        "state": tunnel.state,
    })))
}

/// `GET /api/sessions/{id}/tunnels` — list a session's tunnels.
pub async fn list_tunnels(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.sessions.get(&session_id).await.is_none() {
        return Err(ApiError::NotFound {
            kind: "session",
            id: session_id,
        });
    }
    let tunnels = state.tunnels.list_session(&session_id).await;
    Ok(Json(json!({ "tunnels": tunnels })))
}

/// `DELETE /api/tunnels/{id}` — close a tunnel and release its local port.
pub async fn close_tunnel(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tunnel = state.tunnels.close(&tunnel_id).await?;

    let payload = json!({"type": "tunnel.closed", "tunnelId": tunnel.id, "reason": "closed"});
    for role in [Role::Host, Role::Client] {
        let _ = state.relay.send_control(&tunnel.session_id, role, &payload).await;
    }

    Ok(Json(json!({
        "ok": true,
        "tunnel_id": tunnel.id,
        "state": tunnel.state,
    })))
}
