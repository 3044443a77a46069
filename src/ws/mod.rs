//! WebSocket transport for the in-session signaling relay.
//!
//! ## Connection lifecycle
//!
//! 1. An endpoint connects to `GET /api/sessions/{id}/relay?token=<api_key>&role=host|client`
//!    — the token is validated before the upgrade completes.
//! 2. Frames are JSON objects `{"channel": ..., "payload": ...}`. The server
//!    stamps `senderRole` and `ts` on delivery to the opposite endpoint;
//!    `control` frames additionally carry `seq` for acknowledgement.
//! 3. On disconnect the endpoint detaches and the session is parked in
//!    `suspended`; reconnecting resumes it.
//!
//! ## Channel handling (client → server)
//!
//! | Channel      | Server behavior                                              |
//! |--------------|--------------------------------------------------------------|
//! | `chat`       | relayed best-effort                                          |
//! | `clipboard`  | capability-gated, relayed best-effort                        |
//! | `whiteboard` | capability-gated, relayed best-effort                        |
//! | `file`       | capability-gated; transfer lifecycle tracked, then relayed   |
//! | `tunnel`     | capability-gated; `open_result` drives broker state          |
//! | `control`    | `ping` answered, `ack` consumes a pending frame, the rest is |
//! |              | queued to the peer and retried until acknowledged            |
//!
//! Server-originated replies (pong, errors) are `control` frames without a
//! `senderRole`.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::relay::{Channel, RelayError, RelayMessage, Role};
use crate::state::RelayEventType;
use crate::transfers::TransferOffer;
use crate::AppState;

/// Query parameters for the relay upgrade request.
#[derive(Deserialize)]
pub struct RelayQuery {
    /// API key passed as a query parameter (since HTTP headers aren't
    /// available during a browser WebSocket upgrade).
    pub token: String,
    /// Which side of the session this endpoint is.
    pub role: Role,
}

/// `GET /api/sessions/{id}/relay?token=<key>&role=<host|client>` — WebSocket
/// upgrade handler.
///
/// Validates the token and session before upgrading. Returns `403` on auth
/// failure, `404` for unknown sessions, and `410` for closed ones.
pub async fn relay_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<RelayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::constant_time_eq(state.config.auth.api_key.as_bytes(), query.token.as_bytes())
    {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let Some(session) = state.sessions.get(&session_id).await else {
        return (StatusCode::NOT_FOUND, "Unknown session").into_response();
    };
    if session.state.is_terminal() {
        return (StatusCode::GONE, "Session closed").into_response();
    }

    let role = query.role;
    let profile_id = session.profile_id.clone();
    ws.on_upgrade(move |socket| handle_relay(socket, state, session_id, profile_id, role))
}

/// Build a server-originated control frame (pong, error).
fn server_frame(payload: Value) -> Value {
    json!({
        "channel": "control",
        "payload": payload,
        "ts": chrono::Utc::now().timestamp_millis(),
    })
}

fn error_frame(code: &str, message: &str) -> Value {
    server_frame(json!({"type": "error", "code": code, "message": message}))
}

/// Incoming frame shape from an endpoint.
#[derive(Deserialize)]
struct IncomingFrame {
    channel: Channel,
    #[serde(default)]
    payload: Value,
}

/// Main relay event loop for one endpoint.
///
/// Splits the socket; a `tokio::select!` loop concurrently drains the relay
/// queue (frames from the peer and the server) and the incoming WebSocket
/// stream.
pub async fn handle_relay(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    session_id: String,
    profile_id: String,
    role: Role,
) {
    let mut rx = match state.relay.attach(&session_id, role).await {
        Ok(rx) => rx,
        Err(err) => {
            let code = match err {
                RelayError::EndpointBusy(_) => "ENDPOINT_BUSY",
                RelayError::SessionUnknown(_) => "SESSION_NOT_FOUND",
                RelayError::CapabilityDenied(_) => "CAPABILITY_DENIED",
            };
            let (mut sink, _) = socket.split();
            let frame = error_frame(code, &err.to_string());
            let _ = sink
                .send(axum::extract::ws::Message::Text(frame.to_string().into()))
                .await;
            let _ = sink.close().await;
            warn!("Session {session_id}: {role} attach rejected: {err}");
            return;
        }
    };

    state.sessions.resume(&session_id).await;
    state
        .relay_stats
        .push_event(
            RelayEventType::EndpointAttached,
            format!("{role} on {session_id}"),
        )
        .await;

    let (mut ws_sink, mut ws_stream) = socket.split();

    loop {
        tokio::select! {
            relayed = rx.recv() => {
                let Some(frame) = relayed else {
                    // Relay state for the session was dropped (session ended).
                    break;
                };
                if ws_sink
                    .send(axum::extract::ws::Message::Text(frame.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    axum::extract::ws::Message::Text(text) => {
                        if let Some(reply) =
                            handle_frame(&state, &session_id, &profile_id, role, &text).await
                        {
                            if ws_sink
                                .send(axum::extract::ws::Message::Text(
                                    reply.to_string().into(),
                                ))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    axum::extract::ws::Message::Close(_) => break,
                    // Binary, Ping, Pong: axum answers protocol pings itself.
                    _ => {}
                }
            }
        }
    }

    state.relay.detach(&session_id, role).await;
    state.sessions.mark_suspended(&session_id).await;
    state
        .relay_stats
        .push_event(
            RelayEventType::EndpointDetached,
            format!("{role} on {session_id}"),
        )
        .await;
    info!("Session {session_id}: {role} relay connection closed");
}

/// Process one incoming frame. Returns a direct reply for the sender, if any.
async fn handle_frame(
    state: &AppState,
    session_id: &str,
    profile_id: &str,
    role: Role,
    text: &str,
) -> Option<Value> {
    let Ok(frame) = serde_json::from_str::<IncomingFrame>(text) else {
        return Some(error_frame("INVALID_FRAME", "Failed to parse relay frame"));
    };

    state.sessions.touch(session_id).await;

    let profile = state.profiles.get(profile_id).await?;

    // Gate before any side effects: a denied frame must not advance the
    // tunnel or transfer state machines.
    if role == Role::Client {
        if let Some(cap) = frame.channel.required_capability() {
            if !crate::permissions::resolve(&profile, cap) {
                state.relay_stats.bump_denied();
                debug!(
                    "Session {session_id}: {role} denied on {} ({})",
                    frame.channel.as_str(),
                    cap.as_str()
                );
                return Some(error_frame(
                    "CAPABILITY_DENIED",
                    &format!("capability {} not granted", cap.as_str()),
                ));
            }
        }
    }

    let mut payload = frame.payload;
    let msg_type = payload["type"].as_str().unwrap_or("").to_string();

    match frame.channel {
        Channel::Control => match msg_type.as_str() {
            // Heartbeat: answered directly, never relayed.
            "ping" => return Some(server_frame(json!({"type": "pong"}))),
            // Acknowledge a retried control frame.
            "ack" => {
                if let Some(seq) = payload["seq"].as_u64() {
                    state.relay.ack(session_id, role, seq).await;
                }
                return None;
            }
            _ => {}
        },
        Channel::Tunnel => {
            // Bind result from the host side drives the broker state machine.
            if msg_type == "open_result" {
                let tunnel_id = payload["tunnelId"].as_str().unwrap_or("");
                let ok = payload["ok"].as_bool().unwrap_or(false);
                match state.tunnels.handle_ack(tunnel_id, ok).await {
                    Ok(tunnel) => {
                        payload["state"] = json!(tunnel.state);
                    }
                    Err(err) => {
                        return Some(error_frame("TUNNEL_NOT_FOUND", &err.to_string()));
                    }
                }
            }
        }
        Channel::File => {
            if let Some(reply) = track_transfer(state, session_id, role, &msg_type, &mut payload).await {
                return Some(reply);
            }
        }
        _ => {}
    }

    let result = state
        .relay
        .send(
            &profile,
            RelayMessage {
                session_id: session_id.to_string(),
                channel: frame.channel,
                payload,
                sender_role: role,
            },
        )
        .await;

    match result {
        Ok(()) => None,
        Err(RelayError::CapabilityDenied(cap)) => Some(error_frame(
            "CAPABILITY_DENIED",
            &format!("capability {cap} not granted"),
        )),
        Err(err) => Some(error_frame("RELAY_ERROR", &err.to_string())),
    }
}

/// Drive the transfer tracker from `file` channel messages. Returns an error
/// frame when the message must not be relayed.
async fn track_transfer(
    state: &AppState,
    session_id: &str,
    role: Role,
    msg_type: &str,
    payload: &mut Value,
) -> Option<Value> {
    match msg_type {
        "offer" => {
            let offer = match serde_json::from_value::<TransferOffer>(payload.clone()) {
                Ok(offer) => offer,
                Err(e) => {
                    return Some(error_frame("INVALID_OFFER", &e.to_string()));
                }
            };
            match state.transfers.offer(session_id, role, &offer).await {
                Ok(transfer_id) => {
                    // Stamp the id so both sides share it.
                    payload["transferId"] = json!(transfer_id);
                    None
                }
                Err(err) => Some(error_frame("TRANSFER_REJECTED", &err.to_string())),
            }
        }
        "accept" => {
            let transfer_id = payload["transferId"].as_str().unwrap_or("");
            match state.transfers.accept(transfer_id).await {
                Ok(()) => None,
                Err(err) => Some(error_frame("TRANSFER_REJECTED", &err.to_string())),
            }
        }
        "chunk" => {
            let transfer_id = payload["transferId"].as_str().unwrap_or("");
            let index = payload["chunkIndex"].as_u64().unwrap_or(u64::MAX) as u32;
            let size = payload["size"].as_u64().unwrap_or(0);
            match state.transfers.record_chunk(transfer_id, index, size).await {
                Ok(()) => None,
                Err(err) => Some(error_frame("TRANSFER_REJECTED", &err.to_string())),
            }
        }
        "complete" => {
            let transfer_id = payload["transferId"].as_str().unwrap_or("");
            match state.transfers.complete(transfer_id).await {
                Ok(snapshot) => {
                    payload["bytesTransferred"] = json!(snapshot.bytes_transferred);
                    None
                }
                Err(err) => Some(error_frame("TRANSFER_REJECTED", &err.to_string())),
            }
        }
        "abort" => {
            let transfer_id = payload["transferId"].as_str().unwrap_or("");
            let reason = payload["reason"].as_str().unwrap_or("aborted");
            match state.transfers.abort(transfer_id, reason).await {
                Ok(()) => None,
                Err(err) => Some(error_frame("TRANSFER_REJECTED", &err.to_string())),
            }
        }
        // Unknown file messages pass through untracked.
        _ => None,
    }
}
