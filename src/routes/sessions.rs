//! REST endpoints for session pairing and lifecycle.
//!
//! - `POST   /api/sessions/credential` — host requests a pairing code
//! - `POST   /api/sessions/redeem`     — client redeems a code and joins
//! - `POST   /api/sessions/unattended` — policy-gated join without approval
//! - `GET    /api/sessions`            — list sessions
//! - `DELETE /api/sessions/{id}`       — end a session

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::credentials::format_code;
use crate::error::ApiError;
use crate::relay::Role;
use crate::unattended::{self, Access};
use crate::AppState;

// ─── Credential issue ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct IssueCredentialRequest {
    pub profile_id: String,
    /// Override the default code lifetime (10 minutes).
    pub ttl_secs: Option<u64>,
}

/// `POST /api/sessions/credential` — create the host's `awaiting_client`
/// session and a pairing code bound to it.
pub async fn issue_credential(
    State(state): State<AppState>,
    Json(req): Json<IssueCredentialRequest>,
) -> Result<Json<Value>, ApiError> {
    let profile = state
        .profiles
        .get(&req.profile_id)
        .await
        .ok_or_else(|| ApiError::NotFound {
            kind: "profile",
            id: req.profile_id.clone(),
        })?;

    let session = state
        .sessions
        .create_for_host(&state.config.host.id, &profile.id)
        .await?;
    state.relay.register(&session.id).await;

    let ttl = req.ttl_secs.map(|s| Duration::seconds(s as i64));
    let credential = state.issuer.issue(&session.id, &profile.id, ttl).await?;

    let _ = state.session_events.send(json!({
        "type": "session.created",
        "session_id": session.id,
        "profile_id": profile.id,
    }));

    Ok(Json(json!({
        "session_id": session.id,
        "code": credential.code,
        "code_formatted": format_code(&credential.code),
        "expires_at": credential.expires_at,
    })))
}

// ─── Redeem ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RedeemRequest {
    pub code: String,
    /// Client identity to record on the session. Generated when omitted.
    pub client_id: Option<String>,
}

/// `POST /api/sessions/redeem` — consume a pairing code and attach as the
/// session's client. At-most-once: a second redeem of the same code conflicts.
pub async fn redeem(
    State(state): State<AppState>,
    Json(req): Json<RedeemRequest>,
) -> Result<Json<Value>, ApiError> {
    let credential = state.issuer.redeem(&req.code).await?;

    let client_id = req
        .client_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let session = state
        .sessions
        .attach_client(&credential.host_session_id, &client_id)
        .await?;

    let profile = state
        .profiles
        .get(&credential.profile_id)
        .await
        .ok_or_else(|| ApiError::NotFound {
            kind: "profile",
            id: credential.profile_id.clone(),
        })?;

    // Tell the waiting host its guest arrived.
    let _ = state
        .relay
        .send_control(
            &session.id,
            Role::Host,
            &json!({"type": "client.joined", "clientId": client_id}),
        )
        .await;

    let _ = state.session_events.send(json!({
        "type": "session.client_attached",
        "session_id": session.id,
        "client_id": client_id,
    }));

    Ok(Json(json!({
        "session_id": session.id,
        "profile": profile,
    })))
}

// ─── Unattended ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UnattendedRequest {
    pub profile_id: String,
    /// Authenticated requester identity from the identity provider.
    pub identity: String,
    /// Unattended-access password (plaintext in transit, verified against
    /// the stored hash, never logged).
    pub secret: String,
}

/// `POST /api/sessions/unattended` — connect without interactive host
/// approval, gated by the profile's unattended-access policy.
pub async fn unattended_connect(
    State(state): State<AppState>,
    Json(req): Json<UnattendedRequest>,
) -> Result<Json<Value>, ApiError> {
    let profile = state
        .profiles
        .get(&req.profile_id)
        .await
        .ok_or_else(|| ApiError::NotFound {
            kind: "profile",
            id: req.profile_id.clone(),
        })?;

    match unattended::evaluate(&profile, &req.identity, &req.secret, Utc::now()) {
        Access::Denied(reason) => {
            warn!(
                identity = %req.identity,
                profile_id = %profile.id,
                reason = reason.code(),
                "Unattended access denied"
            );
            return Err(ApiError::PolicyDenied(reason));
        }
        Access::Allowed => {}
    }

    let session = state
        .sessions
        .create_for_host(&state.config.host.id, &profile.id)
        .await?;
    state.relay.register(&session.id).await;
    let session = state
        .sessions
        .attach_client(&session.id, &req.identity)
        .await?;

    info!(
        identity = %req.identity,
        session_id = %session.id,
        "Unattended session established"
    );
    let _ = state.session_events.send(json!({
        "type": "session.created",
        "session_id": session.id,
        "profile_id": profile.id,
        "unattended": true,
    }));

    Ok(Json(json!({
        "session_id": session.id,
        "profile": profile,
    })))
}

// ─── List / End ──────────────────────────────────────────────────────────────

/// `GET /api/sessions` — list all sessions, oldest first.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.list().await;
    Json(json!({ "sessions": sessions }))
}

#[derive(Deserialize, Default)]
pub struct EndSessionQuery {
    pub reason: Option<String>,
}

/// `DELETE /api/sessions/{id}?reason=...` — end a session and cascade
/// teardown of its relay state, tunnels, and in-flight transfers.
pub async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EndSessionQuery>,
) -> Result<Json<Value>, ApiError> {
    let reason = query.reason.unwrap_or_else(|| "ended".to_string());

    let session = state.sessions.end_session(&id, &reason).await?;
    state.relay.close_session(&id, &reason).await;
    state.tunnels.close_session(&id).await;
    state.transfers.close_session(&id).await;

    let _ = state.session_events.send(json!({
        "type": "session.destroyed",
        "session_id": id,
        "reason": reason,
    }));

    Ok(Json(json!({
        "ok": true,
        "session_id": session.id,
    })))
}
