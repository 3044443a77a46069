//! REST endpoints for permission-profile management.
//!
//! - `GET    /api/profiles`      — list all profiles
//! - `POST   /api/profiles`      — create a custom profile from a base
//! - `PATCH  /api/profiles/{id}` — update permissions / enablement / unattended policy
//! - `DELETE /api/profiles/{id}` — delete a custom profile

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::permissions::{PermissionSet, ProfileUpdate};
use crate::relay::Role;
use crate::unattended::{Schedule, UnattendedPolicy};
use crate::AppState;

/// `GET /api/profiles` — list all profiles, built-ins first.
pub async fn list_profiles(State(state): State<AppState>) -> Json<Value> {
    let profiles = state.profiles.list().await;
    Json(json!({ "profiles": profiles }))
}

// ─── Create ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProfileRequest {
    pub name: String,
    /// Profile to clone permissions from.
    pub base_id: String,
    /// Owning host user. Omitted for server-local profiles.
    pub owner: Option<String>,
}

/// `POST /api/profiles` — clone a base profile into a new custom profile.
pub async fn create_profile(
    State(state): State<AppState>,
    Json(req): Json<CreateProfileRequest>,
) -> Result<Json<Value>, ApiError> {
    let profile = state
        .profiles
        .create_custom(&req.name, &req.base_id, req.owner.as_deref())
        .await?;
    Ok(Json(json!({ "profile": profile })))
}

// ─── Update ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// `"09:00"`-style start of the access window.
    pub start: String,
    pub end: String,
    /// Lowercase day names: `["monday", "tuesday", ...]`.
    pub days_of_week: Vec<String>,
    /// Host-local offset from UTC, in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnattendedSpec {
    /// Plaintext password, hashed server-side before storage.
    pub password: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    pub schedule: Option<ScheduleSpec>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    pub description: Option<String>,
    pub permissions: Option<PermissionSet>,
    pub is_enabled: Option<bool>,
    pub is_unattended_access: Option<bool>,
    /// Replace the unattended policy. `null` leaves it untouched; use
    /// `isUnattendedAccess: false` to disable access while keeping the policy.
    pub unattended: Option<UnattendedSpec>,
}

/// `PATCH /api/profiles/{id}` — partial update of a custom profile.
///
/// Permission changes are pushed to live sessions bound to the profile as a
/// `profile.changed` control frame, and tunnel grants are re-validated
/// (revoking `tcpTunneling` force-closes the session's tunnels).
pub async fn patch_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<ProfilePatch>,
) -> Result<Json<Value>, ApiError> {
    let unattended = match patch.unattended {
        Some(spec) => {
            let schedule = match spec.schedule {
                Some(s) => Some(Schedule::parse(
                    &s.start,
                    &s.end,
                    &s.days_of_week,
                    s.utc_offset_minutes,
                )?),
                None => None,
            };
            Some(Some(UnattendedPolicy::new(
                &spec.password,
                spec.allowed_users,
                schedule,
            )?))
        }
        None => None,
    };

    let updated = state
        .profiles
        .update(
            &id,
            ProfileUpdate {
                description: patch.description,
                permissions: patch.permissions,
                is_enabled: patch.is_enabled,
                is_unattended_access: patch.is_unattended_access,
                unattended,
            },
        )
        .await?;

    // Re-validate live sessions bound to this profile.
    let bound = state.sessions.sessions_for_profile(&id).await;
    for session_id in &bound {
        let payload = json!({"type": "profile.changed", "profileId": id});
        for role in [Role::Host, Role::Client] {
            let _ = state.relay.send_control(session_id, role, &payload).await;
        }
        let closed = state.tunnels.revalidate(session_id, &updated).await;
        for tunnel in closed {
            let _ = state
                .relay
                .send_control(
                    session_id,
                    Role::Host,
                    &json!({"type": "tunnel.closed", "tunnelId": tunnel.id, "reason": "capability_revoked"}),
                )
                .await;
        }
    }
    if !bound.is_empty() {
        info!(
            "Profile {id} updated, {} live session(s) notified",
            bound.len()
        );
    }

    Ok(Json(json!({ "profile": updated })))
}

// ─── Delete ──────────────────────────────────────────────────────────────────

/// `DELETE /api/profiles/{id}` — remove a custom profile.
///
/// Fails with `PROFILE_IN_USE` while a live session is bound to it.
pub async fn delete_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.sessions.profile_in_use(&id).await {
        return Err(ApiError::ProfileInUse);
    }
    state.profiles.delete(&id).await?;
    Ok(Json(json!({ "ok": true, "profile_id": id })))
}
