//! REST endpoint for file-transfer progress.
//!
//! - `GET /api/sessions/{id}/transfers` — progress snapshots for a session

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::AppState;

/// `GET /api/sessions/{id}/transfers` — list transfer progress, oldest first.
pub async fn list_transfers(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.sessions.get(&session_id).await.is_none() {
        return Err(ApiError::NotFound {
            kind: "session",
            id: session_id,
        });
    }
    let transfers = state.transfers.list_session(&session_id).await;
    Ok(Json(json!({ "transfers": transfers })))
}
