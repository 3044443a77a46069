//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, session count, and relay traffic stats.
/// No authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.sessions.session_count().await;
    let outstanding_codes = state.issuer.outstanding().await;
    let rs = &state.relay_stats;

    // Format recent endpoint events, newest first
    let events = rs.events.lock().await;
    let now = std::time::Instant::now();
    let recent_events: Vec<Value> = events
        .iter()
        .rev()
        .take(10)
        .map(|e| {
            let ago = now.duration_since(e.timestamp);
            let ago_str = if ago.as_secs() < 60 {
                format!("{}s ago", ago.as_secs())
            } else if ago.as_secs() < 3600 {
                format!("{}m ago", ago.as_secs() / 60)
            } else {
                format!("{}h ago", ago.as_secs() / 3600)
            };
            json!({
                "time": ago_str,
                "event": e.event_type.as_str(),
                "detail": e.detail,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "outstanding_codes": outstanding_codes,
        "relay": {
            "frames_relayed": rs.frames_relayed(),
            "dropped_best_effort": rs.dropped_best_effort(),
            "control_retries": rs.control_retries(),
            "capability_denials": rs.capability_denials(),
            "recent_events": recent_events,
        },
    }))
}
