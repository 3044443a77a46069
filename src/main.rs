#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # vncc
//!
//! Session signaling and permission negotiation server for VNCConnect.
//!
//! vncc exposes HTTP and WebSocket APIs that pair a host with a client via
//! short-lived access codes, negotiate a permission profile for the session,
//! and relay in-session traffic (chat, clipboard, file transfer, whiteboard,
//! tunnel setup) between the two endpoints — all protected by a pre-shared
//! API key.
//!
//! ## API surface
//!
//! | Method | Path                          | Auth | Description                        |
//! |--------|-------------------------------|------|------------------------------------|
//! | GET    | `/api/health`                 | No   | Liveness probe                     |
//! | POST   | `/api/sessions/credential`    | Yes  | Issue a pairing code               |
//! | POST   | `/api/sessions/redeem`        | Yes  | Redeem a code, join as client      |
//! | POST   | `/api/sessions/unattended`    | Yes  | Policy-gated unattended join       |
//! | GET    | `/api/sessions`               | Yes  | List sessions                      |
//! | DELETE | `/api/sessions/{id}`          | Yes  | End a session                      |
//! | GET    | `/api/profiles`               | Yes  | List permission profiles           |
//! | POST   | `/api/profiles`               | Yes  | Create a custom profile            |
//! | PATCH  | `/api/profiles/{id}`          | Yes  | Update a custom profile            |
//! | DELETE | `/api/profiles/{id}`          | Yes  | Delete a custom profile            |
//! | POST   | `/api/sessions/{id}/tunnels`  | Yes  | Open a TCP tunnel                  |
//! | GET    | `/api/sessions/{id}/tunnels`  | Yes  | List a session's tunnels           |
//! | DELETE | `/api/tunnels/{id}`           | Yes  | Close a tunnel                     |
//! | GET    | `/api/sessions/{id}/transfers`| Yes  | File-transfer progress             |
//! | GET    | `/api/sessions/{id}/relay`    | Yes* | Relay WebSocket                    |
//!
//! *WebSocket auth is via `?token=<key>` query param (no `Authorization`
//! header available during the upgrade handshake).
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router setup, graceful shutdown
//! auth.rs          — Bearer token middleware, constant-time comparison
//! config.rs        — TOML + env-var configuration
//! error.rs         — typed error taxonomy → JSON error responses
//! permissions.rs   — capability sets, profiles, profile registry
//! credentials.rs   — pairing-code issue/redeem/sweep
//! unattended.rs    — unattended-access policy engine (Argon2id, schedule)
//! sessions/
//!   mod.rs         — SessionRegistry (lifecycle, attach, suspend, sweep)
//! relay/
//!   mod.rs         — per-session signaling bus, capability gating, control retry
//! tunnels/
//!   mod.rs         — TCP tunnel broker (Connecting/Active/Closed/Error)
//! transfers/
//!   mod.rs         — file-transfer progress tracking for the `file` channel
//! routes/          — REST API route handlers
//! ws/
//!   mod.rs         — relay WebSocket upgrade and frame dispatch
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use vncc::auth::{self, ApiKey};
use vncc::config::Config;
use vncc::credentials::CredentialIssuer;
use vncc::permissions::ProfileRegistry;
use vncc::relay::{Relay, Role};
use vncc::routes;
use vncc::sessions::{SessionEvent, SessionRegistry};
use vncc::state::{AppState, RelayStats};
use vncc::transfers::TransferTracker;
use vncc::tunnels::TunnelBroker;
use vncc::ws;

/// Session signaling server for VNCConnect.
#[derive(Parser)]
#[command(name = "vncc", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => {
            run_server(config.as_deref()).await;
        }
        None => {
            run_server(None).await;
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("vncc v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Host id: {}", config.host.id);
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set VNCC_API_KEY or update config");
    }

    let relay_stats = Arc::new(RelayStats::new());
    let (session_events, _) = broadcast::channel(256);

    let state = AppState {
        profiles: ProfileRegistry::with_builtins(),
        issuer: CredentialIssuer::new(config.credential.ttl_secs),
        sessions: SessionRegistry::new(config.server.max_sessions, &config.session),
        relay: Relay::new(
            Arc::clone(&relay_stats),
            config.server.relay_queue_depth,
            config.relay.control_retry_secs,
        ),
        tunnels: TunnelBroker::new(
            config.tunnel.bind_timeout_secs,
            config.tunnel.ended_retention_secs,
        ),
        transfers: TransferTracker::new(
            config.transfer.max_per_session,
            config.transfer.stale_timeout_secs,
            config.transfer.ended_retention_secs,
        ),
        config: Arc::new(config),
        start_time: Instant::now(),
        session_events,
        relay_stats,
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route(
            "/api/sessions/credential",
            post(routes::sessions::issue_credential),
        )
        .route("/api/sessions/redeem", post(routes::sessions::redeem))
        .route(
            "/api/sessions/unattended",
            post(routes::sessions::unattended_connect),
        )
        .route("/api/sessions/{id}", delete(routes::sessions::end_session))
        .route(
            "/api/sessions/{id}/tunnels",
            get(routes::tunnels::list_tunnels).post(routes::tunnels::open_tunnel),
        )
        .route("/api/tunnels/{id}", delete(routes::tunnels::close_tunnel))
        .route(
            "/api/sessions/{id}/transfers",
            get(routes::transfers::list_transfers),
        )
        .route(
            "/api/profiles",
            get(routes::profiles::list_profiles).post(routes::profiles::create_profile),
        )
        .route(
            "/api/profiles/{id}",
            axum::routing::patch(routes::profiles::patch_profile)
                .delete(routes::profiles::delete_profile),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_route = Router::new().route("/api/sessions/{id}/relay", get(ws::relay_upgrade));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: session lifecycle transitions + cascaded teardown
    let sweep_state = state.clone();
    let session_sweep = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            sweep_state.config.session.sweep_interval_secs,
        ));
        loop {
            interval.tick().await;
            let events = sweep_state.sessions.sweep().await;
            for event in events {
                match event {
                    SessionEvent::Suspended(session_id) => {
                        let _ = sweep_state.session_events.send(json!({
                            "type": "session.suspended",
                            "session_id": session_id,
                        }));
                    }
                    SessionEvent::Closed(session_id, reason) => {
                        sweep_state.relay.close_session(&session_id, &reason).await;
                        sweep_state.tunnels.close_session(&session_id).await;
                        sweep_state.transfers.close_session(&session_id).await;
                        let _ = sweep_state.session_events.send(json!({
                            "type": "session.destroyed",
                            "session_id": session_id,
                            "reason": reason,
                        }));
                    }
                    SessionEvent::Purged(_) => {}
                }
            }
        }
    });

    // Periodic sweep: expired pairing codes
    let issuer = state.issuer.clone();
    let credential_interval = state.config.credential.sweep_interval_secs;
    let credential_sweep = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(credential_interval));
        loop {
            interval.tick().await;
            issuer.sweep_expired().await;
        }
    });

    // Periodic sweep: tunnel bind timeouts + relay control retries + stale
    // transfers
    let tick_state = state.clone();
    let tunnel_interval = state.config.tunnel.sweep_interval_secs;
    let maintenance_sweep = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(tunnel_interval.max(1)));
        loop {
            interval.tick().await;
            tick_state.relay.retry_pending().await;
            tick_state.transfers.sweep_stale().await;
            for tunnel in tick_state.tunnels.sweep().await {
                let payload = json!({
                    "type": "tunnel.closed",
                    "tunnelId": tunnel.id,
                    "reason": "bind_timeout",
                });
                for role in [Role::Host, Role::Client] {
                    let _ = tick_state
                        .relay
                        .send_control(&tunnel.session_id, role, &payload)
                        .await;
                }
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    session_sweep.abort();
    credential_sweep.abort();
    maintenance_sweep.abort();

    // Tell live endpoints the relay is going away before dropping them
    for session in state.sessions.list().await {
        if !session.state.is_terminal() {
            state.relay.close_session(&session.id, "server_shutdown").await;
        }
    }
    info!("Goodbye");
}
