//! TCP tunnel broker — logical port-forward bindings carried over the relay.
//!
//! A tunnel is a binding `localPort → remoteHost:remotePort` owned by a
//! session. The broker only tracks the binding's lifecycle; the bytes flow
//! over the relay's `tunnel` channel between the endpoints. A tunnel starts
//! in `Connecting` and becomes `Active` when the remote endpoint acknowledges
//! bind success, or `Error` on explicit failure or the bind timeout.
//!
//! ## Concurrency
//!
//! The tunnel table is behind an `RwLock`. `open` holds the write lock across
//! the duplicate-port check and insert, so at most one tunnel per
//! `(session, localPort)` holds under concurrent opens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::permissions::{resolve, Capability, PermissionProfile};

/// Tunnel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Connecting,
    Active,
    Closed,
    Error,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Connecting => "connecting",
            TunnelState::Active => "active",
            TunnelState::Closed => "closed",
            TunnelState::Error => "error",
        }
    }
}

/// A logical port-forward binding.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub id: String,
    pub session_id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub state: TunnelState,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("tunnel {0} not found")]
    NotFound(String),
    #[error("local port {0} already bound for this session")]
    PortInUse(u16),
    #[error("tcpTunneling capability not granted")]
    CapabilityDenied,
}

struct TunnelEntry {
    tunnel: Tunnel,
    opened_at: Instant,
    /// Set when the tunnel reaches a terminal state, for purge accounting.
    ended_at: Option<Instant>,
}

/// Tracks logical tunnels per session.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct TunnelBroker {
    tunnels: Arc<RwLock<HashMap<String, TunnelEntry>>>,
    bind_timeout: Duration,
    ended_retention: Duration,
}

impl TunnelBroker {
    pub fn new(bind_timeout_secs: u64, ended_retention_secs: u64) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            bind_timeout: Duration::from_secs(bind_timeout_secs),
            ended_retention: Duration::from_secs(ended_retention_secs),
        }
    }

    /// Open a tunnel in `Connecting`. The caller announces it over the
    /// relay's `tunnel` channel; the remote side's ack drives the transition.
    ///
    /// Holds the write lock through the duplicate-port check and insert.
    pub async fn open(
        &self,
        session_id: &str,
        profile: &PermissionProfile,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Tunnel, TunnelError> {
        if !resolve(profile, Capability::TcpTunneling) {
            return Err(TunnelError::CapabilityDenied);
        }

        let mut tunnels = self.tunnels.write().await;

        let port_taken = tunnels.values().any(|e| {
            e.tunnel.session_id == session_id
                && e.tunnel.local_port == local_port
                && !e.tunnel.state.is_terminal()
        });
        if port_taken {
            return Err(TunnelError::PortInUse(local_port));
        }

        let tunnel = Tunnel {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            state: TunnelState::Connecting,
        };
        tunnels.insert(
            tunnel.id.clone(),
            TunnelEntry {
                tunnel: tunnel.clone(),
                opened_at: Instant::now(),
                ended_at: None,
            },
        );

        info!(
            "Tunnel {} opened on session {session_id}: {local_port} → {remote_host}:{remote_port}",
            tunnel.id
        );
        Ok(tunnel)
    }

    /// Apply the remote endpoint's bind result: `Connecting → Active` on
    /// success, `Connecting → Error` on failure. Acks for tunnels no longer
    /// in `Connecting` are ignored (late ack after timeout or close).
    pub async fn handle_ack(&self, tunnel_id: &str, ok: bool) -> Result<Tunnel, TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;

        if entry.tunnel.state == TunnelState::Connecting {
            if ok {
                entry.tunnel.state = TunnelState::Active;
                info!("Tunnel {tunnel_id} active");
            } else {
                entry.tunnel.state = TunnelState::Error;
                entry.ended_at = Some(Instant::now());
                warn!("Tunnel {tunnel_id} failed: remote bind rejected");
            }
        }
        Ok(entry.tunnel.clone())
    }

    /// Close a tunnel, releasing its local port for reuse.
    pub async fn close(&self, tunnel_id: &str) -> Result<Tunnel, TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;

        if !entry.tunnel.state.is_terminal() {
            entry.tunnel.state = TunnelState::Closed;
            entry.ended_at = Some(Instant::now());
            info!("Tunnel {tunnel_id} closed");
        }
        Ok(entry.tunnel.clone())
    }

    pub async fn get(&self, tunnel_id: &str) -> Option<Tunnel> {
        self.tunnels
            .read()
            .await
            .get(tunnel_id)
            .map(|e| e.tunnel.clone())
    }

    /// All tunnels owned by a session, newest last.
    pub async fn list_session(&self, session_id: &str) -> Vec<Tunnel> {
        let tunnels = self.tunnels.read().await;
        let mut entries: Vec<&TunnelEntry> = tunnels
            .values()
            .filter(|e| e.tunnel.session_id == session_id)
            .collect();
        entries.sort_by_key(|e| e.opened_at);
        entries.iter().map(|e| e.tunnel.clone()).collect()
    }

    /// Force-close every tunnel owned by a session. Returns the closed set.
    pub async fn close_session(&self, session_id: &str) -> Vec<Tunnel> {
        let mut tunnels = self.tunnels.write().await;
        let mut closed = Vec::new();
        for entry in tunnels.values_mut() {
            if entry.tunnel.session_id == session_id && !entry.tunnel.state.is_terminal() {
                entry.tunnel.state = TunnelState::Closed;
                entry.ended_at = Some(Instant::now());
                closed.push(entry.tunnel.clone());
            }
        }
        if !closed.is_empty() {
            info!(
                "Closed {} tunnel(s) with session {session_id}",
                closed.len()
            );
        }
        closed
    }

    /// Re-check the session's grant after a profile change; if
    /// `tcpTunneling` was revoked, force-close its tunnels.
    pub async fn revalidate(
        &self,
        session_id: &str,
        profile: &PermissionProfile,
    ) -> Vec<Tunnel> {
        if resolve(profile, Capability::TcpTunneling) {
            return Vec::new();
        }
        let closed = self.close_session(session_id).await;
        if !closed.is_empty() {
            info!(
                "Session {session_id}: tcpTunneling revoked, {} tunnel(s) force-closed",
                closed.len()
            );
        }
        closed
    }

    /// Periodic sweep: `Connecting` tunnels past the bind timeout go to
    /// `Error`; terminal tunnels past the retention grace are dropped.
    /// Returns the timed-out tunnels so the caller can notify endpoints.
    pub async fn sweep(&self) -> Vec<Tunnel> {
        let mut tunnels = self.tunnels.write().await;
        let mut timed_out = Vec::new();

        for entry in tunnels.values_mut() {
            if entry.tunnel.state == TunnelState::Connecting
                && entry.opened_at.elapsed() > self.bind_timeout
            {
                entry.tunnel.state = TunnelState::Error;
                entry.ended_at = Some(Instant::now());
                warn!("Tunnel {} errored: bind timeout", entry.tunnel.id);
                timed_out.push(entry.tunnel.clone());
            }
        }

        tunnels.retain(|_, e| {
            e.ended_at
                .map_or(true, |t| t.elapsed() <= self.ended_retention)
        });

        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::ProfileRegistry;

    fn broker() -> TunnelBroker {
        TunnelBroker::new(10, 3600)
    }

    async fn full_access() -> PermissionProfile {
        ProfileRegistry::with_builtins()
            .get("full-access")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_requires_capability() {
        let broker = broker();
        let registry = ProfileRegistry::with_builtins();
        let view_only = registry.get("view-only").await.unwrap();

        assert_eq!(
            broker
                .open("s-1", &view_only, 8080, "db.internal", 5432)
                .await
                .unwrap_err(),
            TunnelError::CapabilityDenied
        );
    }

    #[tokio::test]
    async fn test_duplicate_local_port_rejected() {
        let broker = broker();
        let profile = full_access().await;

        broker
            .open("s-1", &profile, 8080, "db.internal", 5432)
            .await
            .unwrap();
        assert_eq!(
            broker
                .open("s-1", &profile, 8080, "cache.internal", 6379)
                .await
                .unwrap_err(),
            TunnelError::PortInUse(8080)
        );

        // Same port on a different session is fine.
        assert!(broker
            .open("s-2", &profile, 8080, "db.internal", 5432)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_port_released_after_close() {
        let broker = broker();
        let profile = full_access().await;

        let tunnel = broker
            .open("s-1", &profile, 8080, "db.internal", 5432)
            .await
            .unwrap();
        broker.close(&tunnel.id).await.unwrap();

        assert!(broker
            .open("s-1", &profile, 8080, "db.internal", 5432)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_ack_drives_state() {
        let broker = broker();
        let profile = full_access().await;

        let tunnel = broker
            .open("s-1", &profile, 8080, "db.internal", 5432)
            .await
            .unwrap();
        assert_eq!(tunnel.state, TunnelState::Connecting);

        let active = broker.handle_ack(&tunnel.id, true).await.unwrap();
        assert_eq!(active.state, TunnelState::Active);

        // A late negative ack on an active tunnel is ignored.
        let still_active = broker.handle_ack(&tunnel.id, false).await.unwrap();
        assert_eq!(still_active.state, TunnelState::Active);

        let failed = broker
            .open("s-1", &profile, 8081, "db.internal", 5432)
            .await
            .unwrap();
        let errored = broker.handle_ack(&failed.id, false).await.unwrap();
        assert_eq!(errored.state, TunnelState::Error);
    }

    #[tokio::test]
    async fn test_bind_timeout_sweeps_to_error() {
        let broker = TunnelBroker::new(0, 3600);
        let profile = full_access().await;
        let tunnel = broker
            .open("s-1", &profile, 8080, "db.internal", 5432)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let timed_out = broker.sweep().await;
        assert_eq!(timed_out.len(), 1);
        assert_eq!(
            broker.get(&tunnel.id).await.unwrap().state,
            TunnelState::Error
        );
    }

    #[tokio::test]
    async fn test_session_close_cascades() {
        let broker = broker();
        let profile = full_access().await;
        broker
            .open("s-1", &profile, 8080, "db.internal", 5432)
            .await
            .unwrap();
        broker
            .open("s-1", &profile, 8081, "cache.internal", 6379)
            .await
            .unwrap();
        broker
            .open("s-2", &profile, 8080, "db.internal", 5432)
            .await
            .unwrap();

        let closed = broker.close_session("s-1").await;
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|t| t.state == TunnelState::Closed));
        assert_eq!(broker.list_session("s-2").await[0].state, TunnelState::Connecting);
    }

    #[tokio::test]
    async fn test_revalidate_closes_on_revocation() {
        let broker = broker();
        let registry = ProfileRegistry::with_builtins();
        let profile = full_access().await;
        broker
            .open("s-1", &profile, 8080, "db.internal", 5432)
            .await
            .unwrap();

        // Capability still granted: nothing happens.
        assert!(broker.revalidate("s-1", &profile).await.is_empty());

        let view_only = registry.get("view-only").await.unwrap();
        let closed = broker.revalidate("s-1", &view_only).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].state, TunnelState::Closed);
    }
}
