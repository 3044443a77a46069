//! Session lifecycle management.
//!
//! [`SessionRegistry`] is the single authority for creating, accessing, and
//! ending pairing sessions. A session is created in `AwaitingClient` when the
//! host requests a credential, goes `Active` when a client attaches, and is
//! destroyed when either side ends it or the inactivity sweep closes it.
//!
//! Transient relay disconnects park an active session in `Suspended`; a
//! reconnect resumes it. Closed sessions are retained for a short grace
//! window so late operations observe `SessionClosed` rather than a spurious
//! `NotFound`, then the sweep purges them.
//!
//! ## Concurrency
//!
//! The session map is behind an `RwLock`. Read operations (get, list) take a
//! read lock; mutations (create, attach, end, sweep) take a write lock.
//! `attach_client` holds the write lock across the occupancy check and the
//! client assignment, so at-most-one-client holds under concurrent attach.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::SessionConfig;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingClient,
    Active,
    Suspended,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::AwaitingClient => "awaiting_client",
            SessionState::Active => "active",
            SessionState::Suspended => "suspended",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Snapshot of a session returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub host_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub profile_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session already has a client attached")]
    SessionFull,
    #[error("session is closed")]
    SessionClosed,
}

/// Events produced by [`SessionRegistry::sweep`] for callers to broadcast and
/// to drive relay/tunnel teardown.
#[derive(Debug)]
pub enum SessionEvent {
    /// Active session went idle. Contains `session_id`.
    Suspended(String),
    /// Session closed. Contains `(session_id, reason)`.
    Closed(String, String),
    /// Closed session dropped from the table after the retention grace.
    Purged(String),
}

struct SessionEntry {
    host_id: String,
    client_id: Option<String>,
    profile_id: String,
    state: SessionState,
    created_at: DateTime<Utc>,
    /// Last relay frame, heartbeat, or lifecycle action.
    last_activity: Instant,
    /// Set when the session reaches `Closed`, for retention accounting.
    closed_at: Option<Instant>,
}

impl SessionEntry {
    fn snapshot(&self, id: &str) -> Session {
        Session {
            id: id.to_string(),
            host_id: self.host_id.clone(),
            client_id: self.client_id.clone(),
            profile_id: self.profile_id.clone(),
            state: self.state,
            created_at: self.created_at,
        }
    }
}

/// Manages the pool of pairing sessions.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    max_sessions: usize,
    idle_suspend: Duration,
    suspend_close: Duration,
    closed_retention: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, config: &SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
            idle_suspend: Duration::from_secs(config.idle_suspend_secs),
            suspend_close: Duration::from_secs(config.suspend_close_secs),
            closed_retention: Duration::from_secs(config.closed_retention_secs),
        }
    }

    /// Create the `AwaitingClient` session a credential will be bound to.
    ///
    /// Holds the write lock through the limit check and insert.
    pub async fn create_for_host(
        &self,
        host_id: &str,
        profile_id: &str,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;

        let live = sessions.values().filter(|e| !e.state.is_terminal()).count();
        if live >= self.max_sessions {
            return Err(SessionError::SessionFull);
        }

        let id = Uuid::new_v4().to_string();
        let entry = SessionEntry {
            host_id: host_id.to_string(),
            client_id: None,
            profile_id: profile_id.to_string(),
            state: SessionState::AwaitingClient,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            closed_at: None,
        };
        let snapshot = entry.snapshot(&id);
        sessions.insert(id.clone(), entry);

        info!(
            "Session {id} created for host {host_id} (profile {profile_id}), total: {}",
            sessions.len()
        );
        Ok(snapshot)
    }

    /// Attach a client, transitioning to `Active`. At-most-one-client is
    /// enforced under the write lock.
    pub async fn attach_client(
        &self,
        session_id: &str,
        client_id: &str,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if entry.state.is_terminal() {
            return Err(SessionError::SessionClosed);
        }
        if entry.client_id.is_some() {
            return Err(SessionError::SessionFull);
        }

        entry.client_id = Some(client_id.to_string());
        entry.state = SessionState::Active;
        entry.last_activity = Instant::now();

        info!("Session {session_id}: client {client_id} attached");
        Ok(entry.snapshot(session_id))
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.snapshot(session_id))
    }

    pub async fn list(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut items: Vec<Session> =
            sessions.iter().map(|(id, e)| e.snapshot(id)).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    /// Whether any non-terminal session is bound to the profile. Gates
    /// profile deletion (`ProfileInUse`).
    pub async fn profile_in_use(&self, profile_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .values()
            .any(|e| e.profile_id == profile_id && !e.state.is_terminal())
    }

    /// Ids of non-terminal sessions bound to the profile, for profile-changed
    /// notification fan-out.
    pub async fn sessions_for_profile(&self, profile_id: &str) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.profile_id == profile_id && !e.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Record activity (relay frame or heartbeat).
    pub async fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Resume a suspended session on relay reconnect.
    pub async fn resume(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.last_activity = Instant::now();
            if entry.state == SessionState::Suspended {
                entry.state = SessionState::Active;
                info!("Session {session_id} resumed");
            }
        }
    }

    /// Park an active session on transient relay disconnect.
    pub async fn mark_suspended(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            if entry.state == SessionState::Active {
                entry.state = SessionState::Suspended;
                entry.last_activity = Instant::now();
                info!("Session {session_id} suspended (endpoint disconnected)");
            }
        }
    }

    /// End a session: `Closing` → `Closed`. The caller cascades relay close
    /// frames and tunnel/transfer teardown.
    pub async fn end_session(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if entry.state.is_terminal() {
            return Err(SessionError::SessionClosed);
        }

        entry.state = SessionState::Closing;
        entry.state = SessionState::Closed;
        entry.closed_at = Some(Instant::now());
        entry.last_activity = Instant::now();

        info!("Session {session_id} closed ({reason})");
        Ok(entry.snapshot(session_id))
    }

    /// Count of non-terminal sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|e| !e.state.is_terminal())
            .count()
    }

    /// Periodic sweep that drives the inactivity transitions:
    ///
    /// 1. `Active` sessions idle past the suspend window go `Suspended`.
    /// 2. `Suspended` sessions idle past the close window go `Closed`.
    /// 3. `AwaitingClient` sessions idle past the close window go `Closed`
    ///    (the credential expired without being redeemed).
    /// 4. `Closed` sessions past the retention grace are purged.
    ///
    /// Returns events for the caller to broadcast and cascade.
    pub async fn sweep(&self) -> Vec<SessionEvent> {
        {
            let sessions = self.sessions.read().await;
            if sessions.is_empty() {
                return Vec::new();
            }
        }

        let mut events = Vec::new();
        let mut sessions = self.sessions.write().await;

        for (id, entry) in sessions.iter_mut() {
            let idle = entry.last_activity.elapsed();
            match entry.state {
                SessionState::Active if idle > self.idle_suspend => {
                    entry.state = SessionState::Suspended;
                    info!("Session {id} suspended (idle {}s)", idle.as_secs());
                    events.push(SessionEvent::Suspended(id.clone()));
                }
                SessionState::Suspended if idle > self.suspend_close => {
                    entry.state = SessionState::Closed;
                    entry.closed_at = Some(Instant::now());
                    info!("Session {id} closed (suspended {}s)", idle.as_secs());
                    events.push(SessionEvent::Closed(id.clone(), "inactivity".to_string()));
                }
                SessionState::AwaitingClient if idle > self.suspend_close => {
                    entry.state = SessionState::Closed;
                    entry.closed_at = Some(Instant::now());
                    events.push(SessionEvent::Closed(id.clone(), "never_joined".to_string()));
                }
                _ => {}
            }
        }

        let purgeable: Vec<String> = sessions
            .iter()
            .filter(|(_, e)| {
                e.closed_at
                    .is_some_and(|t| t.elapsed() > self.closed_retention)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in purgeable {
            sessions.remove(&id);
            events.push(SessionEvent::Purged(id));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(16, &SessionConfig::default())
    }

    #[tokio::test]
    async fn test_attach_transitions_to_active() {
        let registry = registry();
        let session = registry.create_for_host("host", "view-only").await.unwrap();
        assert_eq!(session.state, SessionState::AwaitingClient);

        let attached = registry.attach_client(&session.id, "client-1").await.unwrap();
        assert_eq!(attached.state, SessionState::Active);
        assert_eq!(attached.client_id.as_deref(), Some("client-1"));
    }

    #[tokio::test]
    async fn test_second_client_gets_session_full() {
        let registry = registry();
        let session = registry.create_for_host("host", "view-only").await.unwrap();
        registry.attach_client(&session.id, "client-1").await.unwrap();

        assert_eq!(
            registry
                .attach_client(&session.id, "client-2")
                .await
                .unwrap_err(),
            SessionError::SessionFull
        );
    }

    #[tokio::test]
    async fn test_attach_to_closed_session() {
        let registry = registry();
        let session = registry.create_for_host("host", "view-only").await.unwrap();
        registry.end_session(&session.id, "host_ended").await.unwrap();

        assert_eq!(
            registry
                .attach_client(&session.id, "client-1")
                .await
                .unwrap_err(),
            SessionError::SessionClosed
        );
        assert_eq!(
            registry
                .attach_client("no-such-session", "client-1")
                .await
                .unwrap_err(),
            SessionError::NotFound("no-such-session".to_string())
        );
    }

    #[tokio::test]
    async fn test_concurrent_attach_single_winner() {
        let registry = registry();
        let session = registry.create_for_host("host", "view-only").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            let id = session.id.clone();
            handles.push(tokio::spawn(async move {
                registry.attach_client(&id, &format!("client-{i}")).await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_end_session_retains_closed_entry() {
        let registry = registry();
        let session = registry.create_for_host("host", "view-only").await.unwrap();
        registry.end_session(&session.id, "done").await.unwrap();

        // Second end observes SessionClosed, and the entry is retained so the
        // error is not a spurious NotFound.
        assert_eq!(
            registry.end_session(&session.id, "again").await.unwrap_err(),
            SessionError::SessionClosed
        );
        assert_eq!(
            registry.get(&session.id).await.unwrap().state,
            SessionState::Closed
        );
    }

    #[tokio::test]
    async fn test_suspend_resume_cycle() {
        let registry = registry();
        let session = registry.create_for_host("host", "view-only").await.unwrap();
        registry.attach_client(&session.id, "client-1").await.unwrap();

        registry.mark_suspended(&session.id).await;
        assert_eq!(
            registry.get(&session.id).await.unwrap().state,
            SessionState::Suspended
        );

        registry.resume(&session.id).await;
        assert_eq!(
            registry.get(&session.id).await.unwrap().state,
            SessionState::Active
        );
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_suspended() {
        let config = SessionConfig {
            idle_suspend_secs: 0,
            suspend_close_secs: 0,
            closed_retention_secs: 3600,
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::new(16, &config);
        let session = registry.create_for_host("host", "view-only").await.unwrap();
        registry.attach_client(&session.id, "client-1").await.unwrap();

        // First sweep: Active → Suspended. Second: Suspended → Closed.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let events = registry.sweep().await;
        assert!(matches!(events.as_slice(), [SessionEvent::Suspended(_)]));

        tokio::time::sleep(Duration::from_millis(5)).await;
        let events = registry.sweep().await;
        assert!(matches!(events.as_slice(), [SessionEvent::Closed(_, _)]));
        assert_eq!(
            registry.get(&session.id).await.unwrap().state,
            SessionState::Closed
        );
    }

    #[tokio::test]
    async fn test_profile_in_use_ignores_closed() {
        let registry = registry();
        let session = registry.create_for_host("host", "custom-1").await.unwrap();
        assert!(registry.profile_in_use("custom-1").await);

        registry.end_session(&session.id, "done").await.unwrap();
        assert!(!registry.profile_in_use("custom-1").await);
    }
}
