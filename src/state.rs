//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::config::Config;
use crate::credentials::CredentialIssuer;
use crate::permissions::ProfileRegistry;
use crate::relay::Relay;
use crate::sessions::SessionRegistry;
use crate::transfers::TransferTracker;
use crate::tunnels::TunnelBroker;

/// Shared application state for the vncc server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Permission profiles (built-in + custom).
    pub profiles: ProfileRegistry,
    /// Outstanding pairing codes.
    pub issuer: CredentialIssuer,
    /// Active pairing sessions.
    pub sessions: SessionRegistry,
    /// Per-session signaling bus.
    pub relay: Relay,
    /// Logical TCP port-forward bindings.
    pub tunnels: TunnelBroker,
    /// File-transfer progress tracking for the relay's `file` channel.
    pub transfers: TransferTracker,
    /// Broadcast channel for session lifecycle events (created/attached/
    /// closed). Observability consumers subscribe for real-time updates.
    pub session_events: broadcast::Sender<Value>,
    /// Relay traffic counters and recent endpoint events.
    pub relay_stats: Arc<RelayStats>,
}

/// Relay endpoint event types.
#[derive(Clone, Debug)]
pub enum RelayEventType {
    EndpointAttached,
    EndpointDetached,
    SessionClosed,
}

impl RelayEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndpointAttached => "endpoint_attached",
            Self::EndpointDetached => "endpoint_detached",
            Self::SessionClosed => "session_closed",
        }
    }
}

/// A relay lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct RelayEvent {
    pub timestamp: Instant,
    pub event_type: RelayEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_RELAY_EVENTS: usize = 50;

/// Relay statistics — atomics for lock-free hot-path updates, a Mutex only
/// for the event ring (cold path).
pub struct RelayStats {
    frames_relayed: AtomicU64,
    dropped_best_effort: AtomicU64,
    control_retries: AtomicU64,
    capability_denials: AtomicU64,
    pub events: Mutex<VecDeque<RelayEvent>>,
}

impl RelayStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames_relayed: AtomicU64::new(0),
            dropped_best_effort: AtomicU64::new(0),
            control_retries: AtomicU64::new(0),
            capability_denials: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(MAX_RELAY_EVENTS)),
        }
    }

    pub fn bump_relayed(&self) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_dropped(&self) {
        self.dropped_best_effort.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_retried(&self) {
        self.control_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_denied(&self) {
        self.capability_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_relayed(&self) -> u64 {
        self.frames_relayed.load(Ordering::Relaxed)
    }

    pub fn dropped_best_effort(&self) -> u64 {
        self.dropped_best_effort.load(Ordering::Relaxed)
    }

    pub fn control_retries(&self) -> u64 {
        self.control_retries.load(Ordering::Relaxed)
    }

    pub fn capability_denials(&self) -> u64 {
        self.capability_denials.load(Ordering::Relaxed)
    }

    /// Push an endpoint event, evicting oldest if at capacity.
    pub async fn push_event(&self, event_type: RelayEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_RELAY_EVENTS {
            events.pop_front();
        }
        events.push_back(RelayEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}
