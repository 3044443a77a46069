//! Signaling relay — the in-session message bus between host and client.
//!
//! Each session has at most two logical endpoints (host, client), each backed
//! by an mpsc queue drained by its WebSocket connection. Frames are JSON
//! objects `{channel, payload, senderRole, ts}` multiplexed over six
//! channels: `chat`, `clipboard`, `file`, `whiteboard`, `tunnel`, `control`.
//!
//! Delivery semantics:
//!
//! - **Best-effort channels** (everything but `control`): delivered to the
//!   opposite endpoint if attached, dropped otherwise. Drops are counted in
//!   [`RelayStats`], never surfaced to the sender.
//! - **`control`**: queued per recipient with a sequence number and retried
//!   until the recipient acknowledges (`ack` control frame echoing `seq`) or
//!   the session closes. Pending frames are flushed on endpoint attach.
//!
//! Ordering: one queue per endpoint, so frames within a channel arrive in
//! send order (cross-channel order is incidental and not guaranteed).
//!
//! Capability gating: hosts are always privileged; a client frame on a gated
//! channel is rejected with `CapabilityDenied` unless the session's resolved
//! profile grants the channel's capability.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::permissions::{resolve, Capability, PermissionProfile};
use crate::state::RelayStats;

/// Multiplexed relay channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Chat,
    Clipboard,
    File,
    Whiteboard,
    Tunnel,
    Control,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Chat => "chat",
            Channel::Clipboard => "clipboard",
            Channel::File => "file",
            Channel::Whiteboard => "whiteboard",
            Channel::Tunnel => "tunnel",
            Channel::Control => "control",
        }
    }

    /// Capability a client must hold to send on this channel. Chat and
    /// control are never gated.
    pub fn required_capability(self) -> Option<Capability> {
        match self {
            Channel::Chat | Channel::Control => None,
            Channel::Clipboard => Some(Capability::Clipboard),
            Channel::File => Some(Capability::FileTransfer),
            Channel::Whiteboard => Some(Capability::Whiteboard),
            Channel::Tunnel => Some(Capability::TcpTunneling),
        }
    }
}

/// Which side of the session an endpoint represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Client,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Host => Role::Client,
            Role::Client => Role::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-session message as submitted by an endpoint.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub session_id: String,
    pub channel: Channel,
    pub payload: Value,
    pub sender_role: Role,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("session {0} has no relay registration")]
    SessionUnknown(String),
    #[error("{0} endpoint already attached")]
    EndpointBusy(Role),
    #[error("capability {0} not granted for this session")]
    CapabilityDenied(&'static str),
}

struct PendingControl {
    to: Role,
    frame: Value,
    queued_at: Instant,
    attempts: u32,
}

#[derive(Default)]
struct SessionRelay {
    host: Option<mpsc::Sender<Value>>,
    client: Option<mpsc::Sender<Value>>,
    next_seq: u64,
    pending: HashMap<u64, PendingControl>,
}

impl SessionRelay {
    fn endpoint(&self, role: Role) -> Option<&mpsc::Sender<Value>> {
        match role {
            Role::Host => self.host.as_ref(),
            Role::Client => self.client.as_ref(),
        }
    }
}

/// The relay — per-session endpoint pairs plus the control retry queue.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct Relay {
    sessions: Arc<RwLock<HashMap<String, SessionRelay>>>,
    stats: Arc<RelayStats>,
    queue_depth: usize,
    retry_after: Duration,
}

fn frame(channel: Channel, payload: &Value, sender_role: Role, seq: Option<u64>) -> Value {
    let mut frame = json!({
        "channel": channel.as_str(),
        "payload": payload,
        "senderRole": sender_role.as_str(),
        "ts": Utc::now().timestamp_millis(),
    });
    if let Some(seq) = seq {
        frame["seq"] = json!(seq);
    }
    frame
}

impl Relay {
    pub fn new(stats: Arc<RelayStats>, queue_depth: usize, retry_after_secs: u64) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            stats,
            queue_depth,
            retry_after: Duration::from_secs(retry_after_secs),
        }
    }

    /// Register a session with the relay. Called when the session is created.
    pub async fn register(&self, session_id: &str) {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default();
    }

    /// Attach an endpoint for `role`, returning the queue its WebSocket
    /// drains. Pending control frames addressed to the role are flushed.
    pub async fn attach(
        &self,
        session_id: &str,
        role: Role,
    ) -> Result<mpsc::Receiver<Value>, RelayError> {
        let mut sessions = self.sessions.write().await;
        let relay = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::SessionUnknown(session_id.to_string()))?;

        if relay.endpoint(role).is_some() {
            return Err(RelayError::EndpointBusy(role));
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        // Flush pending control frames in seq order.
        let mut due: Vec<(&u64, &PendingControl)> =
            relay.pending.iter().filter(|(_, p)| p.to == role).collect();
        due.sort_by_key(|(seq, _)| **seq);
        for (_, pending) in due {
            let _ = tx.try_send(pending.frame.clone());
        }
        match role {
            Role::Host => relay.host = Some(tx),
            Role::Client => relay.client = Some(tx),
        }

        info!("Session {session_id}: {role} endpoint attached");
        Ok(rx)
    }

    /// Detach an endpoint (WebSocket closed). Pending control frames stay
    /// queued for re-delivery on reconnect.
    pub async fn detach(&self, session_id: &str, role: Role) {
        let mut sessions = self.sessions.write().await;
        if let Some(relay) = sessions.get_mut(session_id) {
            match role {
                Role::Host => relay.host = None,
                Role::Client => relay.client = None,
            }
            info!("Session {session_id}: {role} endpoint detached");
        }
    }

    /// Relay a message to the opposite endpoint, enforcing the channel's
    /// capability grant for client senders.
    pub async fn send(
        &self,
        profile: &PermissionProfile,
        msg: RelayMessage,
    ) -> Result<(), RelayError> {
        if msg.sender_role == Role::Client {
            if let Some(cap) = msg.channel.required_capability() {
                if !resolve(profile, cap) {
                    self.stats.bump_denied();
                    return Err(RelayError::CapabilityDenied(cap.as_str()));
                }
            }
        }

        if msg.channel == Channel::Control {
            return self
                .queue_control(
                    &msg.session_id,
                    msg.sender_role.opposite(),
                    msg.sender_role,
                    &msg.payload,
                )
                .await;
        }

        let sessions = self.sessions.read().await;
        let relay = sessions
            .get(&msg.session_id)
            .ok_or_else(|| RelayError::SessionUnknown(msg.session_id.clone()))?;

        let delivered = frame(msg.channel, &msg.payload, msg.sender_role, None);
        match relay.endpoint(msg.sender_role.opposite()) {
            Some(tx) if tx.try_send(delivered).is_ok() => {
                self.stats.bump_relayed();
            }
            _ => {
                // Best-effort: recipient absent or backpressured. Counted,
                // never surfaced to the sender.
                self.stats.bump_dropped();
                debug!(
                    "Session {}: dropped {} frame (no recipient)",
                    msg.session_id,
                    msg.channel.as_str()
                );
            }
        }
        Ok(())
    }

    /// Queue a server-originated control frame for `to`, retried until acked.
    pub async fn send_control(
        &self,
        session_id: &str,
        to: Role,
        payload: &Value,
    ) -> Result<(), RelayError> {
        self.queue_control(session_id, to, to.opposite(), payload)
            .await
    }

    async fn queue_control(
        &self,
        session_id: &str,
        to: Role,
        sender_role: Role,
        payload: &Value,
    ) -> Result<(), RelayError> {
        let mut sessions = self.sessions.write().await;
        let relay = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::SessionUnknown(session_id.to_string()))?;

        relay.next_seq += 1;
        let seq = relay.next_seq;
        let framed = frame(Channel::Control, payload, sender_role, Some(seq));

        if let Some(tx) = relay.endpoint(to) {
            if tx.try_send(framed.clone()).is_ok() {
                self.stats.bump_relayed();
            }
        }
        relay.pending.insert(
            seq,
            PendingControl {
                to,
                frame: framed,
                queued_at: Instant::now(),
                attempts: 1,
            },
        );
        Ok(())
    }

    /// Acknowledge a control frame. `from` is the role that received it.
    pub async fn ack(&self, session_id: &str, from: Role, seq: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(relay) = sessions.get_mut(session_id) {
            if let Some(pending) = relay.pending.get(&seq) {
                if pending.to == from {
                    relay.pending.remove(&seq);
                }
            }
        }
    }

    /// Number of unacknowledged control frames for a session.
    pub async fn pending_control(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, |r| r.pending.len())
    }

    /// Periodic retry of unacknowledged control frames.
    pub async fn retry_pending(&self) {
        let mut sessions = self.sessions.write().await;
        for (session_id, relay) in sessions.iter_mut() {
            let due: Vec<u64> = relay
                .pending
                .iter()
                .filter(|(_, p)| p.queued_at.elapsed() >= self.retry_after)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in due {
                let Some(pending) = relay.pending.get(&seq) else {
                    continue;
                };
                let (to, framed) = (pending.to, pending.frame.clone());
                if let Some(tx) = relay.endpoint(to) {
                    if tx.try_send(framed).is_ok() {
                        self.stats.bump_retried();
                        debug!("Session {session_id}: control seq {seq} re-sent to {to}");
                    }
                }
                if let Some(pending) = relay.pending.get_mut(&seq) {
                    pending.queued_at = Instant::now();
                    pending.attempts += 1;
                    if pending.attempts % 10 == 0 {
                        warn!(
                            "Session {session_id}: control seq {seq} unacked after {} attempts",
                            pending.attempts
                        );
                    }
                }
            }
        }
    }

    /// Drop all relay state for a session, abandoning its pending control
    /// frames. A final best-effort close frame is pushed to both endpoints.
    pub async fn close_session(&self, session_id: &str, reason: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(relay) = sessions.remove(session_id) {
            let payload = json!({"type": "session.closed", "reason": reason});
            for (tx, sender) in [
                (relay.client.as_ref(), Role::Host),
                (relay.host.as_ref(), Role::Client),
            ] {
                if let Some(tx) = tx {
                    let _ = tx.try_send(frame(Channel::Control, &payload, sender, None));
                }
            }
            info!("Session {session_id}: relay closed ({reason})");
        }
    }

    /// Whether an endpoint is currently attached for `role`.
    pub async fn is_attached(&self, session_id: &str, role: Role) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|r| r.endpoint(role).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::ProfileRegistry;

    fn relay() -> Relay {
        Relay::new(Arc::new(RelayStats::new()), 64, 0)
    }

    fn msg(session_id: &str, channel: Channel, sender_role: Role) -> RelayMessage {
        RelayMessage {
            session_id: session_id.to_string(),
            channel,
            payload: json!({"text": "hi"}),
            sender_role,
        }
    }

    async fn full_access() -> PermissionProfile {
        ProfileRegistry::with_builtins()
            .get("full-access")
            .await
            .unwrap()
    }

    async fn view_only() -> PermissionProfile {
        ProfileRegistry::with_builtins()
            .get("view-only")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_view_only_client_denied_on_tunnel_channel() {
        let relay = relay();
        relay.register("s-1").await;
        let profile = view_only().await;

        let err = relay
            .send(&profile, msg("s-1", Channel::Tunnel, Role::Client))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::CapabilityDenied("tcpTunneling"));

        // Chat is never gated.
        assert!(relay
            .send(&profile, msg("s-1", Channel::Chat, Role::Client))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_host_is_always_privileged() {
        let relay = relay();
        relay.register("s-1").await;
        let profile = view_only().await;

        assert!(relay
            .send(&profile, msg("s-1", Channel::Clipboard, Role::Host))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_frames_arrive_in_send_order() {
        let relay = relay();
        relay.register("s-1").await;
        let profile = full_access().await;
        let mut rx = relay.attach("s-1", Role::Client).await.unwrap();

        for i in 0..5 {
            let mut m = msg("s-1", Channel::Chat, Role::Host);
            m.payload = json!({"n": i});
            relay.send(&profile, m).await.unwrap();
        }
        for i in 0..5 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame["payload"]["n"], i);
            assert_eq!(frame["channel"], "chat");
            assert_eq!(frame["senderRole"], "host");
        }
    }

    #[tokio::test]
    async fn test_best_effort_drop_counted_not_surfaced() {
        let stats = Arc::new(RelayStats::new());
        let relay = Relay::new(Arc::clone(&stats), 64, 0);
        relay.register("s-1").await;
        let profile = full_access().await;

        // No client attached: chat frame is dropped, send still succeeds.
        assert!(relay
            .send(&profile, msg("s-1", Channel::Chat, Role::Host))
            .await
            .is_ok());
        assert_eq!(stats.dropped_best_effort(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_attach_rejected() {
        let relay = relay();
        relay.register("s-1").await;
        let _rx = relay.attach("s-1", Role::Host).await.unwrap();

        assert_eq!(
            relay.attach("s-1", Role::Host).await.unwrap_err(),
            RelayError::EndpointBusy(Role::Host)
        );
    }

    #[tokio::test]
    async fn test_control_retried_until_acked() {
        let relay = relay();
        relay.register("s-1").await;

        // Queued while the client is away.
        relay
            .send_control("s-1", Role::Client, &json!({"type": "profile.changed"}))
            .await
            .unwrap();
        assert_eq!(relay.pending_control("s-1").await, 1);

        // Flushed on attach, still pending until acked.
        let mut rx = relay.attach("s-1", Role::Client).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame["channel"], "control");
        let seq = frame["seq"].as_u64().unwrap();
        assert_eq!(relay.pending_control("s-1").await, 1);

        // Ack from the wrong role is ignored.
        relay.ack("s-1", Role::Host, seq).await;
        assert_eq!(relay.pending_control("s-1").await, 1);

        relay.ack("s-1", Role::Client, seq).await;
        assert_eq!(relay.pending_control("s-1").await, 0);
    }

    #[tokio::test]
    async fn test_retry_pending_redelivers() {
        let relay = relay(); // retry_after = 0: every pending frame is due
        relay.register("s-1").await;
        let mut rx = relay.attach("s-1", Role::Client).await.unwrap();

        relay
            .send_control("s-1", Role::Client, &json!({"type": "tunnel.open"}))
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();

        relay.retry_pending().await;
        let second = rx.recv().await.unwrap();
        assert_eq!(first["seq"], second["seq"]);
    }

    #[tokio::test]
    async fn test_pairing_flow_gates_view_only_client() {
        use crate::config::SessionConfig;
        use crate::credentials::CredentialIssuer;
        use crate::sessions::SessionRegistry;

        let profiles = ProfileRegistry::with_builtins();
        let issuer = CredentialIssuer::new(600);
        let registry = SessionRegistry::new(16, &SessionConfig::default());
        let relay = relay();

        // Host requests a code bound to a view-only session.
        let session = registry.create_for_host("host", "view-only").await.unwrap();
        relay.register(&session.id).await;
        let credential = issuer.issue(&session.id, "view-only", None).await.unwrap();

        // Client redeems and attaches.
        let redeemed = issuer.redeem(&credential.code).await.unwrap();
        let session = registry
            .attach_client(&redeemed.host_session_id, "client-1")
            .await
            .unwrap();

        // A view-only client cannot open the tunnel channel.
        let profile = profiles.get(&session.profile_id).await.unwrap();
        let err = relay
            .send(&profile, msg(&session.id, Channel::Tunnel, Role::Client))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::CapabilityDenied("tcpTunneling"));
    }

    #[tokio::test]
    async fn test_close_session_abandons_pending() {
        let relay = relay();
        relay.register("s-1").await;
        relay
            .send_control("s-1", Role::Client, &json!({"type": "x"}))
            .await
            .unwrap();

        relay.close_session("s-1", "host_ended").await;
        assert_eq!(relay.pending_control("s-1").await, 0);
        assert_eq!(
            relay
                .send_control("s-1", Role::Client, &json!({"type": "y"}))
                .await
                .unwrap_err(),
            RelayError::SessionUnknown("s-1".to_string())
        );
    }
}
