//! File-transfer tracking for the relay's `file` channel.
//!
//! The core never touches the files themselves — chunks ride the relay as
//! opaque payloads between host and client. What the server owns is the
//! transfer's lifecycle: an `offer` registers it, `accept` starts it, chunk
//! acknowledgements advance progress, and `complete`/`abort` finish it. That
//! is enough to enforce the `fileTransfer` capability at the channel gate,
//! report progress over REST, and sweep transfers that stall.
//!
//! Lifecycle: `Offered → Transferring → Complete | Failed | Aborted`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::relay::Role;

/// Transfer lifecycle phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPhase {
    Offered,
    Transferring,
    Complete,
    Failed(String),
    Aborted,
}

impl TransferPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferPhase::Complete | TransferPhase::Failed(_) | TransferPhase::Aborted
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            TransferPhase::Offered => "offered",
            TransferPhase::Transferring => "transferring",
            TransferPhase::Complete => "complete",
            TransferPhase::Failed(_) => "failed",
            TransferPhase::Aborted => "aborted",
        }
    }
}

/// An `offer` message's fields, as carried on the `file` channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOffer {
    pub filename: String,
    pub file_size: u64,
    /// Whole-file hash computed by the sending endpoint; carried opaquely.
    #[serde(default)]
    pub file_hash: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

/// Progress snapshot returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub transfer_id: String,
    pub session_id: String,
    pub offered_by: Role,
    pub filename: String,
    pub file_size: u64,
    pub phase: String,
    pub chunks_done: u32,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer {0} not found")]
    NotFound(String),
    #[error("invalid transfer offer: {0}")]
    InvalidOffer(String),
    #[error("chunk index {index} out of range (total {total})")]
    InvalidChunk { index: u32, total: u32 },
    #[error("transfer incomplete: {done}/{total} chunks")]
    Incomplete { done: u32, total: u32 },
    #[error("transfer already finished")]
    AlreadyFinished,
    #[error("concurrent transfer limit reached (max {0})")]
    TooManyTransfers(usize),
}

struct TransferEntry {
    session_id: String,
    offered_by: Role,
    filename: String,
    file_size: u64,
    #[allow(dead_code)]
    file_hash: String,
    total_chunks: u32,
    phase: TransferPhase,
    chunks_done: Vec<bool>,
    bytes_transferred: u64,
    last_activity: Instant,
    /// Set when the transfer reaches a terminal phase, for purge accounting.
    ended_at: Option<Instant>,
}

impl TransferEntry {
    fn done_count(&self) -> u32 {
        self.chunks_done.iter().filter(|d| **d).count() as u32
    }

    fn snapshot(&self, id: &str) -> TransferSnapshot {
        TransferSnapshot {
            transfer_id: id.to_string(),
            session_id: self.session_id.clone(),
            offered_by: self.offered_by,
            filename: self.filename.clone(),
            file_size: self.file_size,
            phase: self.phase.as_str().to_string(),
            chunks_done: self.done_count(),
            total_chunks: self.total_chunks,
            bytes_transferred: self.bytes_transferred,
        }
    }
}

/// Owns the set of tracked transfers and their lifecycle.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct TransferTracker {
    transfers: Arc<RwLock<HashMap<String, TransferEntry>>>,
    max_per_session: usize,
    stale_timeout: Duration,
    ended_retention: Duration,
}

impl TransferTracker {
    pub fn new(max_per_session: usize, stale_timeout_secs: u64, ended_retention_secs: u64) -> Self {
        Self {
            transfers: Arc::new(RwLock::new(HashMap::new())),
            max_per_session,
            stale_timeout: Duration::from_secs(stale_timeout_secs),
            ended_retention: Duration::from_secs(ended_retention_secs),
        }
    }

    /// Register an offered transfer. Returns the fresh transfer id.
    pub async fn offer(
        &self,
        session_id: &str,
        offered_by: Role,
        offer: &TransferOffer,
    ) -> Result<String, TransferError> {
        if offer.total_chunks == 0 {
            return Err(TransferError::InvalidOffer("zero chunks".into()));
        }
        if offer.filename.is_empty() {
            return Err(TransferError::InvalidOffer("empty filename".into()));
        }
        let span = u64::from(offer.chunk_size) * u64::from(offer.total_chunks);
        if offer.chunk_size == 0 || span < offer.file_size {
            return Err(TransferError::InvalidOffer(format!(
                "{} chunks of {} bytes cannot carry {} bytes",
                offer.total_chunks, offer.chunk_size, offer.file_size
            )));
        }

        let mut transfers = self.transfers.write().await;

        let active = transfers
            .values()
            .filter(|t| t.session_id == session_id && !t.phase.is_terminal())
            .count();
        if active >= self.max_per_session {
            return Err(TransferError::TooManyTransfers(self.max_per_session));
        }

        let id = Uuid::new_v4().to_string();
        transfers.insert(
            id.clone(),
            TransferEntry {
                session_id: session_id.to_string(),
                offered_by,
                filename: offer.filename.clone(),
                file_size: offer.file_size,
                file_hash: offer.file_hash.clone(),
                total_chunks: offer.total_chunks,
                phase: TransferPhase::Offered,
                chunks_done: vec![false; offer.total_chunks as usize],
                bytes_transferred: 0,
                last_activity: Instant::now(),
                ended_at: None,
            },
        );

        info!(
            "Transfer {id} offered on session {session_id}: {} ({} bytes, {} chunks)",
            offer.filename, offer.file_size, offer.total_chunks
        );
        Ok(id)
    }

    /// The receiving side accepted the offer: `Offered → Transferring`.
    pub async fn accept(&self, transfer_id: &str) -> Result<(), TransferError> {
        let mut transfers = self.transfers.write().await;
        let entry = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        if entry.phase.is_terminal() {
            return Err(TransferError::AlreadyFinished);
        }
        entry.phase = TransferPhase::Transferring;
        entry.last_activity = Instant::now();
        Ok(())
    }

    /// Record a delivered chunk.
    pub async fn record_chunk(
        &self,
        transfer_id: &str,
        chunk_index: u32,
        bytes: u64,
    ) -> Result<(), TransferError> {
        let mut transfers = self.transfers.write().await;
        let entry = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        if entry.phase.is_terminal() {
            return Err(TransferError::AlreadyFinished);
        }
        if chunk_index >= entry.total_chunks {
            return Err(TransferError::InvalidChunk {
                index: chunk_index,
                total: entry.total_chunks,
            });
        }

        if !entry.chunks_done[chunk_index as usize] {
            entry.chunks_done[chunk_index as usize] = true;
            entry.bytes_transferred += bytes;
        }
        entry.phase = TransferPhase::Transferring;
        entry.last_activity = Instant::now();
        Ok(())
    }

    /// Finish a transfer. Fails with `Incomplete` unless every chunk was
    /// recorded.
    pub async fn complete(&self, transfer_id: &str) -> Result<TransferSnapshot, TransferError> {
        let mut transfers = self.transfers.write().await;
        let entry = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        if entry.phase.is_terminal() {
            return Err(TransferError::AlreadyFinished);
        }

        let done = entry.done_count();
        if done < entry.total_chunks {
            return Err(TransferError::Incomplete {
                done,
                total: entry.total_chunks,
            });
        }

        entry.phase = TransferPhase::Complete;
        entry.ended_at = Some(Instant::now());
        info!("Transfer {transfer_id} complete ({} bytes)", entry.bytes_transferred);
        Ok(entry.snapshot(transfer_id))
    }

    /// Abort a transfer from either side.
    pub async fn abort(&self, transfer_id: &str, reason: &str) -> Result<(), TransferError> {
        let mut transfers = self.transfers.write().await;
        let entry = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        if entry.phase.is_terminal() {
            return Err(TransferError::AlreadyFinished);
        }
        entry.phase = TransferPhase::Aborted;
        entry.ended_at = Some(Instant::now());
        info!("Transfer {transfer_id} aborted: {reason}");
        Ok(())
    }

    /// Progress snapshots for a session, oldest first.
    pub async fn list_session(&self, session_id: &str) -> Vec<TransferSnapshot> {
        let transfers = self.transfers.read().await;
        let mut entries: Vec<(&String, &TransferEntry)> = transfers
            .iter()
            .filter(|(_, t)| t.session_id == session_id)
            .collect();
        entries.sort_by_key(|(_, t)| t.last_activity);
        entries.iter().map(|(id, t)| t.snapshot(id)).collect()
    }

    /// Fail all in-flight transfers for a closing session.
    pub async fn close_session(&self, session_id: &str) {
        let mut transfers = self.transfers.write().await;
        let mut failed = 0;
        for entry in transfers.values_mut() {
            if entry.session_id == session_id && !entry.phase.is_terminal() {
                entry.phase = TransferPhase::Failed("session closed".to_string());
                entry.ended_at = Some(Instant::now());
                failed += 1;
            }
        }
        if failed > 0 {
            info!("Failed {failed} in-flight transfer(s) with session {session_id}");
        }
    }

    /// Periodic sweep: fail transfers with no chunk activity inside the stale
    /// window, and drop terminal entries past the retention grace.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let mut transfers = self.transfers.write().await;
        let mut stale = Vec::new();

        for (id, entry) in transfers.iter_mut() {
            if !entry.phase.is_terminal() && entry.last_activity.elapsed() > self.stale_timeout {
                entry.phase = TransferPhase::Failed("stale".to_string());
                entry.ended_at = Some(Instant::now());
                warn!("Transfer {id} failed: no activity");
                stale.push(id.clone());
            }
        }

        transfers.retain(|_, t| {
            t.ended_at
                .map_or(true, |at| at.elapsed() <= self.ended_retention)
        });

        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> TransferTracker {
        TransferTracker::new(4, 120, 3600)
    }

    fn offer(chunks: u32) -> TransferOffer {
        TransferOffer {
            filename: "report.pdf".to_string(),
            file_size: u64::from(chunks) * 1024,
            file_hash: "abc123".to_string(),
            chunk_size: 1024,
            total_chunks: chunks,
        }
    }

    #[tokio::test]
    async fn test_offer_validation() {
        let tracker = tracker();
        let mut bad = offer(0);
        assert!(matches!(
            tracker.offer("s-1", Role::Host, &bad).await.unwrap_err(),
            TransferError::InvalidOffer(_)
        ));

        bad = offer(2);
        bad.file_size = 10_000; // 2 × 1024 can't carry 10 000 bytes
        assert!(matches!(
            tracker.offer("s-1", Role::Host, &bad).await.unwrap_err(),
            TransferError::InvalidOffer(_)
        ));
    }

    #[tokio::test]
    async fn test_complete_requires_all_chunks() {
        let tracker = tracker();
        let id = tracker.offer("s-1", Role::Host, &offer(3)).await.unwrap();
        tracker.accept(&id).await.unwrap();

        tracker.record_chunk(&id, 0, 1024).await.unwrap();
        tracker.record_chunk(&id, 1, 1024).await.unwrap();
        assert_eq!(
            tracker.complete(&id).await.unwrap_err(),
            TransferError::Incomplete { done: 2, total: 3 }
        );

        tracker.record_chunk(&id, 2, 1024).await.unwrap();
        let snapshot = tracker.complete(&id).await.unwrap();
        assert_eq!(snapshot.phase, "complete");
        assert_eq!(snapshot.bytes_transferred, 3072);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_counted_once() {
        let tracker = tracker();
        let id = tracker.offer("s-1", Role::Client, &offer(2)).await.unwrap();
        tracker.record_chunk(&id, 0, 1024).await.unwrap();
        tracker.record_chunk(&id, 0, 1024).await.unwrap();

        let snapshot = &tracker.list_session("s-1").await[0];
        assert_eq!(snapshot.chunks_done, 1);
        assert_eq!(snapshot.bytes_transferred, 1024);
    }

    #[tokio::test]
    async fn test_chunk_out_of_range() {
        let tracker = tracker();
        let id = tracker.offer("s-1", Role::Host, &offer(2)).await.unwrap();
        assert_eq!(
            tracker.record_chunk(&id, 5, 1024).await.unwrap_err(),
            TransferError::InvalidChunk { index: 5, total: 2 }
        );
    }

    #[tokio::test]
    async fn test_per_session_limit() {
        let tracker = TransferTracker::new(1, 120, 3600);
        tracker.offer("s-1", Role::Host, &offer(1)).await.unwrap();
        assert_eq!(
            tracker.offer("s-1", Role::Host, &offer(1)).await.unwrap_err(),
            TransferError::TooManyTransfers(1)
        );
        // Other sessions are unaffected.
        assert!(tracker.offer("s-2", Role::Host, &offer(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_close_fails_in_flight() {
        let tracker = tracker();
        let id = tracker.offer("s-1", Role::Host, &offer(2)).await.unwrap();
        tracker.close_session("s-1").await;

        assert_eq!(
            tracker.record_chunk(&id, 0, 1024).await.unwrap_err(),
            TransferError::AlreadyFinished
        );
        assert_eq!(tracker.list_session("s-1").await[0].phase, "failed");
    }

    #[tokio::test]
    async fn test_stale_sweep() {
        let tracker = TransferTracker::new(4, 0, 3600);
        tracker.offer("s-1", Role::Host, &offer(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let stale = tracker.sweep_stale().await;
        assert_eq!(stale.len(), 1);
        assert_eq!(tracker.list_session("s-1").await[0].phase, "failed");
    }
}
