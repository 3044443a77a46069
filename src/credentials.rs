//! Access credential issuance and redemption.
//!
//! A credential is a short-lived 9-character pairing code that authorizes one
//! client to join one host session under a fixed permission profile. Codes
//! come from the OS CSPRNG, never a weaker source; generation retries on
//! collision against outstanding codes.
//!
//! ## Concurrency
//!
//! The credential table is behind an `RwLock`. `redeem` holds the write lock
//! across lookup, expiry check, and the consumed flip, so redemption is
//! at-most-once even under concurrent redeemers: exactly one caller observes
//! `consumed == false` and wins.
//!
//! Expired codes are purged lazily on lookup (reporting `Expired`, which is
//! distinguishable from `NotFound`) and by the periodic sweep.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// Codes are 9 uppercase alphanumeric characters, displayed in 3-char groups.
pub const CODE_LEN: usize = 9;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A pairing code bound to a host session and permission profile.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCredential {
    pub code: String,
    pub host_session_id: String,
    pub profile_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("unknown access code")]
    NotFound,
    #[error("access code expired")]
    Expired,
    #[error("access code already consumed")]
    AlreadyConsumed,
    /// The OS CSPRNG failed. Fatal — there is no fallback source.
    #[error("secure random source unavailable")]
    RandomnessUnavailable,
}

/// Issues and redeems access credentials.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct CredentialIssuer {
    credentials: Arc<RwLock<HashMap<String, AccessCredential>>>,
    default_ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(default_ttl_secs: u64) -> Self {
        Self {
            credentials: Arc::new(RwLock::new(HashMap::new())),
            default_ttl: Duration::seconds(default_ttl_secs as i64),
        }
    }

    /// Issue a credential for `host_session_id` under `profile_id`.
    ///
    /// Holds the write lock through code generation so a colliding code can
    /// never be handed out twice.
    pub async fn issue(
        &self,
        host_session_id: &str,
        profile_id: &str,
        ttl: Option<Duration>,
    ) -> Result<AccessCredential, CredentialError> {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);

        let mut credentials = self.credentials.write().await;
        let code = loop {
            let candidate = generate_code()?;
            if !credentials.contains_key(&candidate) {
                break candidate;
            }
        };

        let credential = AccessCredential {
            code: code.clone(),
            host_session_id: host_session_id.to_string(),
            profile_id: profile_id.to_string(),
            issued_at: now,
            expires_at: now + ttl,
            consumed: false,
        };
        credentials.insert(code, credential.clone());

        info!(
            "Credential issued for session {host_session_id} (profile {profile_id}, \
             expires {})",
            credential.expires_at
        );
        Ok(credential)
    }

    /// Redeem a code, marking it consumed. At-most-once: of two concurrent
    /// redeemers, exactly one receives the credential.
    pub async fn redeem(&self, code: &str) -> Result<AccessCredential, CredentialError> {
        let code = normalize_code(code);
        let now = Utc::now();

        let mut credentials = self.credentials.write().await;
        let credential = credentials.get_mut(&code).ok_or(CredentialError::NotFound)?;

        if now >= credential.expires_at {
            // Lazy purge. The caller still learns this was a real, expired
            // code rather than an unknown one.
            credentials.remove(&code);
            return Err(CredentialError::Expired);
        }
        if credential.consumed {
            return Err(CredentialError::AlreadyConsumed);
        }

        credential.consumed = true;
        let redeemed = credential.clone();
        info!("Credential redeemed for session {}", redeemed.host_session_id);
        Ok(redeemed)
    }

    /// Drop expired credentials. Returns how many were purged.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut credentials = self.credentials.write().await;
        let before = credentials.len();
        credentials.retain(|_, c| now < c.expires_at);
        let purged = before - credentials.len();
        if purged > 0 {
            info!("Purged {purged} expired credential(s)");
        }
        purged
    }

    /// Number of outstanding (unexpired, unconsumed or consumed) codes.
    pub async fn outstanding(&self) -> usize {
        self.credentials.read().await.len()
    }
}

/// Generate a 9-char uppercase alphanumeric code from the OS CSPRNG.
///
/// Rejection sampling keeps the per-character distribution uniform — a plain
/// modulo over 256 would bias toward the low end of the alphabet.
pub fn generate_code() -> Result<String, CredentialError> {
    // 252 is the largest multiple of 36 below 256.
    const LIMIT: u8 = 252;

    let mut code = String::with_capacity(CODE_LEN);
    let mut buf = [0u8; 16];
    while code.len() < CODE_LEN {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|_| CredentialError::RandomnessUnavailable)?;
        for byte in buf {
            if byte < LIMIT && code.len() < CODE_LEN {
                code.push(CODE_ALPHABET[(byte % 36) as usize] as char);
            }
        }
    }
    Ok(code)
}

/// Strip group separators and upcase, so `abc-def-ghi` redeems as `ABCDEFGHI`.
pub fn normalize_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Format a code in 3-char groups for display: `ABCDEFGHI` → `ABC-DEF-GHI`.
pub fn format_code(code: &str) -> String {
    code.as_bytes()
        .chunks(3)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_code_shape() {
        for _ in 0..50 {
            let code = generate_code().unwrap();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_format_and_normalize_round_trip() {
        assert_eq!(format_code("ABCDEFGHI"), "ABC-DEF-GHI");
        assert_eq!(normalize_code("abc-def-ghi"), "ABCDEFGHI");
        assert_eq!(normalize_code(" ABC DEF GHI "), "ABCDEFGHI");
    }

    #[tokio::test]
    async fn test_redeem_is_at_most_once() {
        let issuer = CredentialIssuer::new(600);
        let credential = issuer.issue("s-1", "full-access", None).await.unwrap();

        let first = issuer.redeem(&credential.code).await;
        assert!(first.is_ok());
        assert!(first.unwrap().consumed);

        assert_eq!(
            issuer.redeem(&credential.code).await.unwrap_err(),
            CredentialError::AlreadyConsumed
        );
    }

    #[tokio::test]
    async fn test_concurrent_redeem_single_winner() {
        let issuer = CredentialIssuer::new(600);
        let credential = issuer.issue("s-1", "full-access", None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let issuer = issuer.clone();
            let code = credential.code.clone();
            handles.push(tokio::spawn(async move { issuer.redeem(&code).await }));
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
    async fn test_expired_is_distinguishable_from_not_found() {
        let issuer = CredentialIssuer::new(600);
        let credential = issuer
            .issue("s-1", "full-access", Some(Duration::seconds(-1)))
            .await
            .unwrap();

        assert_eq!(
            issuer.redeem(&credential.code).await.unwrap_err(),
            CredentialError::Expired
        );
        // The lazy purge removed it; a later attempt is a genuine miss.
        assert_eq!(
            issuer.redeem(&credential.code).await.unwrap_err(),
            CredentialError::NotFound
        );
        assert_eq!(
            issuer.redeem("ZZZZZZZZZ").await.unwrap_err(),
            CredentialError::NotFound
        );
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_only() {
        let issuer = CredentialIssuer::new(600);
        issuer
            .issue("s-old", "view-only", Some(Duration::seconds(-1)))
            .await
            .unwrap();
        let live = issuer.issue("s-new", "view-only", None).await.unwrap();

        assert_eq!(issuer.sweep_expired().await, 1);
        assert_eq!(issuer.outstanding().await, 1);
        assert!(issuer.redeem(&live.code).await.is_ok());
    }
}
