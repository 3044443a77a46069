//! Unattended-access policy evaluation.
//!
//! Unattended access lets a known client connect without interactive host
//! approval. A profile opts in with `isUnattendedAccess`, and its policy
//! carries an Argon2id password hash, an allow-list of requester identities
//! (empty = any), and an optional time-of-day schedule evaluated in the
//! host's configured UTC offset — never the requester's clock.
//!
//! Deny reasons are specific for audit logging; the secret itself is never
//! logged and never leaves this module unhashed.

use argon2::{Algorithm, Argon2, ParamsBuilder, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::auth::constant_time_eq;
use crate::permissions::PermissionProfile;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Argon2id parameters: 19 MiB, 2 iterations, 1 lane.
fn argon2() -> Result<Argon2<'static>, PolicyError> {
    let params = ParamsBuilder::new()
        .m_cost(19456)
        .t_cost(2)
        .p_cost(1)
        .build()
        .map_err(|e| PolicyError::Hashing(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("password hashing failed: {0}")]
    Hashing(String),
    #[error("secure random source unavailable")]
    RandomnessUnavailable,
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// An opaque salted Argon2id hash, stored as `base64(salt)$base64(hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPassword(String);

/// Hash a plaintext password with a fresh random salt.
pub fn hash_password(plain: &str) -> Result<StoredPassword, PolicyError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|_| PolicyError::RandomnessUnavailable)?;

    let mut hash = [0u8; HASH_LEN];
    argon2()?
        .hash_password_into(plain.as_bytes(), &salt, &mut hash)
        .map_err(|e| PolicyError::Hashing(e.to_string()))?;

    Ok(StoredPassword(format!(
        "{}${}",
        BASE64.encode(salt),
        BASE64.encode(hash)
    )))
}

/// Verify a plaintext password against a stored hash in constant time.
///
/// Malformed stored values verify as `false` rather than erroring — a policy
/// with a corrupt hash must deny, not crash.
pub fn verify_password(plain: &str, stored: &StoredPassword) -> bool {
    let Some((salt_b64, hash_b64)) = stored.0.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (BASE64.decode(salt_b64), BASE64.decode(hash_b64)) else {
        return false;
    };

    let mut computed = [0u8; HASH_LEN];
    let Ok(hasher) = argon2() else { return false };
    if hasher
        .hash_password_into(plain.as_bytes(), &salt, &mut computed)
        .is_err()
    {
        return false;
    }
    constant_time_eq(&expected, &computed)
}

/// Time-of-day access window in the host's configured time zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub days: Vec<Weekday>,
    /// Host-local offset from UTC, in minutes.
    pub utc_offset_minutes: i32,
}

impl Schedule {
    /// Build a schedule from wire-format fields: `"09:00"`-style times and
    /// lowercase day names (`"monday"`).
    pub fn parse(
        start: &str,
        end: &str,
        days: &[String],
        utc_offset_minutes: i32,
    ) -> Result<Self, PolicyError> {
        let start = parse_time(start)?;
        let end = parse_time(end)?;
        if days.is_empty() {
            return Err(PolicyError::InvalidSchedule("no days selected".into()));
        }
        let days = days
            .iter()
            .map(|d| weekday_from_name(d).ok_or_else(|| {
                PolicyError::InvalidSchedule(format!("unknown day {d:?}"))
            }))
            .collect::<Result<Vec<_>, _>>()?;
        if FixedOffset::east_opt(utc_offset_minutes * 60).is_none() {
            return Err(PolicyError::InvalidSchedule(format!(
                "offset {utc_offset_minutes} minutes out of range"
            )));
        }
        Ok(Self {
            start,
            end,
            days,
            utc_offset_minutes,
        })
    }

    /// Whether `now` falls inside the window on an allowed day, in host-local
    /// time.
    pub fn permits(&self, now: DateTime<Utc>) -> bool {
        // Validated at construction.
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_minutes * 60) else {
            return false;
        };
        let local = now.with_timezone(&offset);
        let time = local.time();
        self.days.contains(&local.weekday()) && time >= self.start && time <= self.end
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, PolicyError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| PolicyError::InvalidSchedule(format!("bad time {s:?}")))
}

fn weekday_from_name(name: &str) -> Option<Weekday> {
    match name.to_ascii_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Per-profile unattended-access configuration.
#[derive(Debug, Clone)]
pub struct UnattendedPolicy {
    pub password: StoredPassword,
    /// Requester identities permitted to connect. Empty means any identity.
    pub allowed_users: Vec<String>,
    pub schedule: Option<Schedule>,
}

impl UnattendedPolicy {
    pub fn new(
        plain_password: &str,
        allowed_users: Vec<String>,
        schedule: Option<Schedule>,
    ) -> Result<Self, PolicyError> {
        Ok(Self {
            password: hash_password(plain_password)?,
            allowed_users,
            schedule,
        })
    }
}

/// Outcome of an unattended-access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotEnabled,
    BadPassword,
    UserNotAllowed,
    OutsideSchedule,
}

impl DenyReason {
    /// Error code surfaced to the API and audit log.
    pub fn code(self) -> &'static str {
        match self {
            DenyReason::NotEnabled => "NOT_ENABLED",
            DenyReason::BadPassword => "BAD_PASSWORD",
            DenyReason::UserNotAllowed => "USER_NOT_ALLOWED",
            DenyReason::OutsideSchedule => "OUTSIDE_SCHEDULE",
        }
    }
}

/// Evaluate whether `identity` may connect unattended under `profile` at
/// `now`. Checks run in order: enablement, password, allow-list, schedule;
/// the first failure wins so the audit log records the most specific reason.
pub fn evaluate(
    profile: &PermissionProfile,
    identity: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Access {
    if !profile.is_enabled || !profile.is_unattended_access {
        return Access::Denied(DenyReason::NotEnabled);
    }
    let Some(policy) = &profile.unattended else {
        return Access::Denied(DenyReason::NotEnabled);
    };

    if !verify_password(secret, &policy.password) {
        return Access::Denied(DenyReason::BadPassword);
    }

    if !policy.allowed_users.is_empty()
        && !policy.allowed_users.iter().any(|u| u == identity)
    {
        return Access::Denied(DenyReason::UserNotAllowed);
    }

    if let Some(schedule) = &policy.schedule {
        if !schedule.permits(now) {
            return Access::Denied(DenyReason::OutsideSchedule);
        }
    }

    Access::Allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{PermissionSet, ProfileRegistry};
    use chrono::TimeZone;

    fn unattended_profile(policy: UnattendedPolicy) -> PermissionProfile {
        PermissionProfile {
            id: "p-1".to_string(),
            name: "Unattended".to_string(),
            description: String::new(),
            permissions: PermissionSet::all(),
            is_built_in: false,
            is_enabled: true,
            is_unattended_access: true,
            unattended: Some(policy),
            owner: None,
        }
    }

    fn weekday_schedule() -> Schedule {
        let days: Vec<String> = ["monday", "tuesday", "wednesday", "thursday", "friday"]
            .iter()
            .map(ToString::to_string)
            .collect();
        Schedule::parse("09:00", "17:00", &days, 0).unwrap()
    }

    #[test]
    fn test_password_round_trip() {
        let stored = hash_password("hunter2-hunter2").unwrap();
        assert!(verify_password("hunter2-hunter2", &stored));
        assert!(!verify_password("wrong", &stored));
    }

    #[test]
    fn test_corrupt_stored_hash_denies() {
        assert!(!verify_password("x", &StoredPassword("not-base64".into())));
        assert!(!verify_password("x", &StoredPassword("AAAA$???".into())));
    }

    #[test]
    fn test_schedule_rejects_bad_input() {
        assert!(Schedule::parse("25:00", "17:00", &["monday".into()], 0).is_err());
        assert!(Schedule::parse("09:00", "17:00", &[], 0).is_err());
        assert!(Schedule::parse("09:00", "17:00", &["funday".into()], 0).is_err());
    }

    #[test]
    fn test_weekday_schedule_gates_saturday() {
        let policy =
            UnattendedPolicy::new("s3cret-s3cret", Vec::new(), Some(weekday_schedule()))
                .unwrap();
        let profile = unattended_profile(policy);

        // 2024-06-08 is a Saturday, 2024-06-11 a Tuesday.
        let saturday = Utc.with_ymd_and_hms(2024, 6, 8, 10, 0, 0).unwrap();
        let tuesday = Utc.with_ymd_and_hms(2024, 6, 11, 10, 0, 0).unwrap();

        assert_eq!(
            evaluate(&profile, "alice", "s3cret-s3cret", saturday),
            Access::Denied(DenyReason::OutsideSchedule)
        );
        assert_eq!(
            evaluate(&profile, "alice", "s3cret-s3cret", tuesday),
            Access::Allowed
        );
    }

    #[test]
    fn test_schedule_respects_host_offset() {
        // Window 09:00–17:00 at UTC-5. 21:00 UTC is 16:00 host-local: inside.
        let days: Vec<String> = vec!["tuesday".into()];
        let schedule = Schedule::parse("09:00", "17:00", &days, -300).unwrap();
        let tuesday_evening_utc = Utc.with_ymd_and_hms(2024, 6, 11, 21, 0, 0).unwrap();
        assert!(schedule.permits(tuesday_evening_utc));
        // 23:00 UTC is 18:00 host-local: outside.
        let later = Utc.with_ymd_and_hms(2024, 6, 11, 23, 0, 0).unwrap();
        assert!(!schedule.permits(later));
    }

    #[test]
    fn test_deny_reasons_are_specific() {
        let policy = UnattendedPolicy::new(
            "s3cret-s3cret",
            vec!["alice".to_string()],
            Some(weekday_schedule()),
        )
        .unwrap();
        let tuesday = Utc.with_ymd_and_hms(2024, 6, 11, 10, 0, 0).unwrap();

        let mut profile = unattended_profile(policy);
        assert_eq!(
            evaluate(&profile, "alice", "wrong", tuesday),
            Access::Denied(DenyReason::BadPassword)
        );
        assert_eq!(
            evaluate(&profile, "mallory", "s3cret-s3cret", tuesday),
            Access::Denied(DenyReason::UserNotAllowed)
        );

        profile.is_unattended_access = false;
        assert_eq!(
            evaluate(&profile, "alice", "s3cret-s3cret", tuesday),
            Access::Denied(DenyReason::NotEnabled)
        );
    }

    #[test]
    fn test_empty_allow_list_means_any() {
        let policy = UnattendedPolicy::new("s3cret-s3cret", Vec::new(), None).unwrap();
        let profile = unattended_profile(policy);
        let now = Utc::now();
        assert_eq!(
            evaluate(&profile, "anyone-at-all", "s3cret-s3cret", now),
            Access::Allowed
        );
    }

    #[tokio::test]
    async fn test_builtin_profiles_never_allow_unattended() {
        let registry = ProfileRegistry::with_builtins();
        let profile = registry.get("full-access").await.unwrap();
        assert_eq!(
            evaluate(&profile, "alice", "anything", Utc::now()),
            Access::Denied(DenyReason::NotEnabled)
        );
    }
}
