//! API error taxonomy.
//!
//! Every component reports failures through its own typed error enum; this
//! module folds them into [`ApiError`], which renders the wire shape
//! `{"error": <message>, "code": <CODE>}` with the matching HTTP status.
//! Callers never see a silent recovery — the only losses the API absorbs are
//! best-effort relay drops, which are counted in `RelayStats` instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::permissions::ProfileError;
use crate::relay::RelayError;
use crate::sessions::SessionError;
use crate::transfers::TransferError;
use crate::tunnels::TunnelError;
use crate::unattended::{DenyReason, PolicyError};

#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad input shape — rejected before any state is touched.
    #[error("{0}")]
    Validation(String),
    #[error("{kind} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("session already has a client attached")]
    SessionFull,
    #[error("session is closed")]
    SessionClosed,
    #[error("access code already consumed")]
    AlreadyConsumed,
    #[error("access code expired")]
    Expired,
    #[error("local port {0} already bound for this session")]
    PortInUse(u16),
    #[error("profile is in use by a live session")]
    ProfileInUse,
    #[error("{0} endpoint already attached")]
    EndpointBusy(&'static str),
    #[error("profile name is empty or already taken")]
    InvalidName,
    #[error("built-in profiles cannot be modified")]
    ImmutableProfile,
    #[error("capability {0} not granted")]
    CapabilityDenied(String),
    #[error("unattended access denied")]
    PolicyDenied(DenyReason),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code for the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "INVALID_REQUEST",
            ApiError::NotFound { kind, .. } => match *kind {
                "session" => "SESSION_NOT_FOUND",
                "profile" => "PROFILE_NOT_FOUND",
                "tunnel" => "TUNNEL_NOT_FOUND",
                "transfer" => "TRANSFER_NOT_FOUND",
                "code" => "CODE_NOT_FOUND",
                _ => "NOT_FOUND",
            },
            ApiError::SessionFull => "SESSION_FULL",
            ApiError::SessionClosed => "SESSION_CLOSED",
            ApiError::AlreadyConsumed => "CODE_ALREADY_CONSUMED",
            ApiError::Expired => "CODE_EXPIRED",
            ApiError::PortInUse(_) => "PORT_IN_USE",
            ApiError::ProfileInUse => "PROFILE_IN_USE",
            ApiError::EndpointBusy(_) => "ENDPOINT_BUSY",
            ApiError::InvalidName => "INVALID_NAME",
            ApiError::ImmutableProfile => "IMMUTABLE_PROFILE",
            ApiError::CapabilityDenied(_) => "CAPABILITY_DENIED",
            ApiError::PolicyDenied(reason) => reason.code(),
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidName => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::SessionFull
            | ApiError::AlreadyConsumed
            | ApiError::PortInUse(_)
            | ApiError::ProfileInUse
            | ApiError::EndpointBusy(_) => StatusCode::CONFLICT,
            ApiError::SessionClosed | ApiError::Expired => StatusCode::GONE,
            ApiError::ImmutableProfile
            | ApiError::CapabilityDenied(_)
            | ApiError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NotFound => ApiError::NotFound {
                kind: "code",
                id: String::new(),
            },
            CredentialError::Expired => ApiError::Expired,
            CredentialError::AlreadyConsumed => ApiError::AlreadyConsumed,
            CredentialError::RandomnessUnavailable => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => ApiError::NotFound { kind: "session", id },
            SessionError::SessionFull => ApiError::SessionFull,
            SessionError::SessionClosed => ApiError::SessionClosed,
        }
    }
}

impl From<ProfileError> for ApiError {
    fn from(err: ProfileError) -> Self {
        match err {
            ProfileError::InvalidName => ApiError::InvalidName,
            ProfileError::ImmutableProfile => ApiError::ImmutableProfile,
            ProfileError::NotFound(id) => ApiError::NotFound { kind: "profile", id },
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::SessionUnknown(id) => ApiError::NotFound { kind: "session", id },
            RelayError::EndpointBusy(role) => ApiError::EndpointBusy(role.as_str()),
            RelayError::CapabilityDenied(cap) => ApiError::CapabilityDenied(cap.to_string()),
        }
    }
}

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::NotFound(id) => ApiError::NotFound { kind: "tunnel", id },
            TunnelError::PortInUse(port) => ApiError::PortInUse(port),
            TunnelError::CapabilityDenied => {
                ApiError::CapabilityDenied("tcpTunneling".to_string())
            }
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::NotFound(id) => ApiError::NotFound { kind: "transfer", id },
            other => ApiError::Validation(other.to_string()),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::InvalidSchedule(msg) => ApiError::Validation(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::from(CredentialError::Expired).status(), StatusCode::GONE);
        assert_eq!(
            ApiError::from(CredentialError::AlreadyConsumed).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SessionError::SessionFull).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(TunnelError::CapabilityDenied).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::PolicyDenied(DenyReason::OutsideSchedule).code(),
            "OUTSIDE_SCHEDULE"
        );
    }

    #[test]
    fn test_expired_and_not_found_are_distinct_codes() {
        assert_eq!(ApiError::from(CredentialError::Expired).code(), "CODE_EXPIRED");
        assert_eq!(
            ApiError::from(CredentialError::NotFound).code(),
            "CODE_NOT_FOUND"
        );
    }
}
