#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! vncc library — exposes core modules for use by downstream crates and
//! integration tests.
//!
//! This library re-exports the key building blocks:
//! - `permissions` — capability sets and permission profiles
//! - `credentials` — pairing-code issuance and redemption
//! - `sessions` — pairing-session lifecycle
//! - `relay` — in-session signaling bus
//! - `unattended` — unattended-access policy engine
//! - `tunnels` — TCP tunnel broker
//! - `transfers` — file-transfer progress tracking
//! - `auth` — API key authentication middleware
//! - `config` — configuration loading
//! - `routes` — REST API route handlers
//! - `ws` — relay WebSocket handling

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod permissions;
pub mod relay;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod transfers;
pub mod tunnels;
pub mod unattended;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use credentials::CredentialIssuer;
pub use error::ApiError;
pub use permissions::ProfileRegistry;
pub use relay::Relay;
pub use sessions::SessionRegistry;
pub use state::AppState;
pub use transfers::TransferTracker;
pub use tunnels::TunnelBroker;
