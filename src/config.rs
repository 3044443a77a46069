//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `VNCC_API_KEY`, `VNCC_LISTEN`,
//!    `VNCC_HOST_ID`
//! 2. **Config file** — path via `--config <path>`, or `vncc.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:5000"
//! max_sessions = 64
//! relay_queue_depth = 256
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [host]
//! id = "HOST-0001"
//!
//! [credential]
//! ttl_secs = 600            # pairing codes live 10 minutes
//! sweep_interval_secs = 60
//!
//! [session]
//! idle_suspend_secs = 60    # Active -> Suspended after 60 s of silence
//! suspend_close_secs = 300  # Suspended -> Closed after a further 5 min
//! closed_retention_secs = 60
//! sweep_interval_secs = 10
//!
//! [relay]
//! control_retry_secs = 2    # unacked control frames are re-sent this often
//!
//! [tunnel]
//! bind_timeout_secs = 10    # Connecting -> Error without a bind ack
//! sweep_interval_secs = 5
//!
//! [transfer]
//! max_per_session = 4
//! stale_timeout_secs = 120
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub credential: CredentialConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:5000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent non-terminal sessions (default 64).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Per-endpoint relay queue depth (default 256). Frames beyond this are
    /// dropped on best-effort channels.
    #[serde(default = "default_relay_queue_depth")]
    pub relay_queue_depth: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `VNCC_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Identity of the host machine this server signals for.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Host identity recorded on sessions. Override with `VNCC_HOST_ID`.
    #[serde(default = "default_host_id")]
    pub id: String,
}

/// Access-credential settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    /// Pairing-code lifetime in seconds (default 600 = 10 minutes).
    #[serde(default = "default_credential_ttl")]
    pub ttl_secs: u64,
    /// Seconds between expired-credential sweeps (default 60).
    #[serde(default = "default_credential_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Session inactivity windows.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Seconds of silence before `Active → Suspended` (default 60).
    #[serde(default = "default_idle_suspend")]
    pub idle_suspend_secs: u64,
    /// Further seconds before `Suspended → Closed` (default 300).
    #[serde(default = "default_suspend_close")]
    pub suspend_close_secs: u64,
    /// Seconds a `Closed` session stays visible before purge (default 60).
    #[serde(default = "default_closed_retention")]
    pub closed_retention_secs: u64,
    /// Seconds between lifecycle sweeps (default 10).
    #[serde(default = "default_session_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Relay delivery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Seconds between re-sends of unacknowledged control frames (default 2).
    #[serde(default = "default_control_retry")]
    pub control_retry_secs: u64,
}

/// Tunnel broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Seconds a tunnel may stay `Connecting` before it errors (default 10).
    #[serde(default = "default_bind_timeout")]
    pub bind_timeout_secs: u64,
    /// Seconds between tunnel sweeps (default 5).
    #[serde(default = "default_tunnel_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Seconds terminal tunnels stay listed before purge (default 300).
    #[serde(default = "default_ended_retention")]
    pub ended_retention_secs: u64,
}

/// File-transfer tracking settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Maximum concurrent transfers per session (default 4).
    #[serde(default = "default_max_transfers")]
    pub max_per_session: usize,
    /// Seconds without chunk activity before a transfer fails (default 120).
    #[serde(default = "default_transfer_stale_timeout")]
    pub stale_timeout_secs: u64,
    /// Seconds terminal transfers stay listed before purge (default 300).
    #[serde(default = "default_ended_retention")]
    pub ended_retention_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_max_sessions() -> usize {
    64
}
fn default_relay_queue_depth() -> usize {
    256
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_host_id() -> String {
    "VNCC-0000-HOST-001".to_string()
}
fn default_credential_ttl() -> u64 {
    600
}
fn default_credential_sweep_interval() -> u64 {
    60
}
fn default_idle_suspend() -> u64 {
    60
}
fn default_suspend_close() -> u64 {
    300
}
fn default_closed_retention() -> u64 {
    60
}
fn default_session_sweep_interval() -> u64 {
    10
}
fn default_control_retry() -> u64 {
    2
}
fn default_bind_timeout() -> u64 {
    10
}
fn default_tunnel_sweep_interval() -> u64 {
    5
}
fn default_ended_retention() -> u64 {
    300
}
fn default_max_transfers() -> usize {
    4
}
fn default_transfer_stale_timeout() -> u64 {
    120
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            relay_queue_depth: default_relay_queue_depth(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            id: default_host_id(),
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_credential_ttl(),
            sweep_interval_secs: default_credential_sweep_interval(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_suspend_secs: default_idle_suspend(),
            suspend_close_secs: default_suspend_close(),
            closed_retention_secs: default_closed_retention(),
            sweep_interval_secs: default_session_sweep_interval(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            control_retry_secs: default_control_retry(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_timeout_secs: default_bind_timeout(),
            sweep_interval_secs: default_tunnel_sweep_interval(),
            ended_retention_secs: default_ended_retention(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_per_session: default_max_transfers(),
            stale_timeout_secs: default_transfer_stale_timeout(),
            ended_retention_secs: default_ended_retention(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `vncc.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("vncc.toml").exists() {
            let content = std::fs::read_to_string("vncc.toml").expect("Failed to read vncc.toml");
            toml::from_str(&content).expect("Failed to parse vncc.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("VNCC_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("VNCC_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(host_id) = std::env::var("VNCC_HOST_ID") {
            config.host.id = host_id;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = Config::default();
        assert_eq!(config.credential.ttl_secs, 600);
        assert_eq!(config.session.idle_suspend_secs, 60);
        assert_eq!(config.session.suspend_close_secs, 300);
        assert_eq!(config.tunnel.bind_timeout_secs, 10);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"

            [session]
            idle_suspend_secs = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.max_sessions, 64);
        assert_eq!(config.session.idle_suspend_secs, 15);
        assert_eq!(config.session.suspend_close_secs, 300);
        assert_eq!(config.auth.api_key, "change-me");
    }
}
