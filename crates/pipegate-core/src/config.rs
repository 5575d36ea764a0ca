//! Configuration resolution for pipegate.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Config file (`--config`, or the global `config.json` when present)
//! 3. Environment variables (`PIPEGATE_*`)
//! 4. CLI arguments (applied by the binary)
//!
//! The result is validated once with [`GatewayConfig::validate`] before any
//! connection is accepted and is immutable afterwards.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limit::RateLimitConfig;

/// Minimum accepted length of the shared secret.
pub const MIN_AUTH_TOKEN_LEN: usize = 16;

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Interface to bind.
    pub host: String,
    /// TCP port to bind.
    pub port: u16,
    /// Shared secret expected in `Authorization: Bearer <token>`.
    pub auth_token: String,
    /// Command allow-list. Only entries mapped to `true` may be spawned.
    pub commands: BTreeMap<String, bool>,
    /// Header prefix marking environment overrides for workers.
    pub env_header_prefix: String,
    /// Maximum concurrently live sessions.
    pub max_sessions: usize,
    /// Maximum accepted message body size in bytes.
    pub max_body_bytes: usize,
    /// Origins allowed by CORS. Empty disables the CORS layer, `"*"` allows any.
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            auth_token: String::new(),
            commands: BTreeMap::new(),
            env_header_prefix: "x-worker-env-".to_string(),
            max_sessions: 100,
            max_body_bytes: 1024 * 1024, // 1 MiB
            cors_origins: Vec::new(),
            sessions: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Session lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session is expired by the sweep.
    pub session_timeout_secs: u64,
    /// Interval between idle sweeps.
    pub cleanup_interval_secs: u64,
    /// Grace between SIGTERM and SIGKILL for a worker.
    pub terminate_grace_secs: u64,
    /// Upper bound on draining all sessions at shutdown.
    pub shutdown_grace_secs: u64,
    /// Interval between SSE keep-alive comments.
    pub keep_alive_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 300,
            cleanup_interval_secs: 30,
            terminate_grace_secs: 5,
            shutdown_grace_secs: 10,
            keep_alive_secs: 15,
        }
    }
}

impl SessionConfig {
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from an explicit file, or from the global config
    /// path when it exists, then apply `PIPEGATE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match global_config_path() {
                Some(global) if global.exists() => Self::from_file(&global)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Apply `PIPEGATE_*` overrides through `lookup` (normally `std::env::var`).
    ///
    /// `PIPEGATE_COMMANDS` is a comma-separated list of commands to enable.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PIPEGATE_HOST") {
            self.host = val;
        }
        if let Some(n) = lookup("PIPEGATE_PORT").and_then(|v| v.parse().ok()) {
            self.port = n;
        }
        if let Some(val) = lookup("PIPEGATE_AUTH_TOKEN") {
            self.auth_token = val;
        }
        if let Some(val) = lookup("PIPEGATE_COMMANDS") {
            for command in val.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                self.commands.insert(command.to_string(), true);
            }
        }
        if let Some(n) = lookup("PIPEGATE_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
            self.max_sessions = n;
        }
        if let Some(n) = lookup("PIPEGATE_SESSION_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.sessions.session_timeout_secs = n;
        }
        if let Some(n) = lookup("PIPEGATE_RATE_LIMIT_RPM").and_then(|v| v.parse().ok()) {
            self.rate_limit.requests_per_minute = n;
        }
        if let Some(n) = lookup("PIPEGATE_RATE_LIMIT_BURST").and_then(|v| v.parse().ok()) {
            self.rate_limit.burst = Some(n);
        }
    }

    /// Reject configurations the gateway cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.auth_token.len() < MIN_AUTH_TOKEN_LEN {
            return Err(Error::Config(format!(
                "auth_token must be at least {MIN_AUTH_TOKEN_LEN} characters"
            )));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be in 1..=65535".into()));
        }
        self.host
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("invalid host {:?}: {e}", self.host)))?;

        if self.commands.is_empty() {
            return Err(Error::Config("command allow-list is empty".into()));
        }
        for command in self.commands.keys() {
            if command.is_empty()
                || command.trim() != command
                || command.chars().any(char::is_control)
            {
                return Err(Error::Config(format!(
                    "malformed command allow-list entry {command:?}"
                )));
            }
        }
        if !self.commands.values().any(|enabled| *enabled) {
            return Err(Error::Config(
                "command allow-list has no enabled entries".into(),
            ));
        }

        if self.env_header_prefix.is_empty() {
            return Err(Error::Config("env_header_prefix must not be empty".into()));
        }
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be positive".into()));
        }
        if self.max_body_bytes == 0 {
            return Err(Error::Config("max_body_bytes must be positive".into()));
        }

        let s = &self.sessions;
        if s.session_timeout_secs == 0
            || s.cleanup_interval_secs == 0
            || s.shutdown_grace_secs == 0
            || s.keep_alive_secs == 0
        {
            return Err(Error::Config("session timings must be positive".into()));
        }
        if s.cleanup_interval_secs >= s.session_timeout_secs {
            return Err(Error::Config(
                "cleanup_interval_secs must be shorter than session_timeout_secs".into(),
            ));
        }

        self.rate_limit.validate()
    }

    /// Socket address to bind.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| Error::Config(format!("invalid host {:?}: {e}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Path of the global config file (`$XDG_CONFIG_HOME/pipegate/config.json`).
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("pipegate").join("config.json"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn valid_config() -> GatewayConfig {
        let mut config = GatewayConfig {
            auth_token: "0123456789abcdef".into(),
            ..GatewayConfig::default()
        };
        config.commands.insert("cat".into(), true);
        config
    }

    #[test]
    fn defaults_are_invalid_without_secret_and_commands() {
        assert!(GatewayConfig::default().validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn short_secret_rejected() {
        let mut config = valid_config();
        config.auth_token = "short".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("auth_token"));
    }

    #[test]
    fn zero_port_rejected() {
        let mut config = valid_config();
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn allow_list_needs_an_enabled_entry() {
        let mut config = valid_config();
        config.commands.insert("cat".into(), false);
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_allow_list_key_rejected() {
        let mut config = valid_config();
        config.commands.insert(" padded".into(), true);
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.commands.insert("bad\ncmd".into(), true);
        assert!(config.validate().is_err());
    }

    #[test]
    fn sweep_must_be_shorter_than_timeout() {
        let mut config = valid_config();
        config.sessions.cleanup_interval_secs = config.sessions.session_timeout_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_partial_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": 9100, "auth_token": "0123456789abcdef",
                "commands": {{"cat": true, "rm -rf /": false}},
                "sessions": {{"session_timeout_secs": 60}}}}"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.commands.get("rm -rf /"), Some(&false));
        assert_eq!(config.sessions.session_timeout_secs, 60);
        assert_eq!(config.sessions.cleanup_interval_secs, 30);
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let err = GatewayConfig::from_file(Path::new("/nonexistent/pipegate.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("PIPEGATE_PORT", "9200"),
            ("PIPEGATE_AUTH_TOKEN", "fedcba9876543210"),
            ("PIPEGATE_COMMANDS", "cat, echo hi ,"),
            ("PIPEGATE_RATE_LIMIT_BURST", "7"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.port, 9200);
        assert_eq!(config.auth_token, "fedcba9876543210");
        assert_eq!(config.commands.len(), 2);
        assert_eq!(config.commands.get("echo hi"), Some(&true));
        assert_eq!(config.rate_limit.burst, Some(7));
        config.validate().unwrap();
    }

    #[test]
    fn socket_addr_handles_ipv6() {
        let mut config = valid_config();
        config.host = "::1".into();
        config.port = 8443;
        assert_eq!(config.socket_addr().unwrap().to_string(), "[::1]:8443");
    }
}
