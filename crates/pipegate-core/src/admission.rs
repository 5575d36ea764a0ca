//! Admission control for worker spawns.
//!
//! Three checks run before any process is started:
//! 1. Bearer credential against the configured shared secret.
//! 2. Command membership in the static allow-list.
//! 3. Filtering of caller-supplied environment overrides. Deny-listed names
//!    are dropped and logged as security events; filtering never fails the
//!    request.

use std::collections::{BTreeMap, HashMap};

use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::{Error, Result};

/// Environment variables callers may never override.
pub const DENIED_ENV_KEYS: &[&str] = &[
    // System path and identity
    "PATH",
    "HOME",
    "USER",
    "USERNAME",
    "LOGNAME",
    "SHELL",
    "PWD",
    "OLDPWD",
    "HOSTNAME",
    "IFS",
    "ENV",
    "BASH_ENV",
    "CDPATH",
    "MAIL",
    // Temp directories
    "TMPDIR",
    "TMP",
    "TEMP",
    // Locale
    "LANG",
    "LANGUAGE",
    "TZ",
    "TERM",
    // Loader and privilege escalation
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "SUDO_USER",
    "SUDO_UID",
    "SUDO_GID",
    "SUDO_COMMAND",
    "SUDO_ASKPASS",
    "PKEXEC_UID",
    // Credential-shaped
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "NPM_TOKEN",
    "SSH_AUTH_SOCK",
    "GPG_AGENT_INFO",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "DOCKER_HOST",
    "KUBECONFIG",
    // Runtime platform overrides
    "NODE_OPTIONS",
    "NODE_PATH",
    "NODE_EXTRA_CA_CERTS",
    "NODE_TLS_REJECT_UNAUTHORIZED",
    "PYTHONPATH",
    "PYTHONHOME",
    "PYTHONSTARTUP",
    "PYTHONINSPECT",
    "RUBYOPT",
    "RUBYLIB",
    "PERL5OPT",
    "PERL5LIB",
    "JAVA_TOOL_OPTIONS",
    "_JAVA_OPTIONS",
    "CLASSPATH",
    "GIT_SSH_COMMAND",
    "GIT_EXEC_PATH",
    "RUST_LOG",
    "RUST_BACKTRACE",
];

/// Name prefixes denied as a family (`LC_ALL`, `DYLD_FRAMEWORK_PATH`, ...).
pub const DENIED_ENV_PREFIXES: &[&str] = &["LC_", "LD_", "DYLD_", "SUDO_", "PIPEGATE_"];

/// Whether `key` (any case) is on the environment deny-list.
pub fn is_denied_env_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    DENIED_ENV_KEYS.contains(&upper.as_str())
        || DENIED_ENV_PREFIXES.iter().any(|p| upper.starts_with(p))
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(authorization: &str) -> Option<&str> {
    let (scheme, token) = authorization.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    } else {
        None
    }
}

/// A request that passed every admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedRequest {
    /// The allow-listed command to execute.
    pub command: String,
    /// Sanitized environment overrides.
    pub env: HashMap<String, String>,
}

/// Credential, allow-list, and environment gate.
#[derive(Debug, Clone)]
pub struct Admission {
    auth_token: String,
    commands: BTreeMap<String, bool>,
    env_header_prefix: String,
}

impl Admission {
    /// Create an admission gate. `env_header_prefix` is matched case-insensitively.
    pub fn new(
        auth_token: impl Into<String>,
        commands: BTreeMap<String, bool>,
        env_header_prefix: &str,
    ) -> Self {
        Self {
            auth_token: auth_token.into(),
            commands,
            env_header_prefix: env_header_prefix.to_ascii_lowercase(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.auth_token.clone(),
            config.commands.clone(),
            &config.env_header_prefix,
        )
    }

    /// Validate a raw `Authorization` header value.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<()> {
        let token = authorization
            .and_then(bearer_token)
            .ok_or_else(|| Error::Authentication("Missing bearer token".into()))?;

        if bool::from(token.as_bytes().ct_eq(self.auth_token.as_bytes())) {
            Ok(())
        } else {
            warn!(security_event = "auth_rejected", "Invalid bearer token");
            Err(Error::Authentication("Invalid token".into()))
        }
    }

    /// Whether `command` is mapped to `true` in the allow-list.
    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.commands.get(command).copied().unwrap_or(false)
    }

    /// Reject commands that are absent from the allow-list or disabled.
    pub fn check_command(&self, command: &str) -> Result<()> {
        if self.is_command_allowed(command) {
            Ok(())
        } else {
            warn!(command, "Command not in allow-list");
            Err(Error::CommandNotAllowed {
                command: command.to_string(),
            })
        }
    }

    /// Map prefixed metadata entries to environment overrides.
    ///
    /// `x-worker-env-api-key: v` becomes `API_KEY=v`. Deny-listed and
    /// malformed names are dropped.
    pub fn filter_env<'a, I>(&self, metadata: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut env = HashMap::new();
        for (key, value) in metadata {
            let lower = key.to_ascii_lowercase();
            let Some(rest) = lower.strip_prefix(&self.env_header_prefix) else {
                continue;
            };
            let name = rest.replace('-', "_").to_ascii_uppercase();

            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
            {
                debug!(header = key, "Ignoring malformed environment override");
                continue;
            }
            if is_denied_env_key(&name) {
                warn!(
                    security_event = "env_override_denied",
                    header = key,
                    variable = %name,
                    "Blocked attempt to override protected environment variable"
                );
                continue;
            }
            env.insert(name, value.to_string());
        }
        env
    }

    /// Run all checks in order. Nothing is allocated for rejected requests.
    pub fn admit<'a, I>(
        &self,
        authorization: Option<&str>,
        command: &str,
        metadata: I,
    ) -> Result<AdmittedRequest>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.authenticate(authorization)?;
        self.check_command(command)?;
        Ok(AdmittedRequest {
            command: command.to_string(),
            env: self.filter_env(metadata),
        })
    }
}
