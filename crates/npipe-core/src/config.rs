//! Configuration file parsing.
//!
//! `npipe.toml` configures both the server and the client. Every field has a
//! default, so an absent file is a valid configuration:
//!
//! ```toml
//! [channel]
//! name = "echo"
//! # runtime_dir = "/run/user/1000"
//! # socket = "/run/npipe/echo.sock"   # overrides name-based resolution
//!
//! [[security.allow]]
//! principal = "owner"
//! access = ["read", "write"]
//!
//! [limits]
//! max_sessions = 64
//! max_message_size = 16384
//! accept_retry_budget = 5
//! accept_backoff_ms = 100
//! shutdown_grace_ms = 5000
//!
//! [client]
//! connect_timeout_ms = 2000
//! request_timeout_ms = 5000
//! connect_attempts = 5
//! retry_backoff_ms = 200
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ChannelError, DEFAULT_MAX_MESSAGE_SIZE, MAX_FRAME_SIZE};
use crate::name::{resolve_socket_path, ChannelName};
use crate::security::{Access, SecurityDescriptor, SecurityDescriptorBuilder};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML is malformed or has unknown keys.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization failed.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values parsed but are out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NpipeConfig {
    /// Channel naming.
    #[serde(default)]
    pub channel: ChannelSection,

    /// Access control.
    #[serde(default)]
    pub security: SecuritySection,

    /// Server limits.
    #[serde(default)]
    pub limits: LimitsSection,

    /// Client behaviour.
    #[serde(default)]
    pub client: ClientSection,
}

impl NpipeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load from `path` if it exists, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is invalid.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "limits.max_sessions must be at least 1".to_string(),
            ));
        }
        if limits.max_message_size == 0 || limits.max_message_size > MAX_FRAME_SIZE {
            return Err(ConfigError::Validation(format!(
                "limits.max_message_size must be in 1..={MAX_FRAME_SIZE}, got {}",
                limits.max_message_size
            )));
        }
        if self.security.allow.is_empty() {
            return Err(ConfigError::Validation(
                "security.allow must contain at least one entry".to_string(),
            ));
        }
        if self.client.connect_attempts == 0 {
            return Err(ConfigError::Validation(
                "client.connect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket path for the configured channel.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        resolve_socket_path(
            &self.channel.name,
            self.channel.runtime_dir.as_deref(),
            self.channel.socket.as_deref(),
        )
    }

    /// Build the security descriptor from `[[security.allow]]`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if a principal or permission
    /// does not resolve.
    pub fn security_descriptor(&self) -> Result<SecurityDescriptor, ChannelError> {
        let mut builder = SecurityDescriptorBuilder::new();
        for rule in &self.security.allow {
            let access = Access::from_names(&rule.access)?;
            builder = builder.allow_spec(&rule.principal, access);
        }
        builder.build()
    }
}

/// `[channel]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSection {
    /// Well-known channel name.
    #[serde(default)]
    pub name: ChannelName,

    /// Runtime directory the socket lives under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,

    /// Explicit socket path, bypassing name resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,
}

/// `[security]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecuritySection {
    /// Access entries, evaluated in order.
    #[serde(default = "default_allow")]
    pub allow: Vec<AllowRule>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            allow: default_allow(),
        }
    }
}

/// One `[[security.allow]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowRule {
    /// Principal spec (`everyone`, `owner`, `uid:N`, `gid:N`, `user:NAME`,
    /// `group:NAME`).
    pub principal: String,

    /// Permission names (`read`, `write`).
    #[serde(default = "default_access")]
    pub access: Vec<String>,
}

fn default_allow() -> Vec<AllowRule> {
    vec![AllowRule {
        principal: "owner".to_string(),
        access: default_access(),
    }]
}

fn default_access() -> Vec<String> {
    vec!["read".to_string(), "write".to_string()]
}

/// `[limits]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    /// Maximum concurrently served sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Largest echoed message in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Consecutive accept failures tolerated before the listener exits.
    #[serde(default = "default_accept_retry_budget")]
    pub accept_retry_budget: u32,

    /// Initial backoff after a failed accept; doubles per failure.
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,

    /// Time workers get to finish after shutdown before being force-closed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl LimitsSection {
    /// Initial accept backoff.
    #[must_use]
    pub const fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }

    /// Shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_message_size: default_max_message_size(),
            accept_retry_budget: default_accept_retry_budget(),
            accept_backoff_ms: default_accept_backoff_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

const fn default_max_sessions() -> usize {
    64
}

const fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

const fn default_accept_retry_budget() -> u32 {
    5
}

const fn default_accept_backoff_ms() -> u64 {
    100
}

const fn default_shutdown_grace_ms() -> u64 {
    5_000
}

/// `[client]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    /// Time allowed for connect plus admission.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Time allowed for one echo round trip.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Connection attempts before giving up on an unavailable server.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Initial delay between connection attempts; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl ClientSection {
    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Initial retry backoff.
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

const fn default_connect_timeout_ms() -> u64 {
    2_000
}

const fn default_request_timeout_ms() -> u64 {
    5_000
}

const fn default_connect_attempts() -> u32 {
    5
}

const fn default_retry_backoff_ms() -> u64 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{Principal, OWNER_SOCKET_MODE};

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = NpipeConfig::from_toml("").unwrap();
        assert_eq!(config, NpipeConfig::default());
        assert_eq!(config.channel.name.as_str(), "echo");
        assert_eq!(config.limits.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.limits.max_sessions, 64);

        let sd = config.security_descriptor().unwrap();
        assert_eq!(sd.entries().len(), 1);
        assert_eq!(sd.entries()[0].principal, Principal::Owner);
        assert_eq!(sd.socket_mode(), OWNER_SOCKET_MODE);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            [channel]
            name = "jobs"
            runtime_dir = "/run/user/1000"

            [[security.allow]]
            principal = "owner"

            [[security.allow]]
            principal = "gid:100"
            access = ["read"]

            [limits]
            max_sessions = 8
            max_message_size = 1024
            accept_retry_budget = 2
            accept_backoff_ms = 10
            shutdown_grace_ms = 250

            [client]
            request_timeout_ms = 100
        "#;

        let config = NpipeConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/run/user/1000/npipe/jobs.sock")
        );
        assert_eq!(config.limits.max_sessions, 8);
        assert_eq!(config.limits.shutdown_grace(), Duration::from_millis(250));
        assert_eq!(config.client.request_timeout(), Duration::from_millis(100));
        assert_eq!(config.client.connect_attempts, 5);

        let sd = config.security_descriptor().unwrap();
        assert_eq!(sd.entries()[1].principal, Principal::Group(100));
        assert_eq!(sd.entries()[1].access, Access::READ);
    }

    #[test]
    fn test_socket_override() {
        let config = NpipeConfig::from_toml(
            r#"
            [channel]
            name = "jobs"
            socket = "/srv/jobs.sock"
            "#,
        )
        .unwrap();
        assert_eq!(config.socket_path(), PathBuf::from("/srv/jobs.sock"));
    }

    #[test]
    fn test_validation_failures() {
        for toml in [
            "[limits]\nmax_sessions = 0",
            "[limits]\nmax_message_size = 0",
            "[limits]\nmax_message_size = 999999999",
            "[security]\nallow = []",
            "[client]\nconnect_attempts = 0",
        ] {
            assert!(
                matches!(
                    NpipeConfig::from_toml(toml),
                    Err(ConfigError::Validation(_))
                ),
                "{toml} should fail validation"
            );
        }
    }

    #[test]
    fn test_unknown_keys_and_bad_names_rejected() {
        assert!(matches!(
            NpipeConfig::from_toml("[channel]\nsocket_path = \"/x\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            NpipeConfig::from_toml("[channel]\nname = \"a/b\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_bad_principal_surfaces_as_configuration_error() {
        let config = NpipeConfig::from_toml(
            r#"
            [[security.allow]]
            principal = "group:npipe-no-such-group-xyz"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.security_descriptor(),
            Err(ChannelError::Configuration { .. })
        ));
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = NpipeConfig::default();
        config.limits.max_sessions = 3;
        let text = config.to_toml().unwrap();
        assert_eq!(NpipeConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = NpipeConfig::load_or_default(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config, NpipeConfig::default());
    }
}
