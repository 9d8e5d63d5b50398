//! Well-known channel names and their socket paths.
//!
//! A channel is identified by a short name shared by server and clients.
//! The name resolves to a Unix socket path:
//!
//! 1. `<runtime_dir>/npipe/<name>.sock` when a runtime directory is given
//! 2. `$XDG_RUNTIME_DIR/npipe/<name>.sock` if `XDG_RUNTIME_DIR` is set
//! 3. `/tmp/npipe/<name>.sock` as fallback

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Subdirectory holding all channel sockets.
pub const CHANNEL_SUBDIR: &str = "npipe";

/// Socket file extension.
const SOCKET_EXTENSION: &str = "sock";

/// Default channel name.
pub const DEFAULT_CHANNEL_NAME: &str = "echo";

/// Maximum channel name length. Keeps resolved paths well inside
/// `sun_path` limits.
pub const MAX_CHANNEL_NAME_LEN: usize = 64;

/// Validated channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    /// Validate and wrap a channel name.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if the name is empty, too
    /// long, `.`/`..`, or contains characters outside `[A-Za-z0-9._-]`.
    pub fn new(name: impl Into<String>) -> Result<Self, ChannelError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ChannelError::configuration("channel name is empty"));
        }
        if name.len() > MAX_CHANNEL_NAME_LEN {
            return Err(ChannelError::configuration(format!(
                "channel name is {} bytes, maximum is {MAX_CHANNEL_NAME_LEN}",
                name.len()
            )));
        }
        if name == "." || name == ".." {
            return Err(ChannelError::configuration(format!(
                "channel name '{name}' is reserved"
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(ChannelError::configuration(format!(
                "channel name '{name}' contains invalid character {c:?}"
            )));
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve the socket path under an explicit runtime directory.
    #[must_use]
    pub fn socket_path_in(&self, runtime_dir: &Path) -> PathBuf {
        runtime_dir
            .join(CHANNEL_SUBDIR)
            .join(format!("{}.{SOCKET_EXTENSION}", self.0))
    }

    /// Resolve the socket path from the environment.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path_in(&default_runtime_dir())
    }
}

impl Default for ChannelName {
    fn default() -> Self {
        Self(DEFAULT_CHANNEL_NAME.to_string())
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChannelName {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ChannelName {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChannelName> for String {
    fn from(name: ChannelName) -> Self {
        name.0
    }
}

/// Runtime directory used when none is configured.
#[must_use]
pub fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
}

/// Resolve the socket path for a channel.
///
/// An explicit `socket_override` wins over name-based resolution.
#[must_use]
pub fn resolve_socket_path(
    name: &ChannelName,
    runtime_dir: Option<&Path>,
    socket_override: Option<&Path>,
) -> PathBuf {
    if let Some(path) = socket_override {
        return path.to_path_buf();
    }
    runtime_dir.map_or_else(|| name.socket_path(), |dir| name.socket_path_in(dir))
}
