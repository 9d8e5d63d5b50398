//! Channel security descriptor.
//!
//! A [`SecurityDescriptor`] says which principals may open the channel and
//! with which permissions. It is enforced in two layers:
//!
//! 1. **Socket file mode**, derived from the widest principal in the
//!    descriptor and applied right after bind ([`SecurityDescriptor::socket_mode`]).
//!    File modes cannot name individual users, so an entry for any user
//!    other than the owner opens the file to everyone and leaves the
//!    decision to the credential check.
//! 2. **Peer credential check** on every accepted connection
//!    ([`SecurityDescriptor::check`]). This layer is authoritative; the file
//!    mode only keeps clearly excluded users from connecting at all.
//!
//! # Principals
//!
//! | Spec          | Matches                                         |
//! |---------------|-------------------------------------------------|
//! | `everyone`    | any local user                                  |
//! | `owner`       | the server's effective uid                      |
//! | `uid:N`       | user id `N`                                     |
//! | `user:NAME`   | the uid of user `NAME`                          |
//! | `gid:N`       | peers in group `N` (effective or supplementary) |
//! | `group:NAME`  | peers in group `NAME`                           |
//!
//! # Invariants
//!
//! - A descriptor always has at least one entry, and every entry grants at
//!   least one permission.
//! - Descriptors are immutable once built and shared read-only.

use std::fmt;
use std::str::FromStr;

use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::credentials::PeerCredentials;
use crate::error::ChannelError;

/// Socket mode when any entry admits everyone or a user other than the owner.
pub const EVERYONE_SOCKET_MODE: u32 = 0o666;

/// Socket mode when the widest entry is a group.
pub const GROUP_SOCKET_MODE: u32 = 0o660;

/// Socket mode for descriptors naming only the owner.
pub const OWNER_SOCKET_MODE: u32 = 0o600;

/// Principal to which an access entry applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Principal {
    /// Any local user.
    Everyone,
    /// The effective uid of the server process.
    Owner,
    /// A specific user id.
    User(u32),
    /// A specific group id, matched against the peer's effective and
    /// supplementary groups.
    Group(u32),
}

impl Principal {
    /// Parse and resolve a principal specification.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if the spec is malformed or
    /// a user/group name does not resolve.
    pub fn resolve(spec: &str) -> Result<Self, ChannelError> {
        let spec = spec.trim();
        match spec.split_once(':') {
            None => match spec.to_ascii_lowercase().as_str() {
                "everyone" | "world" => Ok(Self::Everyone),
                "owner" => Ok(Self::Owner),
                _ => Err(ChannelError::configuration(format!(
                    "unknown principal '{spec}'"
                ))),
            },
            Some(("uid", id)) => parse_id(id, spec).map(Self::User),
            Some(("gid", id)) => parse_id(id, spec).map(Self::Group),
            Some(("user", name)) => match User::from_name(name) {
                Ok(Some(user)) => Ok(Self::User(user.uid.as_raw())),
                Ok(None) => Err(ChannelError::configuration(format!(
                    "user '{name}' does not exist"
                ))),
                Err(e) => Err(ChannelError::configuration(format!(
                    "failed to look up user '{name}': {e}"
                ))),
            },
            Some(("group", name)) => match Group::from_name(name) {
                Ok(Some(group)) => Ok(Self::Group(group.gid.as_raw())),
                Ok(None) => Err(ChannelError::configuration(format!(
                    "group '{name}' does not exist"
                ))),
                Err(e) => Err(ChannelError::configuration(format!(
                    "failed to look up group '{name}': {e}"
                ))),
            },
            Some((kind, _)) => Err(ChannelError::configuration(format!(
                "unknown principal kind '{kind}' in '{spec}'"
            ))),
        }
    }

    fn matches(self, peer: &PeerCredentials, owner_uid: u32) -> bool {
        match self {
            Self::Everyone => true,
            Self::Owner => ct_eq_u32(peer.uid, owner_uid),
            Self::User(uid) => ct_eq_u32(peer.uid, uid),
            Self::Group(gid) => peer
                .group_ids()
                .fold(false, |found, id| ct_eq_u32(id, gid) | found),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Everyone => write!(f, "everyone"),
            Self::Owner => write!(f, "owner"),
            Self::User(uid) => write!(f, "uid:{uid}"),
            Self::Group(gid) => write!(f, "gid:{gid}"),
        }
    }
}

impl FromStr for Principal {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s)
    }
}

fn parse_id(id: &str, spec: &str) -> Result<u32, ChannelError> {
    id.parse::<u32>()
        .map_err(|_| ChannelError::configuration(format!("invalid numeric id in '{spec}'")))
}

fn ct_eq_u32(a: u32, b: u32) -> bool {
    a.to_ne_bytes().ct_eq(&b.to_ne_bytes()).unwrap_u8() == 1
}

/// Permission set granted by an access entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Access {
    /// Peer may read (receive echoes).
    pub read: bool,
    /// Peer may write (send requests).
    pub write: bool,
}

impl Access {
    /// No permissions.
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };
    /// Read-only.
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    /// Write-only.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
    /// Read and write; required to open the bidirectional channel.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    /// Returns `true` if no permission is granted.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.read && !self.write
    }

    /// Returns `true` if `self` grants everything `required` asks for.
    #[must_use]
    pub const fn contains(self, required: Self) -> bool {
        (self.read || !required.read) && (self.write || !required.write)
    }

    /// Build an access set from permission names (`read`, `write`).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] on an unknown permission name.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ChannelError> {
        let mut access = Self::NONE;
        for name in names {
            match name.as_ref().trim().to_ascii_lowercase().as_str() {
                "read" | "r" => access.read = true,
                "write" | "w" => access.write = true,
                other => {
                    return Err(ChannelError::configuration(format!(
                        "unknown permission '{other}'"
                    )));
                },
            }
        }
        Ok(access)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.read { "r" } else { "-" };
        let w = if self.write { "w" } else { "-" };
        write!(f, "{r}{w}")
    }
}

/// One principal → permissions mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessEntry {
    /// Who the entry applies to.
    pub principal: Principal,
    /// What the entry grants.
    pub access: Access,
}

/// Outcome of a descriptor check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// The peer is permitted; carries the entry that granted access.
    Granted(AccessEntry),
    /// The peer is not permitted.
    Denied {
        /// Human-readable reason, safe to send to the peer.
        reason: String,
    },
}

impl AccessDecision {
    /// Returns `true` if access was granted.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Immutable access-control object attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDescriptor {
    entries: Vec<AccessEntry>,
    owner_uid: u32,
    owner_gid: u32,
}

impl SecurityDescriptor {
    /// Start building a descriptor.
    #[must_use]
    pub fn builder() -> SecurityDescriptorBuilder {
        SecurityDescriptorBuilder::new()
    }

    /// Descriptor granting read/write to the server's own user only.
    #[must_use]
    pub fn owner_only() -> Self {
        Self {
            entries: vec![AccessEntry {
                principal: Principal::Owner,
                access: Access::READ_WRITE,
            }],
            owner_uid: Uid::effective().as_raw(),
            owner_gid: Gid::effective().as_raw(),
        }
    }

    /// The access entries, in evaluation order.
    #[must_use]
    pub fn entries(&self) -> &[AccessEntry] {
        &self.entries
    }

    /// Effective uid the `owner` principal resolves to.
    #[must_use]
    pub const fn owner_uid(&self) -> u32 {
        self.owner_uid
    }

    /// Check a peer against the descriptor.
    ///
    /// Access is granted if some entry matches the peer AND grants every
    /// permission in `required`. A matching entry with insufficient
    /// permissions does not stop evaluation; a later entry may still grant.
    #[must_use]
    pub fn check(&self, peer: &PeerCredentials, required: Access) -> AccessDecision {
        let mut matched_insufficient = false;
        for entry in &self.entries {
            if entry.principal.matches(peer, self.owner_uid) {
                if entry.access.contains(required) {
                    return AccessDecision::Granted(*entry);
                }
                matched_insufficient = true;
            }
        }

        let reason = if matched_insufficient {
            format!("insufficient permissions: {required} required")
        } else {
            "principal not permitted".to_string()
        };
        AccessDecision::Denied { reason }
    }

    /// File mode for the channel socket.
    #[must_use]
    pub fn socket_mode(&self) -> u32 {
        if self.entries.iter().any(|e| match e.principal {
            Principal::Everyone => true,
            Principal::User(uid) => uid != self.owner_uid,
            Principal::Owner | Principal::Group(_) => false,
        }) {
            EVERYONE_SOCKET_MODE
        } else if self
            .entries
            .iter()
            .any(|e| matches!(e.principal, Principal::Group(_)))
        {
            GROUP_SOCKET_MODE
        } else {
            OWNER_SOCKET_MODE
        }
    }

    /// Group the socket file must be owned by, if it differs from the
    /// server's own group.
    ///
    /// Only one foreign group can be expressed through file ownership; with
    /// several group entries the first foreign one wins and the rest rely
    /// on the credential check alone.
    #[must_use]
    pub fn socket_group(&self) -> Option<u32> {
        self.entries.iter().find_map(|e| match e.principal {
            Principal::Group(gid) if gid != self.owner_gid => Some(gid),
            _ => None,
        })
    }
}

/// Builder for [`SecurityDescriptor`].
///
/// Resolution errors are collected and reported by [`build`](Self::build),
/// so a descriptor is either fully valid or not produced at all.
#[derive(Debug, Default)]
pub struct SecurityDescriptorBuilder {
    entries: Vec<AccessEntry>,
    errors: Vec<String>,
}

impl SecurityDescriptorBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `access` to a resolved principal.
    #[must_use]
    pub fn allow(mut self, principal: Principal, access: Access) -> Self {
        self.entries.push(AccessEntry { principal, access });
        self
    }

    /// Grant `access` to a principal given as a spec string
    /// (`owner`, `uid:1000`, `group:wheel`, ...).
    #[must_use]
    pub fn allow_spec(mut self, spec: &str, access: Access) -> Self {
        match Principal::resolve(spec) {
            Ok(principal) => self.entries.push(AccessEntry { principal, access }),
            Err(e) => self.errors.push(e.to_string()),
        }
        self
    }

    /// Finish the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if any principal failed to
    /// resolve, the descriptor is empty, or an entry grants nothing.
    pub fn build(self) -> Result<SecurityDescriptor, ChannelError> {
        if !self.errors.is_empty() {
            return Err(ChannelError::configuration(format!(
                "security descriptor: {}",
                self.errors.join("; ")
            )));
        }
        if self.entries.is_empty() {
            return Err(ChannelError::configuration(
                "security descriptor has no access entries",
            ));
        }
        if let Some(entry) = self.entries.iter().find(|e| e.access.is_empty()) {
            return Err(ChannelError::configuration(format!(
                "access entry for {} grants no permissions",
                entry.principal
            )));
        }

        Ok(SecurityDescriptor {
            entries: self.entries,
            owner_uid: Uid::effective().as_raw(),
            owner_gid: Gid::effective().as_raw(),
        })
    }
}
