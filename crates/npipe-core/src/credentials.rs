//! Peer credentials of a connected Unix socket.
//!
//! `SO_PEERCRED` only reports the peer's effective uid, gid and pid. Group
//! principals also have to match supplementary groups, so those are looked
//! up separately:
//!
//! 1. `/proc/<pid>/status` (`Groups:` line), the peer process's actual set
//! 2. the user database (`getgrouplist`) when the pid is unknown or the
//!    process is already gone

use std::ffi::CString;
use std::io;

use nix::unistd::{Gid, Uid, User};
use tokio::net::UnixStream;

/// Identity of the process on the other end of a channel connection.
///
/// Read from the kernel and the system databases, never from anything the
/// peer sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Effective user id of the peer.
    pub uid: u32,
    /// Effective group id of the peer.
    pub gid: u32,
    /// Process id, where the platform reports it.
    pub pid: Option<i32>,
    /// Supplementary group ids of the peer.
    pub groups: Vec<u32>,
}

impl PeerCredentials {
    /// Extract credentials from a connected stream.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the credentials cannot be queried.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        let (uid, gid, pid) = (cred.uid(), cred.gid(), cred.pid());
        Ok(Self {
            uid,
            gid,
            pid,
            groups: supplementary_groups(uid, gid, pid),
        })
    }

    /// Credentials of the current process.
    #[must_use]
    pub fn current_process() -> Self {
        Self {
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            pid: i32::try_from(std::process::id()).ok(),
            groups: nix::unistd::getgroups()
                .map(|groups| groups.into_iter().map(|gid| gid.as_raw()).collect())
                .unwrap_or_default(),
        }
    }

    /// Effective gid followed by every supplementary group.
    pub fn group_ids(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.gid).chain(self.groups.iter().copied())
    }
}

fn supplementary_groups(uid: u32, gid: u32, pid: Option<i32>) -> Vec<u32> {
    pid.and_then(|pid| std::fs::read_to_string(format!("/proc/{pid}/status")).ok())
        .and_then(|status| parse_status_groups(&status))
        .unwrap_or_else(|| database_groups(uid, gid))
}

/// Group ids from the `Groups:` line of a `/proc/<pid>/status` file.
fn parse_status_groups(status: &str) -> Option<Vec<u32>> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Groups:"))
        .map(|ids| ids.split_whitespace().filter_map(|id| id.parse().ok()).collect())
}

fn database_groups(uid: u32, gid: u32) -> Vec<u32> {
    let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid)) else {
        return Vec::new();
    };
    let Ok(name) = CString::new(user.name) else {
        return Vec::new();
    };
    nix::unistd::getgrouplist(&name, Gid::from_raw(gid))
        .map(|groups| groups.into_iter().map(|gid| gid.as_raw()).collect())
        .unwrap_or_default()
}
