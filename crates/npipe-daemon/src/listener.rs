//! Channel listener: binds the channel and dispatches one worker per client.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            │                ChannelListener               │
//!  Idle ───► │ CreatingInstance ─► WaitingForConnection ─┐  │
//!            │        ▲                                   │  │
//!            │        └──────────── Dispatched ◄──────────┘  │
//!            └──────────────┬───────────────────────────────┘
//!                           │ shutdown / retry budget spent
//!                           ▼
//!                      ShuttingDown
//! ```
//!
//! - **Creating an instance** reserves one slot from the bounded session
//!   pool. While the pool is full no further connection is accepted;
//!   clients queue in the socket backlog and eventually time out waiting
//!   for their admission frame.
//! - **Waiting for a connection** accepts the next client. A client that
//!   connected before the listener got here is already in the backlog and
//!   is returned immediately.
//! - **Dispatching** checks the peer against the [`SecurityDescriptor`],
//!   sends the admission frame and hands the session to a worker task. The
//!   listener never touches a dispatched handle again.
//!
//! # Security Considerations
//!
//! - The socket mode is derived from the descriptor and applied right after
//!   bind; a foreign group entry also changes the socket's group
//! - The peer credential check on every connection is authoritative
//! - A newly created socket directory gets mode 0700 (0711 when other users
//!   must reach the socket); existing directories are left untouched
//! - Symlinked socket directories are refused
//! - A socket file with a live server behind it is never replaced
//!
//! # Invariants
//!
//! - At most `max_sessions` sessions are served at once
//! - Every dispatched session owns its slot; the slot is released when the
//!   session drops
//! - The socket file is removed when the listener drops

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::unistd::Gid;
use npipe_core::admission::{Accepted, Admission};
use npipe_core::config::NpipeConfig;
use npipe_core::error::MAX_ADMISSION_FRAME_SIZE;
use npipe_core::security::{Access, AccessDecision};
use npipe_core::{
    ChannelError, ChannelResult, FrameCodec, PeerCredentials, SecurityDescriptor,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::session::{ChannelHandle, ClientSession};
use crate::stats::ServerStats;
use crate::worker;

/// Default maximum concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Default number of consecutive accept failures tolerated.
pub const DEFAULT_ACCEPT_RETRY_BUDGET: u32 = 5;

/// Default initial backoff after a failed accept.
pub const DEFAULT_ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on the accept backoff.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(5);

/// Mode for a socket directory only the owner needs to reach.
const PRIVATE_DIRECTORY_MODE: u32 = 0o700;

/// Mode for a socket directory other users must traverse but not list.
const SHARED_DIRECTORY_MODE: u32 = 0o711;

/// Observable listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Bound, loop not yet started.
    Idle,
    /// Reserving a session slot.
    CreatingInstance,
    /// Slot reserved, waiting for a client.
    WaitingForConnection,
    /// A client was handed to a worker.
    Dispatched,
    /// The loop has exited; no new clients are accepted.
    ShuttingDown,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::CreatingInstance => write!(f, "creating_instance"),
            Self::WaitingForConnection => write!(f, "waiting_for_connection"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Socket path the channel is bound at.
    pub socket_path: PathBuf,

    /// Maximum concurrently served sessions.
    pub max_sessions: usize,

    /// Largest echoed message.
    pub max_message_size: usize,

    /// Consecutive accept failures tolerated before the listener exits.
    pub accept_retry_budget: u32,

    /// Initial backoff after a failed accept; doubles per failure.
    pub accept_backoff: Duration,

    /// Server identifier sent in the admission frame.
    pub server_info: String,
}

impl ListenerConfig {
    /// Create a configuration with defaults for everything but the path.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            accept_retry_budget: DEFAULT_ACCEPT_RETRY_BUDGET,
            accept_backoff: DEFAULT_ACCEPT_BACKOFF,
            server_info: format!("npiped/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Derive the listener configuration from `npipe.toml` values.
    #[must_use]
    pub fn from_config(config: &NpipeConfig) -> Self {
        Self::new(config.socket_path())
            .with_max_sessions(config.limits.max_sessions)
            .with_max_message_size(config.limits.max_message_size)
            .with_accept_retry(
                config.limits.accept_retry_budget,
                config.limits.accept_backoff(),
            )
    }

    /// Set the session pool size.
    #[must_use]
    pub const fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Set the accept retry budget and initial backoff.
    #[must_use]
    pub const fn with_accept_retry(mut self, budget: u32, backoff: Duration) -> Self {
        self.accept_retry_budget = budget;
        self.accept_backoff = backoff;
        self
    }

    /// Set the server info string.
    #[must_use]
    pub fn with_server_info(mut self, info: impl Into<String>) -> Self {
        self.server_info = info.into();
        self
    }
}

/// A reserved session slot, waiting for a client.
#[derive(Debug)]
pub struct Instance {
    slot: OwnedSemaphorePermit,
}

/// A client accepted on an instance, not yet authorised.
#[derive(Debug)]
pub struct PendingConnection {
    stream: UnixStream,
    slot: OwnedSemaphorePermit,
}

/// The channel listener.
pub struct ChannelListener {
    config: ListenerConfig,
    listener: UnixListener,
    descriptor: Arc<SecurityDescriptor>,
    slots: Arc<Semaphore>,
    state: watch::Sender<ListenerState>,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<ServerStats>,
    next_connection_id: AtomicU64,
}

impl ChannelListener {
    /// Bind the channel socket and apply the descriptor's access rules.
    ///
    /// This will:
    /// 1. Create the socket directory if needed
    /// 2. Refuse to continue if a live server owns the socket
    /// 3. Remove a stale socket file left by a crashed server
    /// 4. Bind, then set the socket mode (and group) from the descriptor
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if any step fails or the
    /// limits are out of range.
    pub fn bind(config: ListenerConfig, descriptor: Arc<SecurityDescriptor>) -> ChannelResult<Self> {
        if config.max_sessions == 0 {
            return Err(ChannelError::configuration("max_sessions must be at least 1"));
        }
        if config.max_message_size == 0 || config.max_message_size > npipe_core::MAX_FRAME_SIZE {
            return Err(ChannelError::configuration(format!(
                "max_message_size must be in 1..={}",
                npipe_core::MAX_FRAME_SIZE
            )));
        }
        let stats = ServerStats::new()
            .map_err(|e| ChannelError::configuration(format!("failed to set up metrics: {e}")))?;

        let path = &config.socket_path;
        let socket_mode = descriptor.socket_mode();
        if let Some(parent) = path.parent() {
            let dir_mode = if socket_mode == npipe_core::security::OWNER_SOCKET_MODE {
                PRIVATE_DIRECTORY_MODE
            } else {
                SHARED_DIRECTORY_MODE
            };
            ensure_directory(parent, dir_mode)?;
        }
        cleanup_stale_socket(path)?;

        let listener = UnixListener::bind(path).map_err(|e| {
            ChannelError::configuration(format!("failed to bind {}: {e}", path.display()))
        })?;

        set_socket_permissions(path, socket_mode)?;
        if let Some(gid) = descriptor.socket_group() {
            nix::unistd::chown(path, None, Some(Gid::from_raw(gid))).map_err(|e| {
                ChannelError::configuration(format!(
                    "failed to change group of {} to {gid}: {e}",
                    path.display()
                ))
            })?;
        }

        info!(
            socket_path = %path.display(),
            mode = format_args!("{socket_mode:o}"),
            max_sessions = config.max_sessions,
            max_message_size = config.max_message_size,
            "Channel listener bound"
        );

        let (state, _) = watch::channel(ListenerState::Idle);
        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_sessions)),
            config,
            listener,
            descriptor,
            state,
            shutdown: CancellationToken::new(),
            force_close: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stats: Arc::new(stats),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Reserve a slot for the next session.
    ///
    /// Waits while all `max_sessions` slots are in use.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionAborted`] if shutdown is requested
    /// first.
    pub async fn create_instance(&self) -> ChannelResult<Instance> {
        self.set_state(ListenerState::CreatingInstance);
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(ChannelError::connection_aborted(
                "shutdown requested while waiting for a session slot",
            )),
            slot = Arc::clone(&self.slots).acquire_owned() => slot
                .map(|slot| Instance { slot })
                .map_err(|_| ChannelError::connection_aborted("session pool closed")),
        }
    }

    /// Accept the next client on `instance`.
    ///
    /// OS resource exhaustion is retried with exponential backoff until
    /// `accept_retry_budget` consecutive attempts have failed. A client that
    /// aborted before it could be accepted is skipped.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ConnectionAborted`] if shutdown is requested
    /// - [`ChannelError::ResourceExhaustion`] once the retry budget is spent
    /// - [`ChannelError::Io`] for any other accept failure
    pub async fn wait_for_connection(&self, instance: Instance) -> ChannelResult<PendingConnection> {
        self.set_state(ListenerState::WaitingForConnection);
        let mut streak =
            FailureStreak::new(self.config.accept_retry_budget, self.config.accept_backoff);

        loop {
            let accepted = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    return Err(ChannelError::connection_aborted(
                        "shutdown requested while waiting for a client",
                    ));
                },
                result = self.listener.accept() => result,
            };

            match accepted {
                Ok((stream, _addr)) => {
                    return Ok(PendingConnection {
                        stream,
                        slot: instance.slot,
                    });
                },
                Err(e) if is_resource_exhaustion(&e) => {
                    let Some(delay) = streak.record() else {
                        return Err(ChannelError::ResourceExhaustion {
                            attempts: streak.count(),
                            source: e,
                        });
                    };
                    warn!(
                        error = %e,
                        attempt = streak.count(),
                        budget = self.config.accept_retry_budget,
                        delay_ms = millis(delay),
                        "Accept failed for lack of resources, backing off"
                    );
                    if !self.pause(delay).await {
                        return Err(ChannelError::connection_aborted(
                            "shutdown requested during accept backoff",
                        ));
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!(error = %e, "Client aborted before accept");
                },
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }

    /// Check the peer and send its admission frame.
    ///
    /// Returns `None` when the peer is denied or vanished during admission;
    /// either way its slot is released.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] if the peer's credentials cannot be read.
    pub async fn authorize(&self, pending: PendingConnection) -> ChannelResult<Option<ClientSession>> {
        let PendingConnection { stream, slot } = pending;
        let peer = PeerCredentials::from_stream(&stream)?;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let decision = self.descriptor.check(&peer, Access::READ_WRITE);
        let (uid, gid, pid) = (peer.uid, peer.gid, peer.pid);

        let mut handle = ChannelHandle::new(
            connection_id,
            peer,
            stream,
            FrameCodec::new(MAX_ADMISSION_FRAME_SIZE.max(self.config.max_message_size)),
        );

        match decision {
            AccessDecision::Granted(entry) => {
                let admission = Admission::Accepted(Accepted::new(
                    self.config.server_info.clone(),
                    self.config.max_message_size,
                    connection_id,
                ));
                if let Err(e) = send_admission(&mut handle, &admission).await {
                    debug!(connection_id, error = %e, "Client left during admission");
                    return Ok(None);
                }
                handle.set_max_frame_size(self.config.max_message_size);

                debug!(
                    connection_id,
                    uid,
                    gid,
                    pid = ?pid,
                    principal = %entry.principal,
                    "Client admitted"
                );
                Ok(Some(ClientSession::new(handle, slot, self.stats.admit())))
            },
            AccessDecision::Denied { reason } => {
                self.stats.record_rejected();
                warn!(
                    connection_id,
                    uid,
                    gid,
                    pid = ?pid,
                    reason = %reason,
                    "Client denied"
                );
                if let Err(e) = send_admission(&mut handle, &Admission::denied(reason)).await {
                    debug!(connection_id, error = %e, "Failed to deliver denial");
                }
                Ok(None)
            },
        }
    }

    /// Hand a session to a new worker task.
    pub fn dispatch(&self, session: ClientSession) {
        self.set_state(ListenerState::Dispatched);
        self.tracker.spawn(worker::run(
            session,
            self.shutdown.clone(),
            self.force_close.clone(),
            Arc::clone(&self.stats),
        ));
    }

    /// Run the accept loop until shutdown or a fatal error.
    ///
    /// Any other failed step is retried after the same backoff as resource
    /// exhaustion, and more than `accept_retry_budget` of them in a row stop
    /// the loop.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ResourceExhaustion`] when accepting kept
    /// failing past the retry budget, or the last error of a run of other
    /// failures past it. A requested shutdown returns `Ok`.
    pub async fn run(self) -> ChannelResult<()> {
        info!(
            socket_path = %self.config.socket_path.display(),
            "Channel listener running"
        );
        let mut streak =
            FailureStreak::new(self.config.accept_retry_budget, self.config.accept_backoff);

        let result = loop {
            let step = async {
                let instance = self.create_instance().await?;
                let pending = self.wait_for_connection(instance).await?;
                self.authorize(pending).await
            };

            match step.await {
                Ok(Some(session)) => {
                    streak.reset();
                    self.dispatch(session);
                },
                Ok(None) => streak.reset(),
                Err(ChannelError::ConnectionAborted { reason }) => {
                    info!(reason = %reason, "Channel listener stopping");
                    break Ok(());
                },
                Err(e) if e.is_fatal_to_listener() => {
                    error!(error = %e, "Channel listener failed");
                    break Err(e);
                },
                Err(e) => {
                    let Some(delay) = streak.record() else {
                        error!(
                            error = %e,
                            failures = streak.count(),
                            "Channel listener giving up after repeated failures"
                        );
                        break Err(e);
                    };
                    warn!(
                        error = %e,
                        attempt = streak.count(),
                        delay_ms = millis(delay),
                        "Failed to accept client, backing off"
                    );
                    if !self.pause(delay).await {
                        info!("Channel listener stopping during backoff");
                        break Ok(());
                    }
                },
            }
        };

        self.set_state(ListenerState::ShuttingDown);
        result
    }

    /// Sleep for `delay`. Returns `false` if shutdown was requested first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Returns the socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Returns the listener configuration.
    #[must_use]
    pub const fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Token that stops the listener and idle workers.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token that interrupts workers blocked in a write.
    #[must_use]
    pub fn force_close_token(&self) -> CancellationToken {
        self.force_close.clone()
    }

    /// Tracker holding every worker task.
    #[must_use]
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Shared session counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Remove the socket file.
    ///
    /// Called automatically on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn cleanup(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.config.socket_path) {
            Ok(()) => {
                info!(
                    socket_path = %self.config.socket_path.display(),
                    "Removed channel socket file"
                );
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(
                socket_path = %self.config.socket_path.display(),
                error = %e,
                "Failed to remove channel socket file"
            );
        }
    }
}

async fn send_admission(handle: &mut ChannelHandle, admission: &Admission) -> ChannelResult<()> {
    let frame: Bytes = admission.to_frame()?;
    handle.send(frame).await?;
    Ok(())
}

/// Returns `true` for accept errors meaning the OS is out of descriptors or
/// memory.
#[must_use]
pub fn is_resource_exhaustion(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error().map(Errno::from_raw),
        Some(Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM)
    )
}

/// Delay before accept retry number `attempt` (1-based).
#[must_use]
pub fn accept_backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent).min(MAX_ACCEPT_BACKOFF)
}

/// Consecutive failures, each owed an exponential backoff until the budget
/// is spent.
#[derive(Debug)]
struct FailureStreak {
    count: u32,
    budget: u32,
    base: Duration,
}

impl FailureStreak {
    const fn new(budget: u32, base: Duration) -> Self {
        Self {
            count: 0,
            budget,
            base,
        }
    }

    /// Count one failure. Returns the delay before the next attempt, or
    /// `None` once more than `budget` failures have happened in a row.
    fn record(&mut self) -> Option<Duration> {
        self.count = self.count.saturating_add(1);
        (self.count <= self.budget).then(|| accept_backoff(self.base, self.count))
    }

    const fn count(&self) -> u32 {
        self.count
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Ensure the socket directory exists.
///
/// Existing directories keep their permissions; only a directory created
/// here gets `mode`. Symlinks are refused.
fn ensure_directory(path: &Path, mode: u32) -> ChannelResult<()> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(ChannelError::configuration(format!(
                    "{} is a symlink, refusing to use it as socket directory",
                    path.display()
                )));
            }
            if !metadata.is_dir() {
                return Err(ChannelError::configuration(format!(
                    "{} exists but is not a directory",
                    path.display()
                )));
            }
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path).map_err(|e| {
                ChannelError::configuration(format!(
                    "failed to create directory {}: {e}",
                    path.display()
                ))
            })?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
                ChannelError::configuration(format!(
                    "failed to set permissions on {}: {e}",
                    path.display()
                ))
            })
        },
        Err(e) => Err(ChannelError::configuration(format!(
            "failed to stat {}: {e}",
            path.display()
        ))),
    }
}

/// Remove a socket file left behind by a server that is no longer running.
fn cleanup_stale_socket(path: &Path) -> ChannelResult<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(ChannelError::configuration(format!(
                "failed to stat {}: {e}",
                path.display()
            )));
        },
    };

    if !metadata.file_type().is_socket() {
        return Err(ChannelError::configuration(format!(
            "{} exists but is not a socket",
            path.display()
        )));
    }

    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(ChannelError::configuration(format!(
            "channel at {} is already being served",
            path.display()
        )));
    }

    std::fs::remove_file(path).map_err(|e| {
        ChannelError::configuration(format!(
            "failed to remove stale socket {}: {e}",
            path.display()
        ))
    })?;
    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

fn set_socket_permissions(path: &Path, mode: u32) -> ChannelResult<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        ChannelError::configuration(format!(
            "failed to set socket permissions on {}: {e}",
            path.display()
        ))
    })
}
