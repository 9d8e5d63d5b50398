//! Server lifecycle: start the listener, stop it gracefully.
//!
//! Shutdown runs in two phases:
//!
//! 1. Cancel the shutdown token. The listener stops accepting and removes
//!    its socket; workers waiting for a request end their sessions.
//! 2. Wait up to the grace period for workers still busy echoing. When it
//!    runs out, cancel the force-close token so workers blocked in a write
//!    give up, then wait for the rest.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use npipe_core::{ChannelError, ChannelResult, SecurityDescriptor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::listener::{ChannelListener, ListenerConfig, ListenerState};
use crate::stats::{ServerStats, StatsSnapshot};

/// Outcome of [`EchoServer::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers were still running when the grace period ended.
    pub forced: bool,
    /// Counters after every worker finished.
    pub stats: StatsSnapshot,
}

/// A running echo server.
pub struct EchoServer {
    socket_path: PathBuf,
    state: watch::Receiver<ListenerState>,
    stats: Arc<ServerStats>,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    tracker: TaskTracker,
    listener_task: JoinHandle<ChannelResult<()>>,
}

impl EchoServer {
    /// Bind the channel and start accepting clients.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if the channel cannot be bound.
    pub fn start(config: ListenerConfig, descriptor: SecurityDescriptor) -> ChannelResult<Self> {
        let listener = ChannelListener::bind(config, Arc::new(descriptor))?;

        let server = Self {
            socket_path: listener.socket_path().to_path_buf(),
            state: listener.subscribe_state(),
            stats: listener.stats(),
            shutdown: listener.shutdown_token(),
            force_close: listener.force_close_token(),
            tracker: listener.tracker(),
            listener_task: tokio::spawn(listener.run()),
        };
        Ok(server)
    }

    /// Socket path the channel is bound at.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Current listener state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Counters at this instant.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolve once the listener loop has exited, for whatever reason.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        // A closed channel means the listener is gone, which is also "stopped".
        let _ = state.wait_for(|s| *s == ListenerState::ShuttingDown).await;
    }

    /// Stop the server and wait for every session to end.
    ///
    /// # Errors
    ///
    /// Returns the error the listener exited with, if it exited on its own
    /// before shutdown was requested (e.g. resource exhaustion).
    pub async fn shutdown(self, grace: Duration) -> ChannelResult<ShutdownReport> {
        info!(
            socket_path = %self.socket_path.display(),
            active = self.stats.snapshot().active,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Shutting down echo server"
        );
        self.shutdown.cancel();

        let listener_result = match self.listener_task.await {
            Ok(result) => result,
            Err(e) => Err(ChannelError::Io(std::io::Error::other(format!(
                "listener task failed: {e}"
            )))),
        };

        self.tracker.close();
        let forced = if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                "Grace period elapsed, force-closing remaining sessions"
            );
            self.force_close.cancel();
            self.tracker.wait().await;
            true
        } else {
            false
        };

        let stats = self.stats.snapshot();
        info!(
            admitted = stats.admitted,
            rejected = stats.rejected,
            completed = stats.completed,
            failed = stats.failed,
            forced,
            "Echo server stopped"
        );

        listener_result.map(|()| ShutdownReport { forced, stats })
    }
}

impl std::fmt::Debug for EchoServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoServer")
            .field("socket_path", &self.socket_path)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
