//! Per-client echo worker.
//!
//! Each admitted connection is served by one task running [`serve`]:
//!
//! 1. Read one frame. This is the worker's main suspension point and also
//!    wakes when shutdown is requested.
//! 2. Write the identical payload back as one frame.
//! 3. Repeat until the peer disconnects.
//!
//! A worker owns its [`ClientSession`] outright and shares nothing mutable
//! with other workers or the listener except the shared [`ServerStats`].
//! Failures stay inside the session: they are logged with the connection id
//! and reported as a [`SessionEnd`], never propagated to the listener.

use std::fmt;
use std::sync::Arc;

use npipe_core::ChannelError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::ClientSession;
use crate::stats::ServerStats;

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The client closed its end. The normal outcome.
    PeerDisconnected,
    /// Shutdown was requested while the worker waited for a request.
    Shutdown,
    /// The shutdown grace period ran out while the worker was writing.
    ForcedClose,
    /// The session failed; the error is contained to this session.
    Failed(ChannelError),
}

impl SessionEnd {
    /// Returns `true` for outcomes counted as failures.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::ForcedClose | Self::Failed(_))
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerDisconnected => write!(f, "peer disconnected"),
            Self::Shutdown => write!(f, "server shutdown"),
            Self::ForcedClose => write!(f, "force-closed after grace period"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Echo frames on `session` until it ends.
///
/// `shutdown` is observed only while waiting for the next request, so an
/// in-flight echo completes. `force_close` is observed only while writing,
/// and interrupts a write the peer never drains.
pub async fn serve(
    session: &mut ClientSession,
    shutdown: &CancellationToken,
    force_close: &CancellationToken,
) -> SessionEnd {
    loop {
        let frame = tokio::select! {
            biased;
            () = shutdown.cancelled() => return SessionEnd::Shutdown,
            frame = session.handle_mut().recv() => frame,
        };

        let payload = match frame {
            Some(Ok(payload)) => payload.freeze(),
            None => return SessionEnd::PeerDisconnected,
            Some(Err(e)) if e.is_disconnect() => return SessionEnd::PeerDisconnected,
            Some(Err(e)) => return SessionEnd::Failed(e.into()),
        };

        let len = payload.len();
        let written = tokio::select! {
            biased;
            () = force_close.cancelled() => return SessionEnd::ForcedClose,
            result = session.handle_mut().send(payload) => result,
        };

        match written {
            Ok(()) => session.record(len),
            Err(e) if e.is_disconnect() => return SessionEnd::PeerDisconnected,
            Err(e) => return SessionEnd::Failed(e.into()),
        }
    }
}

/// Worker task body: serve the session, log the outcome, update counters.
///
/// The session is dropped when this returns, closing the handle and
/// releasing its slot.
pub async fn run(
    mut session: ClientSession,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    stats: Arc<ServerStats>,
) -> SessionEnd {
    let connection_id = session.connection_id();
    debug!(
        connection_id,
        uid = session.peer().uid,
        pid = ?session.peer().pid,
        "Worker started"
    );

    let end = serve(&mut session, &shutdown, &force_close).await;
    stats.record_echoes(session.messages(), session.bytes());
    stats.record_end(end.is_failure());

    match &end {
        SessionEnd::PeerDisconnected | SessionEnd::Shutdown => {
            info!(
                connection_id,
                messages = session.messages(),
                bytes = session.bytes(),
                outcome = %end,
                "Session closed"
            );
        },
        SessionEnd::ForcedClose => {
            warn!(
                connection_id,
                messages = session.messages(),
                "Session force-closed during shutdown"
            );
        },
        SessionEnd::Failed(error) => {
            warn!(
                connection_id,
                messages = session.messages(),
                error = %error,
                "Session failed"
            );
        },
    }

    end
}
