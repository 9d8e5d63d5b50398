//! Error types shared by the listener, workers and clients.
//!
//! # Error Hierarchy
//!
//! - [`ChannelError`]: top-level error for channel operations. Each variant
//!   corresponds to one failure class with its own propagation policy (see
//!   the variant docs).
//! - [`ProtocolError`]: frame-level failures (size limits, malformed
//!   admission, timeouts, closed connections).
//!
//! Session-level failures never cross from a worker into the listener; the
//! classification helpers here let each side decide whether an error ends a
//! session normally, ends it abnormally, or is worth a retry.

use std::io;

use thiserror::Error;

/// Default maximum message size in bytes (16 KiB).
///
/// One message is carried in one frame, so this is also the default frame
/// payload limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Hard upper bound on any configured message size (16 MiB).
///
/// Frame lengths are validated against the configured limit BEFORE the
/// payload is buffered.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of the admission frame sent at connection start.
pub const MAX_ADMISSION_FRAME_SIZE: usize = 4 * 1024;

/// Version of the admission/echo protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame-level protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the negotiated maximum size.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Size announced by the length prefix (or the outgoing payload).
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame contents could not be interpreted.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing error.
        reason: String,
    },

    /// Peer speaks an incompatible protocol version.
    #[error("version mismatch: peer version {peer_version}, local version {local_version}")]
    VersionMismatch {
        /// Version announced by the peer.
        peer_version: u32,
        /// Version implemented locally.
        local_version: u32,
    },

    /// The connection closed before the expected frame arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response arrived in time.
    #[error("operation timed out after {duration_ms} ms")]
    Timeout {
        /// Elapsed time before giving up, in milliseconds.
        duration_ms: u64,
    },

    /// Transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Create a frame too large error.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// Create a version mismatch error against [`PROTOCOL_VERSION`].
    #[must_use]
    pub const fn version_mismatch(peer_version: u32) -> Self {
        Self::VersionMismatch {
            peer_version,
            local_version: PROTOCOL_VERSION,
        }
    }

    /// Create a timeout error.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // timeouts are far below u64::MAX ms
    pub const fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create an invalid frame error.
    #[must_use]
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying on a fresh connection may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionClosed)
    }

    /// Returns `true` if the error means the peer went away.
    ///
    /// End-of-stream, broken pipes and resets are how a peer disconnect
    /// surfaces on a stream socket; none of them is a failure of the session.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }

    /// Returns `true` if the peer violated the framing contract.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. } | Self::InvalidFrame { .. } | Self::VersionMismatch { .. }
        )
    }
}

/// Returns `true` for I/O error kinds that mean "the peer is gone".
#[must_use]
pub fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Channel-level errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Security descriptor or channel setup failed.
    ///
    /// Fatal at listener startup: the listener never runs with an
    /// unrestricted or half-configured channel.
    #[error("configuration error: {reason}")]
    Configuration {
        /// What could not be configured.
        reason: String,
    },

    /// The OS refused to allocate another channel instance.
    ///
    /// Retried with bounded backoff by the listener, fatal once the retry
    /// budget is spent.
    #[error("resource exhaustion after {attempts} attempt(s): {source}")]
    ResourceExhaustion {
        /// Consecutive failed attempts so far.
        attempts: u32,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The instance was invalidated before a client connected.
    ///
    /// Raised when shutdown is requested while the listener is waiting.
    #[error("connection aborted: {reason}")]
    ConnectionAborted {
        /// Why the wait was abandoned.
        reason: String,
    },

    /// The peer closed its end of the session. Not a failure.
    ///
    /// Workers end the session quietly on it; clients see it when the
    /// server hangs up in the middle of a request.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// Any other read/write failure; fatal to the owning session only.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No listener instance is ready to accept the client.
    #[error("server unavailable: {reason}")]
    ServerUnavailable {
        /// Why the server could not be reached.
        reason: String,
    },

    /// The security descriptor refused the connecting principal.
    #[error("access denied: {reason}")]
    AccessDenied {
        /// Reason reported by the server.
        reason: String,
    },

    /// Frame-level protocol failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ChannelError {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a server unavailable error.
    #[must_use]
    pub fn server_unavailable(reason: impl Into<String>) -> Self {
        Self::ServerUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a connection aborted error.
    #[must_use]
    pub fn connection_aborted(reason: impl Into<String>) -> Self {
        Self::ConnectionAborted {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the caller may retry the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ServerUnavailable { .. } | Self::ResourceExhaustion { .. } => true,
            Self::Protocol(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Returns `true` if the error must stop the listener.
    #[must_use]
    pub const fn is_fatal_to_listener(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::ResourceExhaustion { .. }
        )
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_frame_too_large_error() {
        let err = ProtocolError::frame_too_large(20_000, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(err.is_protocol_violation());
        assert!(!err.is_recoverable());
        assert!(!err.is_disconnect());

        let msg = err.to_string();
        assert!(msg.contains("20000"));
        assert!(msg.contains(&DEFAULT_MAX_MESSAGE_SIZE.to_string()));
    }

    #[test]
    fn test_timeout_is_recoverable() {
        let err = ProtocolError::timeout(Duration::from_millis(1500));
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("1500"));

        let channel_err = ChannelError::from(err);
        assert!(channel_err.is_retryable());
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(ProtocolError::ConnectionClosed.is_disconnect());
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert!(ProtocolError::Io(io::Error::from(kind)).is_disconnect());
        }
        assert!(!ProtocolError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_disconnect());
    }

    #[test]
    fn test_listener_fatality() {
        assert!(ChannelError::configuration("bad principal").is_fatal_to_listener());
        assert!(ChannelError::ResourceExhaustion {
            attempts: 3,
            source: io::Error::other("EMFILE"),
        }
        .is_fatal_to_listener());
        assert!(!ChannelError::connection_aborted("shutdown").is_fatal_to_listener());
        assert!(!ChannelError::PeerDisconnected.is_fatal_to_listener());
    }

    #[test]
    fn test_client_side_retryability() {
        assert!(ChannelError::server_unavailable("busy").is_retryable());
        assert!(!ChannelError::AccessDenied {
            reason: "nope".into()
        }
        .is_retryable());
    }

    const _: () = assert!(MAX_ADMISSION_FRAME_SIZE < DEFAULT_MAX_MESSAGE_SIZE);
    const _: () = assert!(DEFAULT_MAX_MESSAGE_SIZE <= MAX_FRAME_SIZE);
}
