//! Channel client.
//!
//! # Connection Sequence
//!
//! 1. Connect to the channel socket
//! 2. Read the admission frame; the server speaks first
//! 3. On `Accepted`, adopt the server's message size limit
//! 4. Exchange request/echo frames, one response per request
//!
//! # Error Mapping
//!
//! | Situation                                   | Error                          |
//! |---------------------------------------------|--------------------------------|
//! | socket missing or refusing                  | `ServerUnavailable`            |
//! | no admission within the connect timeout     | `ServerUnavailable`            |
//! | server closed before admission              | `ServerUnavailable`            |
//! | socket mode or descriptor excludes us       | `AccessDenied`                 |
//! | message above the negotiated limit          | `Protocol(FrameTooLarge)`      |
//! | no echo within the request timeout          | `Protocol(Timeout)`            |
//! | server closed during a request              | `PeerDisconnected`             |
//! | request after a failed exchange             | `Protocol(ConnectionClosed)`   |
//!
//! A timed-out or failed exchange can leave a late echo or half a frame on
//! the stream, so the client refuses further requests after one. Reconnect
//! to continue.

use std::io;
use std::path::Path;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use npipe_core::config::ClientSection;
use npipe_core::error::MAX_ADMISSION_FRAME_SIZE;
use npipe_core::{
    Accepted, Admission, ChannelError, ChannelName, ChannelResult, FrameCodec, ProtocolError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// Default time allowed for connect plus admission.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time allowed for one request/echo round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the delay between connection attempts.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Client timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Time allowed for connect plus admission.
    pub connect_timeout: Duration,
    /// Time allowed for one request/echo round trip.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Timeouts from the `[client]` configuration section.
    #[must_use]
    pub const fn from_section(section: &ClientSection) -> Self {
        Self {
            connect_timeout: section.connect_timeout(),
            request_timeout: section.request_timeout(),
        }
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Retry schedule for [`ChannelClient::connect_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles per attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy.
    #[must_use]
    pub const fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
        }
    }

    /// Retry policy from the `[client]` configuration section.
    #[must_use]
    pub const fn from_section(section: &ClientSection) -> Self {
        Self::new(section.connect_attempts, section.retry_backoff())
    }

    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exponent)
            .min(MAX_RETRY_BACKOFF)
    }
}

/// An admitted connection to a channel.
#[derive(Debug)]
pub struct ChannelClient {
    framed: Framed<UnixStream, FrameCodec>,
    accepted: Accepted,
    request_timeout: Duration,
    broken: bool,
}

impl ChannelClient {
    /// Connect with default timeouts.
    ///
    /// # Errors
    ///
    /// See [`connect_with`](Self::connect_with).
    pub async fn connect(socket_path: &Path) -> ChannelResult<Self> {
        Self::connect_with(socket_path, &ClientConfig::default()).await
    }

    /// Connect to a channel by name, resolving its socket from the
    /// environment (`$XDG_RUNTIME_DIR/npipe/<name>.sock`).
    ///
    /// # Errors
    ///
    /// See [`connect_with`](Self::connect_with).
    pub async fn connect_channel(name: &ChannelName, config: &ClientConfig) -> ChannelResult<Self> {
        Self::connect_with(&name.socket_path(), config).await
    }

    /// Connect and wait for admission.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ServerUnavailable`] if nothing listens on the
    ///   socket or no session slot frees up within the connect timeout
    /// - [`ChannelError::AccessDenied`] if the server refuses us
    /// - [`ChannelError::Protocol`] for a malformed admission frame
    pub async fn connect_with(socket_path: &Path, config: &ClientConfig) -> ChannelResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, UnixStream::connect(socket_path))
            .await
            .map_err(|_| {
                ChannelError::server_unavailable(format!(
                    "connect to {} timed out",
                    socket_path.display()
                ))
            })?
            .map_err(|e| map_connect_error(socket_path, e))?;

        let mut framed = Framed::new(stream, FrameCodec::new(MAX_ADMISSION_FRAME_SIZE));

        let frame = match tokio::time::timeout(config.connect_timeout, framed.next()).await {
            Err(_) => {
                return Err(ChannelError::server_unavailable(format!(
                    "no session slot available within {} ms",
                    config.connect_timeout.as_millis()
                )));
            },
            Ok(None) => {
                return Err(ChannelError::server_unavailable(
                    "server closed the connection before admission",
                ));
            },
            Ok(Some(Err(e))) if e.is_disconnect() => {
                return Err(ChannelError::server_unavailable(
                    "server closed the connection before admission",
                ));
            },
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(frame))) => frame,
        };

        let accepted = Admission::from_frame(&frame)?.into_result()?;
        framed
            .codec_mut()
            .set_max_frame_size(accepted.max_message_size);

        debug!(
            connection_id = accepted.connection_id,
            server_info = %accepted.server_info,
            max_message_size = accepted.max_message_size,
            "Connected to channel"
        );

        Ok(Self {
            framed,
            accepted,
            request_timeout: config.request_timeout,
            broken: false,
        })
    }

    /// Connect, retrying while the server is unavailable.
    ///
    /// Only [`ChannelError::ServerUnavailable`] is retried; access denials
    /// and protocol errors are returned at once.
    ///
    /// # Errors
    ///
    /// Returns the last error once `policy.max_attempts` attempts failed.
    pub async fn connect_with_retry(
        socket_path: &Path,
        config: &ClientConfig,
        policy: &RetryPolicy,
    ) -> ChannelResult<Self> {
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::connect_with(socket_path, config).await {
                Ok(client) => return Ok(client),
                Err(e @ ChannelError::ServerUnavailable { .. }) if attempt < attempts => {
                    let delay = policy.backoff(attempt);
                    info!(
                        socket_path = %socket_path.display(),
                        attempt,
                        max_attempts = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Server unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one message and wait for its echo.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FrameTooLarge`] if the message exceeds the
    ///   server's limit; nothing is sent
    /// - [`ProtocolError::Timeout`] if no echo arrives in time
    /// - [`ChannelError::PeerDisconnected`] if the server went away
    /// - [`ProtocolError::ConnectionClosed`] if an earlier exchange on this
    ///   client failed
    pub async fn request(&mut self, message: impl Into<Bytes>) -> ChannelResult<Bytes> {
        if self.broken {
            return Err(ProtocolError::ConnectionClosed.into());
        }

        let message = message.into();
        if message.len() > self.accepted.max_message_size {
            return Err(
                ProtocolError::frame_too_large(message.len(), self.accepted.max_message_size)
                    .into(),
            );
        }

        let framed = &mut self.framed;
        let exchange = async move {
            framed.send(message).await?;
            framed
                .next()
                .await
                .unwrap_or(Err(ProtocolError::ConnectionClosed))
                .map(BytesMut::freeze)
        };

        let error = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(e)) if e.is_disconnect() => ChannelError::PeerDisconnected,
            Ok(Err(e)) => e.into(),
            Err(_) => ProtocolError::timeout(self.request_timeout).into(),
        };

        // Whatever is still in flight no longer pairs with a request.
        self.broken = true;
        debug!(
            connection_id = self.accepted.connection_id,
            error = %error,
            "Request failed, client unusable"
        );
        Err(error)
    }

    /// Returns `false` once a request has failed; later requests are refused.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        !self.broken
    }

    /// Close the connection, signalling end-of-session to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the write half cannot be shut down.
    pub async fn close(mut self) -> ChannelResult<()> {
        match self.framed.get_mut().shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if npipe_core::error::is_disconnect_kind(e.kind()) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Server-assigned connection id.
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.accepted.connection_id
    }

    /// Server identifier from the admission frame.
    #[must_use]
    pub fn server_info(&self) -> &str {
        &self.accepted.server_info
    }

    /// Largest message the server accepts.
    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.accepted.max_message_size
    }
}

fn map_connect_error(socket_path: &Path, error: io::Error) -> ChannelError {
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
            ChannelError::server_unavailable(format!(
                "no server listening on {}: {error}",
                socket_path.display()
            ))
        },
        io::ErrorKind::PermissionDenied => ChannelError::AccessDenied {
            reason: format!("cannot open {}: {error}", socket_path.display()),
        },
        _ => ChannelError::Io(error),
    }
}
