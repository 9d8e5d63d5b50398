//! Per-connection state owned by a worker.
//!
//! # Ownership
//!
//! ```text
//! listener: accept ─► ChannelHandle ─► ClientSession ─► worker task
//!                                        │  permit  (session slot)
//!                                        │  guard   (active gauge)
//!                                        └─ dropped on every exit path
//! ```
//!
//! A [`ChannelHandle`] is not `Clone`. The listener gives it up when it
//! dispatches the session, and dropping the session closes the socket,
//! releases the slot and decrements the active gauge.

use futures::{SinkExt, StreamExt};
use npipe_core::{FrameCodec, PeerCredentials, ProtocolError};
use tokio::net::UnixStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::codec::Framed;

use crate::stats::ActiveSession;

/// One accepted connection on the channel.
#[derive(Debug)]
pub struct ChannelHandle {
    connection_id: u64,
    peer: PeerCredentials,
    framed: Framed<UnixStream, FrameCodec>,
}

impl ChannelHandle {
    /// Wrap an accepted stream.
    #[must_use]
    pub fn new(
        connection_id: u64,
        peer: PeerCredentials,
        stream: UnixStream,
        codec: FrameCodec,
    ) -> Self {
        Self {
            connection_id,
            peer,
            framed: Framed::new(stream, codec),
        }
    }

    /// Server-assigned connection id.
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Credentials of the connected peer.
    #[must_use]
    pub const fn peer(&self) -> &PeerCredentials {
        &self.peer
    }

    /// Change the frame size limit.
    pub fn set_max_frame_size(&mut self, max: usize) {
        self.framed.codec_mut().set_max_frame_size(max);
    }

    /// Read the next frame. `None` once the peer has closed its end.
    pub async fn recv(&mut self) -> Option<Result<bytes::BytesMut, ProtocolError>> {
        self.framed.next().await
    }

    /// Write one frame and flush it.
    ///
    /// # Errors
    ///
    /// Returns the framing or I/O error from the write.
    pub async fn send(&mut self, frame: bytes::Bytes) -> Result<(), ProtocolError> {
        self.framed.send(frame).await
    }
}

/// Everything a worker owns while serving one client.
#[derive(Debug)]
pub struct ClientSession {
    handle: ChannelHandle,
    messages: u64,
    bytes: u64,
    _slot: OwnedSemaphorePermit,
    _active: ActiveSession,
}

impl ClientSession {
    /// Bind a handle to the session slot and the active-session guard.
    #[must_use]
    pub fn new(handle: ChannelHandle, slot: OwnedSemaphorePermit, active: ActiveSession) -> Self {
        Self {
            handle,
            messages: 0,
            bytes: 0,
            _slot: slot,
            _active: active,
        }
    }

    /// Connection id of the underlying handle.
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.handle.connection_id()
    }

    /// Credentials of the connected peer.
    #[must_use]
    pub const fn peer(&self) -> &PeerCredentials {
        self.handle.peer()
    }

    /// Messages echoed so far.
    #[must_use]
    pub const fn messages(&self) -> u64 {
        self.messages
    }

    /// Payload bytes echoed so far.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn handle_mut(&mut self) -> &mut ChannelHandle {
        &mut self.handle
    }

    pub(crate) fn record(&mut self, len: usize) {
        self.messages += 1;
        self.bytes += u64::try_from(len).unwrap_or(u64::MAX);
    }
}
