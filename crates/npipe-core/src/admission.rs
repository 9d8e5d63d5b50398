//! Admission frame exchanged at connection start.
//!
//! ```text
//! Client                                    Server
//!   |  -- connect ---------------------------> |
//!   |                                          |  peer credential check
//!   |  <-- Accepted { version, limits, id } -- |
//!   |      OR                                  |
//!   |  <-- Denied { reason } ----------------- |  (connection closed)
//!   |                                          |
//!   |  -- frame -->  <-- same frame --         |  echo phase
//! ```
//!
//! The server speaks first so a client learns whether it was admitted
//! before it sends any data. Admission frames are JSON and limited to
//! [`MAX_ADMISSION_FRAME_SIZE`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{
    ChannelError, ProtocolError, ProtocolResult, MAX_ADMISSION_FRAME_SIZE, PROTOCOL_VERSION,
};

/// Server acceptance of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Accepted {
    /// Protocol version spoken by the server.
    pub protocol_version: u32,
    /// Server identifier, e.g. `npiped/0.1.0`.
    pub server_info: String,
    /// Largest message the server will echo.
    pub max_message_size: usize,
    /// Server-assigned id of this connection, for correlating logs.
    pub connection_id: u64,
}

impl Accepted {
    /// Create an acceptance for the current protocol version.
    #[must_use]
    pub fn new(server_info: impl Into<String>, max_message_size: usize, connection_id: u64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_info: server_info.into(),
            max_message_size,
            connection_id,
        }
    }
}

/// Server refusal of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Denied {
    /// Reason for the refusal.
    pub reason: String,
}

/// First frame on every connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Admission {
    /// The connection may proceed to the echo phase.
    Accepted(Accepted),
    /// The connection is refused and will be closed.
    Denied(Denied),
}

impl Admission {
    /// Create a denial.
    #[must_use]
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied(Denied {
            reason: reason.into(),
        })
    }

    /// Serialize to a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidFrame`] if serialization fails or the
    /// result exceeds [`MAX_ADMISSION_FRAME_SIZE`].
    pub fn to_frame(&self) -> ProtocolResult<Bytes> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::invalid_frame(format!("admission encode: {e}")))?;
        if bytes.len() > MAX_ADMISSION_FRAME_SIZE {
            return Err(ProtocolError::frame_too_large(
                bytes.len(),
                MAX_ADMISSION_FRAME_SIZE,
            ));
        }
        Ok(Bytes::from(bytes))
    }

    /// Parse a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] for oversized frames and
    /// [`ProtocolError::InvalidFrame`] for anything that is not an
    /// admission message.
    pub fn from_frame(frame: &[u8]) -> ProtocolResult<Self> {
        if frame.len() > MAX_ADMISSION_FRAME_SIZE {
            return Err(ProtocolError::frame_too_large(
                frame.len(),
                MAX_ADMISSION_FRAME_SIZE,
            ));
        }
        serde_json::from_slice(frame)
            .map_err(|e| ProtocolError::invalid_frame(format!("admission decode: {e}")))
    }

    /// Turn the admission into the client-side outcome.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::AccessDenied`] for a denial
    /// - [`ChannelError::Protocol`] for a version mismatch
    pub fn into_result(self) -> Result<Accepted, ChannelError> {
        match self {
            Self::Accepted(accepted) if accepted.protocol_version == PROTOCOL_VERSION => {
                Ok(accepted)
            },
            Self::Accepted(accepted) => Err(ProtocolError::version_mismatch(
                accepted.protocol_version,
            )
            .into()),
            Self::Denied(denied) => Err(ChannelError::AccessDenied {
                reason: denied.reason,
            }),
        }
    }
}
