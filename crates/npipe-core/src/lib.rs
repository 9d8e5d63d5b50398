//! npipe-core - shared building blocks for secured named channels.
//!
//! A *channel* is a well-known name that clients use to reach a server
//! process on the same host. This crate holds everything both sides agree
//! on:
//!
//! - [`name`]: channel names and their Unix socket paths
//! - [`security`]: the security descriptor attached to a channel
//! - [`credentials`]: kernel-reported identity of a connected peer
//! - [`framing`]: length-prefixed frames, one frame per message
//! - [`admission`]: the first frame the server sends on every connection
//! - [`config`]: `npipe.toml` parsing and validation
//! - [`error`]: channel and protocol error types
//!
//! The server lives in `npipe-daemon`, the client in `npipe-cli`.

pub mod admission;
pub mod config;
pub mod credentials;
pub mod error;
pub mod framing;
pub mod name;
pub mod security;

pub use admission::{Accepted, Admission, Denied};
pub use config::{ConfigError, NpipeConfig};
pub use credentials::PeerCredentials;
pub use error::{
    ChannelError, ChannelResult, ProtocolError, ProtocolResult, DEFAULT_MAX_MESSAGE_SIZE,
    MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use framing::FrameCodec;
pub use name::ChannelName;
pub use security::{Access, AccessDecision, Principal, SecurityDescriptor};
