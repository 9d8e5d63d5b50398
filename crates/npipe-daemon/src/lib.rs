//! npipe-daemon - secured multi-client echo server for npipe channels.
//!
//! The server binds a channel, checks every connecting peer against a
//! [`SecurityDescriptor`](npipe_core::SecurityDescriptor), and serves each
//! admitted client on its own task, echoing every frame back unchanged.
//!
//! # Modules
//!
//! - [`listener`]: channel binding and the accept/dispatch loop
//! - [`session`]: the per-connection handle owned by a worker
//! - [`worker`]: the echo loop
//! - [`server`]: start and graceful shutdown
//! - [`stats`]: Prometheus metrics shared across sessions
//!
//! # Runtime Requirements
//!
//! Listener and workers are Tokio tasks. A multi-threaded runtime lets
//! sessions run in parallel; the `npiped` binary builds one explicitly.

pub mod listener;
pub mod server;
pub mod session;
pub mod stats;
pub mod worker;

pub use listener::{ChannelListener, ListenerConfig, ListenerState};
pub use server::{EchoServer, ShutdownReport};
pub use stats::{ServerStats, StatsError, StatsSnapshot};
pub use worker::SessionEnd;
