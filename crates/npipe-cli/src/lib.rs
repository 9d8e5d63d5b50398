//! npipe-cli - client side of npipe channels.
//!
//! [`client::ChannelClient`] connects to a channel, waits for admission and
//! performs request/echo round trips. The `npipe` binary wraps it in a small
//! command-line tool.

pub mod client;

pub use client::{ChannelClient, ClientConfig, RetryPolicy};
