//! # respline-client
//!
//! Async client for Redis-compatible servers speaking RESP2.
//!
//! This crate provides:
//! - A reconnecting request/reply connection with AUTH, CLIENT SETNAME and SELECT handshake
//! - Typed wrappers for common string, set, list and hash commands
//! - Channel subscriptions, each on its own connection and task

pub mod client;
pub mod connection;
pub mod error;
pub mod stream;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{Client, SetCondition, SetOptions};
pub use connection::{Connection, ConnectionConfig, ConnectionStatus};
pub use error::ClientError;
pub use respline_protocol::RespValue;
pub use stream::TransportStream;
pub use subscription::SubscriptionManager;
pub use transport::{Dialer, TcpDialer, Transport};
