//! # respline-protocol
//!
//! RESP2 (REdis Serialization Protocol) implementation for respline.
//!
//! This crate provides:
//! - Command encoding as RESP arrays of bulk strings
//! - Recursive, incremental reply decoding
//! - The `RespValue` reply type with checked accessors
//! - Error types and protocol constants
//!
//! No I/O happens here; the client crate owns the sockets.

pub mod codec;
pub mod error;
pub mod value;

pub use codec::{decode, Decoder, Encoder};
pub use error::ProtocolError;
pub use value::RespValue;

/// Line terminator used by every RESP field.
pub const CRLF: &[u8; 2] = b"\r\n";

/// Default port for Redis-compatible servers.
pub const DEFAULT_PORT: u16 = 6379;

/// Largest bulk string accepted from the wire (512 MiB, the server-side ceiling).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted from the wire.
pub const MAX_NESTING_DEPTH: usize = 128;
