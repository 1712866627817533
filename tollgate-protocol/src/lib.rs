//! # tollgate-protocol
//!
//! Wire protocol implementation for tollgate.
//!
//! This crate provides:
//! - The normalized [`Request`] / [`Response`] model shared by every protocol
//! - A case-insensitive, order-preserving header multimap
//! - The [`Processor`] trait: a per-connection framing state machine
//! - HTTP/1.x text framing (fixed length, chunked, keep-alive, `100-continue`)
//! - Binary relay framing (magic + `u16` length packets, ping/pong)

pub mod error;
pub mod headers;
pub mod http1;
pub mod message;
pub mod processor;
pub mod relay;

pub use error::ProtocolError;
pub use headers::Headers;
pub use http1::{Http1Limits, Http1Processor, Http1ProcessorFactory};
pub use message::{Method, Request, Response, Status, Version};
pub use processor::{Consumed, Processor, ProcessorFactory};
pub use relay::{Packet, RelayLimits, RelayProcessor, RelayProcessorFactory};

/// Default maximum size of an HTTP/1.x request line plus header block (8 KiB).
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// Default maximum request body size (2 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Default maximum relay packet payload (8 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 8 * 1024;
