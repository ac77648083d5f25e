//! # plaincli-protocol
//!
//! Framed duplex protocol that carries one CLI session over a plain
//! bidirectional byte stream.
//!
//! This crate provides:
//! - Frame codec (one kind byte, then a length-prefixed or fixed-width payload)
//! - Framed writer with per-frame mutual exclusion for concurrent senders
//! - Framed reader task that dispatches frames in arrival order and reports
//!   corruption with the offending bytes

pub mod codec;
pub mod error;
pub mod frame;
pub mod reader;
pub mod writer;

pub use codec::{format_read_back, Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{ChunkKind, Frame, FrameKind};
pub use reader::{CloseReason, Corruption, FramedReader, ReaderEvent};
pub use writer::FramedWriter;

/// Default TCP port for the plaincli server.
pub const DEFAULT_PORT: u16 = 7420;

/// Maximum payload of a single text or byte-chunk frame (u16 length prefix).
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Chunk size used when relaying local stdin.
///
/// Stays below the 64 KiB message limit common to WebSocket transports.
pub const STDIN_CHUNK_SIZE: usize = 60_000;
