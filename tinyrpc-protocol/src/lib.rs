//! # tinyrpc-protocol
//!
//! Wire protocol implementation for tinyrpc.
//!
//! This crate provides:
//! - The connection option sent once, unframed, at connection start
//! - Request/response headers
//! - Pluggable framings (binary length-prefixed with CRC32C, and JSON lines)
//! - Codec readers/writers over async byte streams
//! - A codec registry mapping type tags to framings

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

pub use codec::{Codec, CodecReader, CodecRegistry, CodecWriter};
pub use error::ProtocolError;
pub use frame::{BinaryFraming, Framing, LineFraming, FRAME_HEADER_SIZE, FRAME_MAGIC};
pub use header::{CodecType, ConnectionOption, Header};

/// Magic number identifying a tinyrpc connection. Acts as the protocol version gate.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Maximum framed message payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of the connection option line.
pub const MAX_OPTION_SIZE: usize = 4 * 1024;
