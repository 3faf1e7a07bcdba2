//! Protocol module - Defines the wire protocol for NodeLink communication
//!
//! Every frame starts with a fixed header, all integers big-endian:
//! - 4 bytes crc code (opaque tag)
//! - 4 bytes length of everything that follows this field
//! - 8 bytes session id
//! - 1 byte message type
//! - 1 byte priority
//! - 4 bytes attachment count, then the attachments
//! - marshalled body, or a 4 byte zero marker when there is none

mod message;
mod codec;
mod value;

pub use message::*;
pub use codec::*;
pub use value::*;

/// Default port for NodeLink communication
pub const DEFAULT_PORT: u16 = 8080;

/// Default crc code stamped on outgoing headers
pub const DEFAULT_CRC_CODE: i32 = 0xABEF_0101_u32 as i32;

/// Largest frame (header included) the splitter accepts
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Byte offset of the length field inside a frame
pub const LENGTH_FIELD_OFFSET: usize = 4;

/// Width of the length field in bytes
pub const LENGTH_FIELD_LENGTH: usize = 4;

/// Bytes that precede the counted part of a frame (crc code + length)
pub const LENGTH_PREFIX_SIZE: usize = LENGTH_FIELD_OFFSET + LENGTH_FIELD_LENGTH;
