//! Wire format for the CSD data plane.
//!
//! Every command and every response is exactly one 64-byte cache line. The
//! first 8 bytes are a [`CommandHeader`] carrying the message length (in
//! cache-line units), the command class and sequence that select a handler,
//! and the submission queue a response must be routed back to. The remaining
//! 56 bytes hold a class-specific body; chunk reads and writes carry a
//! [`MemoryDescriptor`] naming the peer's buffer so the receiver can move
//! data with a single RDMA operation.
//!
//! Small writes may carry their payload inline, directly after the 64-byte
//! command, in which case [`FLAG_INLINE_DATA`] is set and the header length
//! covers the payload too.
//!
//! All multi-byte fields are little-endian.

pub mod command;
pub mod descriptor;
pub mod error;
pub mod header;
pub mod response;

pub use command::{ChunkOp, Command, CommandBody, FillCommand, ReadCommand, WriteCommand};
pub use descriptor::MemoryDescriptor;
pub use error::{ProtoError, ProtoResult};
pub use header::{
    CLASS_CHUNK, CLASS_CLUSTER, CLASS_GROUP, CLASS_RANGE, CLASS_VOLUME, CommandHeader,
    FLAG_INLINE_DATA, ServiceKey, Subsystem,
};
pub use response::{ChunkReply, Response, ResponseBody, ReturnCode};

/// log2 of the cache-line size
pub const CACHE_LINE_SHIFT: u32 = 6;

/// Cache-line size; the unit of the header length field
pub const CACHE_LINE_SIZE: usize = 1 << CACHE_LINE_SHIFT;

/// Size of an encoded command (header + body)
pub const COMMAND_SIZE: usize = CACHE_LINE_SIZE;

/// Size of an encoded response (header + return code + body)
pub const RESPONSE_SIZE: usize = CACHE_LINE_SIZE;

/// Largest message the 16-bit length field can describe
pub const MAX_MESSAGE_SIZE: usize = (u16::MAX as usize) << CACHE_LINE_SHIFT;

/// Convert a byte length to cache-line units, rounding up.
pub fn cache_line_units(bytes: usize) -> ProtoResult<u16> {
    let units = bytes.div_ceil(CACHE_LINE_SIZE);
    u16::try_from(units).map_err(|_| ProtoError::PayloadTooLarge(bytes))
}

/// Convert cache-line units back to bytes
pub fn units_to_bytes(units: u16) -> usize {
    (units as usize) << CACHE_LINE_SHIFT
}
