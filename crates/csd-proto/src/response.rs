//! Responses: routing header, return code and a 54-byte body

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{ProtoError, ProtoResult};
use crate::header::{CLASS_CHUNK, CommandHeader};
use crate::RESPONSE_SIZE;

/// Size of the body area following header and return code
pub const RESPONSE_BODY_SIZE: usize = RESPONSE_SIZE - CommandHeader::SIZE - 2;

/// Status carried back to the command issuer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ReturnCode {
    /// Success
    Success = 0x0000,
    /// Malformed or out-of-range argument
    InvalidArgument = 0x0001,
    /// Registered memory exhausted
    NoMemory = 0x0002,
    /// Request exceeds the largest buffer size class
    TooLarge = 0x0003,
    /// Storage backend failure
    StorageError = 0x0004,
    /// Chunk does not resolve to a device
    NotFound = 0x0005,
    /// No handler for the command class/sequence
    Unsupported = 0x0006,
    /// RDMA transfer or send failed
    TransportError = 0x0007,
    /// Unexpected internal state
    Internal = 0x00FF,
}

impl ReturnCode {
    /// Create from raw value
    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Success),
            0x0001 => Some(Self::InvalidArgument),
            0x0002 => Some(Self::NoMemory),
            0x0003 => Some(Self::TooLarge),
            0x0004 => Some(Self::StorageError),
            0x0005 => Some(Self::NotFound),
            0x0006 => Some(Self::Unsupported),
            0x0007 => Some(Self::TransportError),
            0x00FF => Some(Self::Internal),
            _ => None,
        }
    }

    /// Raw wire value
    pub fn to_raw(self) -> u16 {
        self as u16
    }

    /// Check if successful
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Body of a chunk I/O response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkReply {
    /// Chunk the command addressed
    pub chunk_id: u64,
    /// Offset the command addressed
    pub offset: u64,
    /// Bytes transferred
    pub length: u32,
    /// Bytes returned inline after the response
    pub inline_data_len: u32,
}

/// Class-specific response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Chunk I/O reply
    Chunk(ChunkReply),
    /// Any other class
    Opaque([u8; RESPONSE_BODY_SIZE]),
}

/// A 64-byte response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Header copied from the originating command
    pub header: CommandHeader,
    /// Outcome
    pub return_code: ReturnCode,
    /// Decoded body
    pub body: ResponseBody,
}

impl Response {
    /// Response routed back to the issuer of `command`, with an empty body
    pub fn reply_to(command: &CommandHeader, return_code: ReturnCode) -> Self {
        let mut header = CommandHeader::new(command.class, command.sequence);
        header.queue_group = command.queue_group;
        header.queue_number = command.queue_number;

        let body = if command.class == CLASS_CHUNK {
            ResponseBody::Chunk(ChunkReply::default())
        } else {
            ResponseBody::Opaque([0u8; RESPONSE_BODY_SIZE])
        };

        Self {
            header,
            return_code,
            body,
        }
    }

    /// Chunk response routed back to the issuer of `command`
    pub fn chunk(command: &CommandHeader, return_code: ReturnCode, reply: ChunkReply) -> Self {
        Self {
            body: ResponseBody::Chunk(reply),
            ..Self::reply_to(command, return_code)
        }
    }

    /// Chunk reply body, if present
    pub fn chunk_reply(&self) -> Option<&ChunkReply> {
        match &self.body {
            ResponseBody::Chunk(reply) => Some(reply),
            ResponseBody::Opaque(_) => None,
        }
    }

    /// Parse from bytes
    pub fn from_bytes(buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < RESPONSE_SIZE {
            return Err(ProtoError::ShortBuffer {
                needed: RESPONSE_SIZE,
                available: buf.len(),
            });
        }

        let header = CommandHeader::from_bytes(buf)?;
        let mut rest = &buf[CommandHeader::SIZE..RESPONSE_SIZE];
        let raw = rest.get_u16_le();
        let return_code = ReturnCode::from_raw(raw).ok_or(ProtoError::UnknownReturnCode(raw))?;

        let body = if header.class == CLASS_CHUNK {
            ResponseBody::Chunk(ChunkReply {
                chunk_id: rest.get_u64_le(),
                offset: rest.get_u64_le(),
                length: rest.get_u32_le(),
                inline_data_len: rest.get_u32_le(),
            })
        } else {
            let mut content = [0u8; RESPONSE_BODY_SIZE];
            rest.copy_to_slice(&mut content);
            ResponseBody::Opaque(content)
        };

        Ok(Self {
            header,
            return_code,
            body,
        })
    }

    /// Append the encoded response to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        buf.put_u16_le(self.return_code.to_raw());
        match &self.body {
            ResponseBody::Chunk(reply) => {
                buf.put_u64_le(reply.chunk_id);
                buf.put_u64_le(reply.offset);
                buf.put_u32_le(reply.length);
                buf.put_u32_le(reply.inline_data_len);
                buf.put_bytes(0, RESPONSE_BODY_SIZE - 24);
            }
            ResponseBody::Opaque(content) => buf.put_slice(content),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }
}
