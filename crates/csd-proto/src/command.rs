//! Commands: header plus a 56-byte class-specific body

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::descriptor::MemoryDescriptor;
use crate::error::{ProtoError, ProtoResult};
use crate::header::{CLASS_CHUNK, CommandHeader, FLAG_INLINE_DATA};
use crate::{COMMAND_SIZE, cache_line_units};

/// Size of the body area following the header
pub const BODY_SIZE: usize = COMMAND_SIZE - CommandHeader::SIZE;

/// Chunk I/O operations (sequence values within [`CLASS_CHUNK`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkOp {
    /// Read chunk bytes into the peer's buffer
    Read = 0x00,
    /// Write bytes (inline or from the peer's buffer) into a chunk
    Write = 0x01,
    /// Fill a range with ones
    Set = 0x02,
    /// Fill a range with zeros
    Reset = 0x03,
}

impl ChunkOp {
    /// All chunk operations
    pub const ALL: [ChunkOp; 4] = [Self::Read, Self::Write, Self::Set, Self::Reset];

    /// Create from raw sequence value
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Read),
            0x01 => Some(Self::Write),
            0x02 => Some(Self::Set),
            0x03 => Some(Self::Reset),
            _ => None,
        }
    }

    /// Byte used to fill a range for SET/RESET
    pub fn fill_byte(&self) -> Option<u8> {
        match self {
            Self::Set => Some(0xFF),
            Self::Reset => Some(0x00),
            _ => None,
        }
    }
}

/// Chunk read body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCommand {
    /// Chunk to read
    pub chunk_id: u64,
    /// Byte offset inside the chunk
    pub offset: u64,
    /// Bytes to read
    pub length: u32,
    /// Peer buffer receiving the data
    pub desc: MemoryDescriptor,
}

/// Chunk write body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCommand {
    /// Chunk to write
    pub chunk_id: u64,
    /// Byte offset inside the chunk
    pub offset: u64,
    /// Bytes to write
    pub length: u32,
    /// Bytes carried inline after the command; 0 means fetch via `desc`
    pub inline_data_len: u32,
    /// Peer buffer holding the data when not inline
    pub desc: MemoryDescriptor,
}

/// SET/RESET body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillCommand {
    /// Chunk to fill
    pub chunk_id: u64,
    /// Byte offset inside the chunk
    pub offset: u64,
    /// Bytes to fill
    pub length: u32,
}

/// Class-specific command body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    /// Chunk read
    Read(ReadCommand),
    /// Chunk write
    Write(WriteCommand),
    /// Fill with ones
    Set(FillCommand),
    /// Fill with zeros
    Reset(FillCommand),
    /// Any other class; the bytes are left to the owning subsystem
    Opaque([u8; BODY_SIZE]),
}

/// A 64-byte command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Routing header
    pub header: CommandHeader,
    /// Decoded body
    pub body: CommandBody,
}

impl Command {
    /// Chunk read command
    pub fn read(read: ReadCommand) -> Self {
        Self {
            header: CommandHeader::new(CLASS_CHUNK, ChunkOp::Read as u8),
            body: CommandBody::Read(read),
        }
    }

    /// Chunk write command. The header length covers any inline payload.
    pub fn write(write: WriteCommand) -> ProtoResult<Self> {
        let mut header = CommandHeader::new(CLASS_CHUNK, ChunkOp::Write as u8);
        if write.inline_data_len > 0 {
            header.flags |= FLAG_INLINE_DATA;
            header.length = cache_line_units(COMMAND_SIZE + write.inline_data_len as usize)?;
        }
        Ok(Self {
            header,
            body: CommandBody::Write(write),
        })
    }

    /// SET command
    pub fn set(fill: FillCommand) -> Self {
        Self {
            header: CommandHeader::new(CLASS_CHUNK, ChunkOp::Set as u8),
            body: CommandBody::Set(fill),
        }
    }

    /// RESET command
    pub fn reset(fill: FillCommand) -> Self {
        Self {
            header: CommandHeader::new(CLASS_CHUNK, ChunkOp::Reset as u8),
            body: CommandBody::Reset(fill),
        }
    }

    /// Command for a non-chunk class
    pub fn opaque(class: u8, sequence: u8, content: [u8; BODY_SIZE]) -> Self {
        Self {
            header: CommandHeader::new(class, sequence),
            body: CommandBody::Opaque(content),
        }
    }

    /// Set the submission queue the response is routed to
    pub fn with_queue(mut self, queue_group: u8, queue_number: u16) -> Self {
        self.header.queue_group = queue_group;
        self.header.queue_number = queue_number;
        self
    }

    /// Chunk operation, if this is a chunk command
    pub fn chunk_op(&self) -> Option<ChunkOp> {
        match self.body {
            CommandBody::Read(_) => Some(ChunkOp::Read),
            CommandBody::Write(_) => Some(ChunkOp::Write),
            CommandBody::Set(_) => Some(ChunkOp::Set),
            CommandBody::Reset(_) => Some(ChunkOp::Reset),
            CommandBody::Opaque(_) => None,
        }
    }

    /// Bytes of inline payload following the command
    pub fn inline_data_len(&self) -> usize {
        match &self.body {
            CommandBody::Write(w) if self.header.has_inline_data() => w.inline_data_len as usize,
            _ => 0,
        }
    }

    /// Total on-wire size: the fixed command plus inline payload
    pub fn message_len(&self) -> usize {
        COMMAND_SIZE + self.inline_data_len()
    }

    /// Parse the fixed 64-byte command from the front of `buf`
    pub fn from_bytes(buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < COMMAND_SIZE {
            return Err(ProtoError::ShortBuffer {
                needed: COMMAND_SIZE,
                available: buf.len(),
            });
        }

        let header = CommandHeader::from_bytes(buf)?;
        if header.length == 0 {
            return Err(ProtoError::InvalidLength(header.length));
        }

        let mut body = &buf[CommandHeader::SIZE..COMMAND_SIZE];
        let body = if header.class == CLASS_CHUNK {
            let op = ChunkOp::from_raw(header.sequence)
                .ok_or(ProtoError::UnknownChunkOp(header.sequence))?;
            let chunk_id = body.get_u64_le();
            let offset = body.get_u64_le();
            let length = body.get_u32_le();
            let aux = body.get_u32_le();
            match op {
                ChunkOp::Read => CommandBody::Read(ReadCommand {
                    chunk_id,
                    offset,
                    length,
                    desc: MemoryDescriptor::from_bytes(body)?,
                }),
                ChunkOp::Write => {
                    let write = WriteCommand {
                        chunk_id,
                        offset,
                        length,
                        inline_data_len: aux,
                        desc: MemoryDescriptor::from_bytes(body)?,
                    };
                    if header.has_inline_data()
                        && header.byte_length() < COMMAND_SIZE + aux as usize
                    {
                        return Err(ProtoError::InvalidLength(header.length));
                    }
                    CommandBody::Write(write)
                }
                ChunkOp::Set => CommandBody::Set(FillCommand {
                    chunk_id,
                    offset,
                    length,
                }),
                ChunkOp::Reset => CommandBody::Reset(FillCommand {
                    chunk_id,
                    offset,
                    length,
                }),
            }
        } else {
            let mut content = [0u8; BODY_SIZE];
            body.copy_to_slice(&mut content);
            CommandBody::Opaque(content)
        };

        Ok(Self { header, body })
    }

    /// Inline payload carried in `message` after the fixed command
    pub fn inline_payload<'a>(&self, message: &'a [u8]) -> ProtoResult<&'a [u8]> {
        let end = self.message_len();
        if message.len() < end {
            return Err(ProtoError::ShortBuffer {
                needed: end,
                available: message.len(),
            });
        }
        Ok(&message[COMMAND_SIZE..end])
    }

    /// Append the fixed 64-byte command to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        match &self.body {
            CommandBody::Read(r) => {
                buf.put_u64_le(r.chunk_id);
                buf.put_u64_le(r.offset);
                buf.put_u32_le(r.length);
                buf.put_u32_le(0);
                r.desc.encode(buf);
                buf.put_bytes(0, BODY_SIZE - 40);
            }
            CommandBody::Write(w) => {
                buf.put_u64_le(w.chunk_id);
                buf.put_u64_le(w.offset);
                buf.put_u32_le(w.length);
                buf.put_u32_le(w.inline_data_len);
                w.desc.encode(buf);
                buf.put_bytes(0, BODY_SIZE - 40);
            }
            CommandBody::Set(f) | CommandBody::Reset(f) => {
                buf.put_u64_le(f.chunk_id);
                buf.put_u64_le(f.offset);
                buf.put_u32_le(f.length);
                buf.put_u32_le(0);
                buf.put_bytes(0, BODY_SIZE - 24);
            }
            CommandBody::Opaque(content) => buf.put_slice(content),
        }
    }

    /// Serialize the fixed command
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> MemoryDescriptor {
        MemoryDescriptor::new(0xDEAD_0000, 4 << 20, 0x2001)
    }

    #[test]
    fn test_read_layout() {
        let cmd = Command::read(ReadCommand {
            chunk_id: 9,
            offset: 4096,
            length: 8192,
            desc: desc(),
        })
        .with_queue(2, 17);

        let bytes = cmd.to_bytes();
        assert_eq!(bytes.len(), COMMAND_SIZE);
        assert_eq!(&bytes[0..2], &1u16.to_le_bytes());
        assert_eq!(bytes[2], CLASS_CHUNK);
        assert_eq!(bytes[3], ChunkOp::Read as u8);
        assert_eq!(&bytes[8..16], &9u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &4096u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &8192u32.to_le_bytes());
        assert_eq!(&bytes[32..40], &0xDEAD_0000u64.to_le_bytes());

        let parsed = Command::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, cmd);
        assert_eq!(parsed.header.queue_number, 17);
        assert_eq!(parsed.message_len(), COMMAND_SIZE);
    }

    #[test]
    fn test_inline_write_length_and_payload() {
        let cmd = Command::write(WriteCommand {
            chunk_id: 1,
            offset: 0,
            length: 8,
            inline_data_len: 8,
            desc: MemoryDescriptor::default(),
        })
        .unwrap();

        assert!(cmd.header.has_inline_data());
        assert_eq!(cmd.header.length, 2);
        assert_eq!(cmd.message_len(), 72);

        let mut message = BytesMut::new();
        cmd.encode(&mut message);
        message.put_slice(b"1234567\0");
        message.resize(cmd.header.byte_length(), 0);

        let parsed = Command::from_bytes(&message).unwrap();
        assert_eq!(parsed.inline_payload(&message).unwrap(), b"1234567\0");
    }

    #[test]
    fn test_write_without_inline_is_one_line() {
        let cmd = Command::write(WriteCommand {
            chunk_id: 1,
            offset: 0,
            length: 1 << 20,
            inline_data_len: 0,
            desc: desc(),
        })
        .unwrap();
        assert!(!cmd.header.has_inline_data());
        assert_eq!(cmd.header.length, 1);
        assert_eq!(cmd.inline_data_len(), 0);
    }

    #[test]
    fn test_inline_length_exceeding_header_is_rejected() {
        let cmd = Command::write(WriteCommand {
            chunk_id: 1,
            offset: 0,
            length: 256,
            inline_data_len: 256,
            desc: MemoryDescriptor::default(),
        })
        .unwrap();
        let mut bytes = BytesMut::from(cmd.to_bytes().as_ref());
        // Claim a single cache line while advertising 256 inline bytes.
        bytes[0] = 1;
        assert_eq!(
            Command::from_bytes(&bytes),
            Err(ProtoError::InvalidLength(1))
        );
    }

    #[test]
    fn test_unknown_chunk_op() {
        let mut bytes = BytesMut::from(
            Command::set(FillCommand {
                chunk_id: 0,
                offset: 0,
                length: 64,
            })
            .to_bytes()
            .as_ref(),
        );
        bytes[3] = 0x09;
        assert_eq!(
            Command::from_bytes(&bytes),
            Err(ProtoError::UnknownChunkOp(0x09))
        );
    }

    #[test]
    fn test_opaque_class_preserves_content() {
        let mut content = [0u8; BODY_SIZE];
        content[0] = 0xAA;
        content[BODY_SIZE - 1] = 0x55;
        let cmd = Command::opaque(0x11, 4, content);
        let parsed = Command::from_bytes(&cmd.to_bytes()).unwrap();
        assert_eq!(parsed.body, CommandBody::Opaque(content));
        assert_eq!(parsed.chunk_op(), None);
    }

    #[test]
    fn test_fill_bytes() {
        assert_eq!(ChunkOp::Set.fill_byte(), Some(0xFF));
        assert_eq!(ChunkOp::Reset.fill_byte(), Some(0x00));
        assert_eq!(ChunkOp::Read.fill_byte(), None);
    }
}
