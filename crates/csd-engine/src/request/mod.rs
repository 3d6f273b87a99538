//! Work requests: the unit of in-flight protocol state.
//!
//! A work request owns one registered header buffer, sized for a command
//! plus the largest inline payload, and optionally a second registered buffer
//! for bulk data. The scatter/gather entry names which local bytes the next
//! transport operation moves; `remote` names the peer memory for RDMA
//! read/write.

mod pool;
mod state;

use std::fmt;
use std::time::Instant;

use bytes::BufMut;
use csd_proto::{Command, MemoryDescriptor, RESPONSE_SIZE, Response};
use tracing::{trace, warn};

pub use pool::{PoolStats, WorkRequestPool};
pub use state::{Flow, RequestStatus, drive};

use crate::error::{EngineError, EngineResult};
use crate::memory::RegisteredBuffer;

/// Which messenger drives a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues commands and consumes responses
    Client,
    /// Serves commands and produces responses
    Server,
}

/// Local buffer a scatter/gather entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// The header buffer
    Header,
    /// The data buffer
    Data,
}

/// Local side of the next transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterGather {
    /// Buffer holding the bytes
    pub segment: Segment,
    /// Offset into the buffer
    pub offset: usize,
    /// Number of bytes
    pub length: usize,
}

impl ScatterGather {
    /// Entry covering `length` bytes at the start of `segment`
    pub fn new(segment: Segment, length: usize) -> Self {
        Self {
            segment,
            offset: 0,
            length,
        }
    }
}

/// In-flight protocol state for one command or response
pub struct WorkRequest {
    id: u64,
    status: RequestStatus,
    role: Role,
    header: RegisteredBuffer,
    data: Option<RegisteredBuffer>,
    /// Local bytes moved by the next post
    pub sge: ScatterGather,
    /// Peer memory for RDMA read/write
    pub remote: Option<MemoryDescriptor>,
    received: usize,
    command: Option<Command>,
    tag: u64,
    started: Option<Instant>,
}

impl WorkRequest {
    pub(crate) fn new(id: u64, header: RegisteredBuffer) -> Self {
        let sge = ScatterGather::new(Segment::Header, header.len());
        Self {
            id,
            status: RequestStatus::Free,
            role: Role::Server,
            header,
            data: None,
            sge,
            remote: None,
            received: 0,
            command: None,
            tag: 0,
            started: None,
        }
    }

    /// Request id (stable across reuse)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle status
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Move to `next`, logging the transition
    pub fn set_status(&mut self, next: RequestStatus) {
        if !self.status.can_transition_to(next) {
            warn!(
                "Request {} unexpected transition {:?} -> {:?}",
                self.id, self.status, next
            );
        }
        trace!("Request {} status: {:?} -> {:?}", self.id, self.status, next);
        self.status = next;
    }

    /// Driving role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Opaque value owned by the driving messenger
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Set the messenger-owned tag
    pub fn set_tag(&mut self, tag: u64) {
        self.tag = tag;
    }

    /// When the current command arrived
    pub fn started(&self) -> Option<Instant> {
        self.started
    }

    /// Header buffer contents
    pub fn header(&self) -> &[u8] {
        self.header.as_slice()
    }

    /// Capacity of the header buffer
    pub fn header_capacity(&self) -> usize {
        self.header.len()
    }

    /// Data buffer, if attached
    pub fn data(&self) -> Option<&RegisteredBuffer> {
        self.data.as_ref()
    }

    /// Mutable data buffer, if attached
    pub fn data_mut(&mut self) -> Option<&mut RegisteredBuffer> {
        self.data.as_mut()
    }

    /// Attach a data buffer, releasing any previous one
    pub fn attach_data(&mut self, buffer: RegisteredBuffer) {
        self.data = Some(buffer);
    }

    /// Detach the data buffer
    pub fn take_data(&mut self) -> Option<RegisteredBuffer> {
        self.data.take()
    }

    /// Decoded command carried by this request
    pub fn command(&self) -> Option<&Command> {
        self.command.as_ref()
    }

    /// Bytes delivered by the last receive
    pub fn received_len(&self) -> usize {
        self.received
    }

    /// Bytes named by the scatter/gather entry
    pub fn local(&self) -> EngineResult<&[u8]> {
        let ScatterGather {
            segment,
            offset,
            length,
        } = self.sge;
        let buf = match segment {
            Segment::Header => self.header.as_slice(),
            Segment::Data => self.data_buffer()?.as_slice(),
        };
        buf.get(offset..offset + length)
            .ok_or(EngineError::InvalidSize(offset + length))
    }

    /// Mutable bytes named by the scatter/gather entry
    pub fn local_mut(&mut self) -> EngineResult<&mut [u8]> {
        let ScatterGather {
            segment,
            offset,
            length,
        } = self.sge;
        let buf = match segment {
            Segment::Header => self.header.as_mut_slice(),
            Segment::Data => self
                .data
                .as_mut()
                .ok_or(EngineError::InvalidSize(0))?
                .as_mut_slice(),
        };
        buf.get_mut(offset..offset + length)
            .ok_or(EngineError::InvalidSize(offset + length))
    }

    fn data_buffer(&self) -> EngineResult<&RegisteredBuffer> {
        self.data.as_ref().ok_or(EngineError::InvalidSize(0))
    }

    /// Prepare to receive a message into the header buffer
    pub fn prepare_receive(&mut self, role: Role) {
        self.role = role;
        self.received = 0;
        self.command = None;
        self.remote = None;
        self.sge = ScatterGather::new(Segment::Header, self.header.len());
    }

    /// Copy a delivered message into the header buffer. Returns `false` if
    /// it does not fit.
    pub(crate) fn receive_into(&mut self, message: &[u8]) -> bool {
        let area = self.header.as_mut_slice();
        if message.len() > area.len() {
            return false;
        }
        area[..message.len()].copy_from_slice(message);
        self.received = message.len();
        true
    }

    /// Decode the received command and remember it; stamps the arrival time
    pub fn decode_command(&mut self) -> EngineResult<&Command> {
        self.started = Some(Instant::now());
        let command = Command::from_bytes(&self.header.as_slice()[..self.received])?;
        Ok(self.command.insert(command))
    }

    /// Inline payload of the decoded command, if it was fully received
    pub fn inline_payload(&self) -> Option<&[u8]> {
        let command = self.command.as_ref()?;
        if command.inline_data_len() == 0 {
            return None;
        }
        command
            .inline_payload(&self.header.as_slice()[..self.received])
            .ok()
    }

    /// Encode `command` followed by `inline` into the header buffer and
    /// point the scatter/gather entry at the whole message.
    pub fn write_command(&mut self, command: &Command, inline: &[u8]) -> EngineResult<()> {
        if inline.len() != command.inline_data_len() {
            return Err(EngineError::InvalidSize(inline.len()));
        }
        let total = command.header.byte_length().max(command.message_len());
        if total > self.header.len() {
            return Err(EngineError::TooLarge {
                size: total,
                max: self.header.len(),
            });
        }

        let area = &mut self.header.as_mut_slice()[..total];
        {
            let mut out = &mut *area;
            command.encode(&mut out);
            out.put_slice(inline);
            out.fill(0);
        }

        self.role = Role::Client;
        self.command = Some(command.clone());
        self.remote = None;
        self.sge = ScatterGather::new(Segment::Header, total);
        Ok(())
    }

    /// Encode `response` into the header buffer and point the scatter/gather
    /// entry at it. The command it answers is no longer readable from the
    /// buffer afterwards, only through [`command`](Self::command).
    pub fn write_response(&mut self, response: &Response) {
        let mut out = &mut self.header.as_mut_slice()[..RESPONSE_SIZE];
        response.encode(&mut out);
        self.remote = None;
        self.sge = ScatterGather::new(Segment::Header, RESPONSE_SIZE);
    }

    /// Decode a response from the received bytes
    pub fn read_response(&self) -> EngineResult<Response> {
        Ok(Response::from_bytes(&self.header.as_slice()[..self.received])?)
    }

    /// Clear per-use state before returning to the pool. Releases the data
    /// buffer.
    pub(crate) fn reset(&mut self) {
        self.status = RequestStatus::Free;
        self.data = None;
        self.received = 0;
        self.command = None;
        self.remote = None;
        self.tag = 0;
        self.started = None;
        self.sge = ScatterGather::new(Segment::Header, self.header.len());
    }
}

impl fmt::Debug for WorkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRequest")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("role", &self.role)
            .field("sge", &self.sge)
            .field("remote", &self.remote)
            .field("data", &self.data.as_ref().map(|d| d.len()))
            .field("received", &self.received)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::{MemoryRegistry, RegisteredMemoryAllocator};
    use csd_proto::{COMMAND_SIZE, ChunkReply, FillCommand, ReadCommand, ReturnCode, WriteCommand};
    use std::sync::Arc;

    fn allocator() -> RegisteredMemoryAllocator {
        RegisteredMemoryAllocator::new(
            MemoryConfig {
                slab_size: 1 << 20,
                min_block: 64,
                max_block: 1 << 16,
                max_slabs: 1,
                expand_retries: 1,
            },
            Arc::new(MemoryRegistry::new()),
        )
        .unwrap()
    }

    fn request(alloc: &RegisteredMemoryAllocator) -> WorkRequest {
        WorkRequest::new(1, alloc.allocate(COMMAND_SIZE + 4096).unwrap())
    }

    #[test]
    fn test_command_written_then_decoded() {
        let alloc = allocator();
        let mut client = request(&alloc);
        let cmd = Command::write(WriteCommand {
            chunk_id: 3,
            offset: 64,
            length: 8,
            inline_data_len: 8,
            desc: MemoryDescriptor::default(),
        })
        .unwrap();
        client.write_command(&cmd, b"1234567\0").unwrap();
        assert_eq!(client.sge.length, 128);

        let mut server = request(&alloc);
        server.prepare_receive(Role::Server);
        assert!(server.receive_into(client.local().unwrap()));
        let decoded = server.decode_command().unwrap().clone();
        assert_eq!(decoded, cmd);
        assert_eq!(server.inline_payload(), Some(&b"1234567\0"[..]));
        assert!(server.started().is_some());
    }

    #[test]
    fn test_inline_length_mismatch_rejected() {
        let alloc = allocator();
        let mut req = request(&alloc);
        let cmd = Command::set(FillCommand {
            chunk_id: 0,
            offset: 0,
            length: 64,
        });
        assert!(matches!(
            req.write_command(&cmd, b"extra"),
            Err(EngineError::InvalidSize(5))
        ));
    }

    #[test]
    fn test_oversized_inline_rejected() {
        let alloc = allocator();
        let mut req = request(&alloc);
        let payload = vec![0u8; 8192];
        let cmd = Command::write(WriteCommand {
            chunk_id: 0,
            offset: 0,
            length: 8192,
            inline_data_len: 8192,
            desc: MemoryDescriptor::default(),
        })
        .unwrap();
        assert!(matches!(
            req.write_command(&cmd, &payload),
            Err(EngineError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_response_replaces_header() {
        let alloc = allocator();
        let mut req = request(&alloc);
        let cmd = Command::read(ReadCommand {
            chunk_id: 5,
            offset: 0,
            length: 512,
            desc: MemoryDescriptor::new(0x1000, 512, 7),
        })
        .with_queue(1, 2);
        req.write_command(&cmd, &[]).unwrap();

        let resp = Response::chunk(
            &cmd.header,
            ReturnCode::Success,
            ChunkReply {
                chunk_id: 5,
                offset: 0,
                length: 512,
                inline_data_len: 0,
            },
        );
        req.write_response(&resp);
        assert_eq!(req.sge.length, RESPONSE_SIZE);
        assert_eq!(Response::from_bytes(req.local().unwrap()).unwrap(), resp);
    }

    #[test]
    fn test_data_segment_and_reset() {
        let alloc = allocator();
        let mut req = request(&alloc);
        req.sge = ScatterGather::new(Segment::Data, 16);
        assert!(req.local().is_err());

        req.attach_data(alloc.allocate(1024).unwrap());
        req.local_mut().unwrap().copy_from_slice(&[9u8; 16]);
        assert_eq!(req.data().unwrap().as_slice()[..16], [9u8; 16]);

        let used = alloc.get_mem_used();
        req.reset();
        assert!(req.data().is_none());
        assert_eq!(req.status(), RequestStatus::Free);
        assert_eq!(alloc.get_mem_used(), used - 1024);
    }

    #[test]
    fn test_receive_too_long_rejected() {
        let alloc = allocator();
        let mut req = request(&alloc);
        let message = vec![0u8; req.header_capacity() + 1];
        assert!(!req.receive_into(&message));
        assert_eq!(req.received_len(), 0);
    }
}
