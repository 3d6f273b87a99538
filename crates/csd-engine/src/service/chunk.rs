//! Chunk I/O services: READ, WRITE, SET and RESET.
//!
//! READ runs `RecvDone -> ExecDone -> WriteDone`: load the range from
//! storage into a registered buffer, push it into the peer's buffer with an
//! RDMA write, then answer. WRITE either takes its payload inline from the
//! command (`RecvDone` only) or pulls it with an RDMA read
//! (`RecvDone -> ReadDone`). SET and RESET fill the range and answer
//! straight away.

use std::sync::Arc;

use csd_proto::{
    CLASS_CHUNK, ChunkOp, ChunkReply, Command, CommandBody, CommandHeader, MemoryDescriptor,
    Response, ReturnCode,
};
use tracing::{debug, warn};

use super::{CommandService, CommandServiceTable, posted, reply};
use crate::error::EngineError;
use crate::messenger::EngineContext;
use crate::request::{Flow, RequestStatus, ScatterGather, Segment, WorkRequest};
use crate::storage::{ChunkIoEvent, ChunkStore};
use crate::transport::ConnectionSession;

/// Register READ, WRITE, SET and RESET under [`CLASS_CHUNK`]
pub fn register_chunk_services(table: &CommandServiceTable) {
    table.register_service(CLASS_CHUNK, ChunkOp::Read as u8, Arc::new(ReadService));
    table.register_service(CLASS_CHUNK, ChunkOp::Write as u8, Arc::new(WriteService));
    let fill = Arc::new(FillService);
    table.register_service(CLASS_CHUNK, ChunkOp::Set as u8, fill.clone());
    table.register_service(CLASS_CHUNK, ChunkOp::Reset as u8, fill);
}

/// What a chunk response echoes back
#[derive(Debug, Clone, Copy)]
struct Target {
    header: CommandHeader,
    op: ChunkOp,
    chunk_id: u64,
    offset: u64,
}

impl Target {
    fn of(command: &Command) -> Option<(Self, CommandBody)> {
        let (op, chunk_id, offset) = match &command.body {
            CommandBody::Read(c) => (ChunkOp::Read, c.chunk_id, c.offset),
            CommandBody::Write(c) => (ChunkOp::Write, c.chunk_id, c.offset),
            CommandBody::Set(c) => (ChunkOp::Set, c.chunk_id, c.offset),
            CommandBody::Reset(c) => (ChunkOp::Reset, c.chunk_id, c.offset),
            CommandBody::Opaque(_) => return None,
        };
        let target = Self {
            header: command.header,
            op,
            chunk_id,
            offset,
        };
        Some((target, command.body.clone()))
    }
}

/// Report the outcome, release the data buffer and post the response
fn finish(
    ctx: &EngineContext,
    conn: &Arc<dyn ConnectionSession>,
    mut req: Box<WorkRequest>,
    target: Target,
    bytes: u32,
    code: ReturnCode,
) -> Flow {
    let bytes = if code.is_success() { bytes } else { 0 };
    if !code.is_success() {
        debug!(
            "Chunk {:?} on chunk {} offset {} failed: {}",
            target.op, target.chunk_id, target.offset, code
        );
    }
    ctx.observer().on_chunk_io(&ChunkIoEvent {
        chunk_id: target.chunk_id,
        op: target.op,
        bytes: bytes as u64,
        latency: req.started().map(|t| t.elapsed()).unwrap_or_default(),
        return_code: code,
    });

    req.take_data();
    let response = Response::chunk(
        &target.header,
        code,
        ChunkReply {
            chunk_id: target.chunk_id,
            offset: target.offset,
            length: bytes,
            inline_data_len: 0,
        },
    );
    reply(ctx, conn, req, response)
}

fn resolve(ctx: &EngineContext, chunk_id: u64) -> Result<Arc<dyn ChunkStore>, ReturnCode> {
    ctx.resolver().resolve(chunk_id).ok_or_else(|| {
        debug!("Chunk {} is not placed on this node", chunk_id);
        ReturnCode::NotFound
    })
}

/// Bring a request that reached a state its service never produces to
/// `Error`
fn unexpected(mut req: Box<WorkRequest>, op: ChunkOp) -> Flow {
    warn!(
        "Chunk {:?} request {} in unexpected state {:?}",
        op,
        req.id(),
        req.status()
    );
    req.set_status(RequestStatus::Error);
    Flow::Continue(req)
}

/// Peer range covering `length` bytes of `desc`
fn peer_range(desc: &MemoryDescriptor, length: u32) -> Result<MemoryDescriptor, ReturnCode> {
    desc.slice(0, length).ok_or(ReturnCode::InvalidArgument)
}

/// Move data into a registered buffer of `length` bytes attached to `req`
fn attach_buffer(ctx: &EngineContext, req: &mut WorkRequest, length: u32) -> Result<(), ReturnCode> {
    let buffer = ctx
        .allocator()
        .allocate(length as usize)
        .map_err(|e| e.return_code())?;
    req.attach_data(buffer);
    req.sge = ScatterGather::new(Segment::Data, length as usize);
    Ok(())
}

/// READ: storage -> registered buffer -> RDMA write to the peer
#[derive(Debug, Default)]
pub struct ReadService;

impl ReadService {
    fn execute(
        ctx: &EngineContext,
        req: &mut WorkRequest,
        target: &Target,
        length: u32,
        desc: &MemoryDescriptor,
    ) -> Result<(), ReturnCode> {
        if length == 0 {
            return Err(ReturnCode::InvalidArgument);
        }
        peer_range(desc, length)?;
        let store = resolve(ctx, target.chunk_id)?;
        attach_buffer(ctx, req, length)?;
        let buf = req.local_mut().map_err(|e| e.return_code())?;
        store
            .read(target.chunk_id, target.offset, buf)
            .map_err(|e| EngineError::from(e).return_code())
    }
}

impl CommandService for ReadService {
    fn handle(
        &self,
        ctx: &EngineContext,
        conn: &Arc<dyn ConnectionSession>,
        mut req: Box<WorkRequest>,
    ) -> Flow {
        let Some((target, CommandBody::Read(cmd))) = req.command().and_then(Target::of) else {
            return unexpected(req, ChunkOp::Read);
        };

        match req.status() {
            RequestStatus::RecvDone => {
                match Self::execute(ctx, &mut req, &target, cmd.length, &cmd.desc) {
                    Ok(()) => {
                        req.set_status(RequestStatus::ExecDone);
                        Flow::Continue(req)
                    }
                    Err(code) => finish(ctx, conn, req, target, 0, code),
                }
            }
            RequestStatus::ExecDone => match peer_range(&cmd.desc, cmd.length) {
                Ok(remote) => {
                    req.sge = ScatterGather::new(Segment::Data, cmd.length as usize);
                    req.remote = Some(remote);
                    posted(ctx, conn.rdma_write(req))
                }
                Err(code) => finish(ctx, conn, req, target, 0, code),
            },
            RequestStatus::WriteDone => {
                ctx.stats().rdma_written(cmd.length as usize);
                finish(ctx, conn, req, target, cmd.length, ReturnCode::Success)
            }
            _ => unexpected(req, ChunkOp::Read),
        }
    }
}

/// WRITE: inline payload, or RDMA read from the peer, -> storage
#[derive(Debug, Default)]
pub struct WriteService;

impl WriteService {
    /// Store the inline payload. `None` means the command does not qualify
    /// for the inline path.
    fn write_inline(
        ctx: &EngineContext,
        req: &WorkRequest,
        target: &Target,
        length: u32,
        store: &dyn ChunkStore,
    ) -> Option<Result<(), ReturnCode>> {
        let inline_len = req.command()?.inline_data_len();
        if inline_len == 0 {
            return None;
        }
        if inline_len > ctx.config().protocol.inline_threshold || inline_len != length as usize {
            return Some(Err(ReturnCode::InvalidArgument));
        }
        let Some(payload) = req.inline_payload() else {
            return Some(Err(ReturnCode::InvalidArgument));
        };
        let result = store
            .write(target.chunk_id, target.offset, payload)
            .map_err(|e| EngineError::from(e).return_code());
        if result.is_ok() {
            ctx.stats().inline_write();
        }
        Some(result)
    }

    fn fetch(
        ctx: &EngineContext,
        req: &mut WorkRequest,
        length: u32,
        desc: &MemoryDescriptor,
    ) -> Result<(), ReturnCode> {
        let remote = peer_range(desc, length)?;
        attach_buffer(ctx, req, length)?;
        req.remote = Some(remote);
        Ok(())
    }

    fn store_fetched(
        ctx: &EngineContext,
        req: &WorkRequest,
        target: &Target,
        length: u32,
    ) -> Result<(), ReturnCode> {
        let store = resolve(ctx, target.chunk_id)?;
        let data = req.local().map_err(|e| e.return_code())?;
        store
            .write(target.chunk_id, target.offset, &data[..length as usize])
            .map_err(|e| EngineError::from(e).return_code())
    }
}

impl CommandService for WriteService {
    fn handle(
        &self,
        ctx: &EngineContext,
        conn: &Arc<dyn ConnectionSession>,
        mut req: Box<WorkRequest>,
    ) -> Flow {
        let Some((target, CommandBody::Write(cmd))) = req.command().and_then(Target::of) else {
            return unexpected(req, ChunkOp::Write);
        };

        match req.status() {
            RequestStatus::RecvDone => {
                if cmd.length == 0 {
                    return finish(ctx, conn, req, target, 0, ReturnCode::InvalidArgument);
                }
                let store = match resolve(ctx, target.chunk_id) {
                    Ok(store) => store,
                    Err(code) => return finish(ctx, conn, req, target, 0, code),
                };
                if let Some(result) = Self::write_inline(ctx, &req, &target, cmd.length, &*store) {
                    let code = result.err().unwrap_or(ReturnCode::Success);
                    return finish(ctx, conn, req, target, cmd.length, code);
                }
                match Self::fetch(ctx, &mut req, cmd.length, &cmd.desc) {
                    Ok(()) => posted(ctx, conn.rdma_read(req)),
                    Err(code) => finish(ctx, conn, req, target, 0, code),
                }
            }
            RequestStatus::ReadDone => {
                ctx.stats().rdma_read(cmd.length as usize);
                let code = Self::store_fetched(ctx, &req, &target, cmd.length)
                    .err()
                    .unwrap_or(ReturnCode::Success);
                finish(ctx, conn, req, target, cmd.length, code)
            }
            _ => unexpected(req, ChunkOp::Write),
        }
    }
}

/// SET / RESET: fill a range with ones or zeros
#[derive(Debug, Default)]
pub struct FillService;

impl CommandService for FillService {
    fn handle(
        &self,
        ctx: &EngineContext,
        conn: &Arc<dyn ConnectionSession>,
        req: Box<WorkRequest>,
    ) -> Flow {
        let Some((target, (CommandBody::Set(cmd) | CommandBody::Reset(cmd)))) =
            req.command().and_then(Target::of)
        else {
            return unexpected(req, ChunkOp::Set);
        };
        if req.status() != RequestStatus::RecvDone {
            return unexpected(req, target.op);
        }

        let result = match (cmd.length, target.op.fill_byte()) {
            (0, _) | (_, None) => Err(ReturnCode::InvalidArgument),
            (length, Some(byte)) => resolve(ctx, target.chunk_id).and_then(|store| {
                store
                    .fill(target.chunk_id, target.offset, length as u64, byte)
                    .map_err(|e| EngineError::from(e).return_code())
            }),
        };
        let code = result.err().unwrap_or(ReturnCode::Success);
        finish(ctx, conn, req, target, cmd.length, code)
    }
}
