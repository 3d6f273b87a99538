//! Client role: send commands and hand each response to its callback.
//!
//! Responses carry no request id. A connection delivers them in the order
//! the commands were sent, so the oldest registered callback owns the next
//! response. Commands that never reach the peer are taken out of the FIFO
//! by position, which keeps the pairing intact for everything behind them.
//! A command the peer dropped without answering shows up as a response
//! whose route differs from the oldest call; that call is failed and the
//! response goes to the next one.

use std::sync::Arc;

use csd_proto::{Command, CommandHeader, MemoryDescriptor, Response, WriteCommand};
use csd_queue::{SlotId, SlotRing};
use tracing::{debug, trace, warn};

use super::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::memory::RegisteredBuffer;
use crate::request::{Flow, RequestStatus, Role, WorkRequest, drive};
use crate::transport::{CompletionHandler, ConnectionSession, WorkCompletion};

/// Invoked exactly once with the response, or with the error that prevented
/// one
pub type ResponseCallback = Box<dyn FnOnce(EngineResult<Response>) + Send>;

struct PendingCall {
    header: CommandHeader,
    callback: ResponseCallback,
}

impl PendingCall {
    fn complete(self, result: EngineResult<Response>) {
        (self.callback)(result)
    }
}

/// Issues commands on one or more connections
pub struct ClientMessenger {
    ctx: Arc<EngineContext>,
    pending: SlotRing<PendingCall>,
}

impl ClientMessenger {
    /// Create a client over `ctx`. At most
    /// `transport.max_outstanding` commands may await a response.
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        let transport = &ctx.config().transport;
        let pending = SlotRing::with_policy(
            transport.max_outstanding.max(1),
            ctx.config().queue.spin_policy(),
        );
        Arc::new(Self { ctx, pending })
    }

    /// Shared engine context
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Take over completions of `conn`
    pub fn attach(self: &Arc<Self>, conn: &Arc<dyn ConnectionSession>) {
        conn.attach(self.clone());
    }

    /// Send `command` (followed by `inline` payload bytes) and register
    /// `callback` for its response.
    ///
    /// An `Err` means the command was not accepted and `callback` was dropped
    /// without being called. Once accepted, every outcome, including a send
    /// that could not be posted, reaches `callback`.
    pub fn submit(
        &self,
        conn: &Arc<dyn ConnectionSession>,
        command: &Command,
        inline: &[u8],
        callback: ResponseCallback,
    ) -> EngineResult<()> {
        let pool = self.ctx.pool();
        let mut send = pool.allocate_one()?;
        if let Err(e) = send.write_command(command, inline) {
            pool.free(send);
            return Err(e);
        }
        let mut recv = match pool.allocate_one() {
            Ok(recv) => recv,
            Err(e) => {
                pool.free(send);
                return Err(e);
            }
        };
        recv.prepare_receive(Role::Client);

        self.pending.trim();
        let call = PendingCall {
            header: command.header,
            callback,
        };
        let slot = match self.pending.try_save(call) {
            Ok(slot) => slot,
            Err(_) => {
                pool.free(send);
                pool.free(recv);
                return Err(EngineError::QueueFull(self.pending.capacity()));
            }
        };

        if let Err(refused) = conn.register_receive(recv) {
            self.pending.remove(slot);
            self.pending.trim();
            pool.free(send);
            pool.free(refused.request);
            return Err(refused.error);
        }

        send.set_tag(slot.position() as u64);
        trace!(
            "Submitting {} as request {} (slot {})",
            command.header.service_key(),
            send.id(),
            slot.position()
        );
        if let Err(refused) = conn.send(send) {
            warn!("Command send could not be posted: {}", refused.error);
            self.ctx.stats().transport_error();
            self.fail(refused.request.tag(), refused.error);
            pool.free(refused.request);
        }
        Ok(())
    }

    /// Write the first `length` bytes of `source` to `chunk_id` at `offset`.
    ///
    /// Payloads up to `protocol.inline_threshold` travel inside the command;
    /// larger ones are described by `source` and pulled by the server. The
    /// server applies its own threshold, so both sides should agree on it.
    pub fn submit_write(
        &self,
        conn: &Arc<dyn ConnectionSession>,
        chunk_id: u64,
        offset: u64,
        source: &RegisteredBuffer,
        length: u32,
        callback: ResponseCallback,
    ) -> EngineResult<()> {
        let len = length as usize;
        if len > source.len() {
            return Err(EngineError::InvalidSize(len));
        }
        let inline = len > 0 && len <= self.ctx.config().protocol.inline_threshold;
        let (inline_data_len, desc, payload) = if inline {
            (length, MemoryDescriptor::default(), &source.as_slice()[..len])
        } else {
            let desc = source
                .descriptor()
                .slice(0, length)
                .ok_or(EngineError::InvalidSize(len))?;
            (0, desc, &[][..])
        };
        let command = Command::write(WriteCommand {
            chunk_id,
            offset,
            length,
            inline_data_len,
            desc,
        })?;
        self.submit(conn, &command, payload, callback)
    }

    /// Fail every callback still waiting for a response. Returns how many
    /// were failed.
    pub fn abort_pending(&self) -> usize {
        let mut aborted = 0;
        while let Some(call) = self.pending.pop() {
            call.complete(Err(EngineError::Disconnected(
                "aborted while awaiting response".to_string(),
            )));
            aborted += 1;
        }
        if aborted > 0 {
            debug!("Aborted {} pending commands", aborted);
        }
        aborted
    }

    /// Remove the callback saved at `tag` and fail it
    fn fail(&self, tag: u64, error: EngineError) {
        let call = self.pending.remove(SlotId::from_position(tag as usize));
        self.pending.trim();
        match call {
            Some(call) => call.complete(Err(error)),
            None => debug!("Slot {} already resolved", tag),
        }
    }

    /// Fail the oldest pending call, if any
    fn fail_oldest(&self, error: EngineError) {
        match self.pending.pop() {
            Some(call) => call.complete(Err(error)),
            None => {
                debug!("No pending command to fail: {}", error);
                self.ctx.stats().correlation_mismatch();
            }
        }
    }

    /// Hand `response` to the oldest call routed like it. Older calls were
    /// dropped by the peer and are failed on the way.
    fn dispatch(&self, response: Response) {
        while let Some(call) = self.pending.pop() {
            if response.header.same_route(&call.header) {
                call.complete(Ok(response));
                return;
            }
            warn!(
                "Command {:?} was not answered before {:?}",
                call.header, response.header
            );
            self.ctx.stats().correlation_mismatch();
            call.complete(Err(EngineError::Transport(
                "peer dropped the command without responding".to_string(),
            )));
        }
        warn!("Response {:?} matches no pending command", response.header);
        self.ctx.stats().correlation_mismatch();
    }

    /// One dispatch step; see [`drive`]
    fn step(&self, mut req: Box<WorkRequest>) -> Flow {
        match req.status() {
            RequestStatus::RecvDone => {
                match req.read_response() {
                    Ok(response) => self.dispatch(response),
                    Err(e) => {
                        warn!("Request {} undecodable response: {}", req.id(), e);
                        self.fail_oldest(e);
                    }
                }
                req.set_status(RequestStatus::Destroy);
                Flow::Continue(req)
            }
            RequestStatus::SendDone | RequestStatus::Error => {
                req.set_status(RequestStatus::Destroy);
                Flow::Continue(req)
            }
            RequestStatus::Destroy => {
                trace!("Request {} back to pool", req.id());
                self.ctx.pool().free(req);
                Flow::Pending
            }
            other => {
                warn!("Request {} unexpected client status {:?}", req.id(), other);
                req.set_status(RequestStatus::Error);
                Flow::Continue(req)
            }
        }
    }
}

impl CompletionHandler for ClientMessenger {
    fn on_send_done(&self, _conn: &Arc<dyn ConnectionSession>, wc: WorkCompletion) {
        let WorkCompletion {
            request: mut req,
            opcode,
            status,
            ..
        } = wc;
        if !status.is_success() {
            warn!("Request {} {:?} failed: {:?}", req.id(), opcode, status);
            self.ctx.stats().transport_error();
            self.fail(
                req.tag(),
                EngineError::Transport(format!("{:?} completed with {:?}", opcode, status)),
            );
        }
        req.set_status(RequestStatus::on_completion(opcode, status));
        drive(req, |req| self.step(req));
    }

    fn on_recv_done(&self, _conn: &Arc<dyn ConnectionSession>, wc: WorkCompletion) {
        let WorkCompletion {
            request: mut req,
            opcode,
            status,
            ..
        } = wc;
        if !status.is_success() {
            warn!("Request {} response receive failed: {:?}", req.id(), status);
            self.ctx.stats().transport_error();
            self.fail_oldest(EngineError::Transport(format!(
                "response receive completed with {:?}",
                status
            )));
        }
        req.set_status(RequestStatus::on_completion(opcode, status));
        drive(req, |req| self.step(req));
    }

    fn on_send_cancelled(&self, wc: WorkCompletion) {
        let mut req = wc.request;
        debug!("Request {} command send cancelled", req.id());
        self.fail(
            req.tag(),
            EngineError::Disconnected("send cancelled".to_string()),
        );
        req.set_status(RequestStatus::Error);
        drive(req, |req| self.step(req));
    }

    fn on_recv_cancelled(&self, wc: WorkCompletion) {
        let mut req = wc.request;
        trace!("Request {} response receive cancelled", req.id());
        req.set_status(RequestStatus::Error);
        drive(req, |req| self.step(req));
    }
}

impl std::fmt::Debug for ClientMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMessenger")
            .field("pending", &self.pending.pending())
            .finish()
    }
}
