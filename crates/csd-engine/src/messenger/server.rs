//! Server role: receive commands, run their services, send responses

use std::sync::Arc;

use csd_proto::{CommandHeader, Response};
use tracing::{debug, trace, warn};

use super::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::request::{Flow, RequestStatus, Role, WorkRequest, drive};
use crate::service::reply;
use crate::transport::{CompletionHandler, ConnectionSession, WorkCompletion};

/// Serves commands arriving on any number of connections
pub struct ServerMessenger {
    ctx: Arc<EngineContext>,
}

impl ServerMessenger {
    /// Create a server over `ctx`
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Shared engine context
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Take over completions of `conn` and keep `depth` receives posted
    pub fn listen(self: &Arc<Self>, conn: &Arc<dyn ConnectionSession>, depth: usize) -> EngineResult<()> {
        conn.attach(self.clone());
        let mut batch = self.ctx.pool().allocate_many(depth)?.into_iter();
        while let Some(req) = batch.next() {
            if let Err(e) = self.post_receive(conn, req) {
                for unposted in batch {
                    self.ctx.pool().free(unposted);
                }
                return Err(e);
            }
        }
        debug!("Listening on connection {} with {} receives", conn.id(), depth);
        Ok(())
    }

    fn post_receive(&self, conn: &Arc<dyn ConnectionSession>, mut req: Box<WorkRequest>) -> EngineResult<()> {
        req.prepare_receive(Role::Server);
        conn.register_receive(req).map_err(|refused| {
            self.ctx.pool().free(refused.request);
            refused.error
        })
    }

    /// Keep the receive depth constant: one completed receive, one new one
    fn replenish(&self, conn: &Arc<dyn ConnectionSession>) {
        let result = self
            .ctx
            .pool()
            .allocate_one()
            .and_then(|req| self.post_receive(conn, req));
        if let Err(e) = result {
            warn!("Connection {} lost a receive slot: {}", conn.id(), e);
            self.ctx.stats().transport_error();
        }
    }

    /// One dispatch step; see [`drive`]
    fn step(&self, conn: &Arc<dyn ConnectionSession>, mut req: Box<WorkRequest>) -> Flow {
        match req.status() {
            RequestStatus::RecvDone
            | RequestStatus::ExecDone
            | RequestStatus::ReadDone
            | RequestStatus::WriteDone => {
                let Some(header) = req.command().map(|c| c.header) else {
                    req.set_status(RequestStatus::Error);
                    return Flow::Continue(req);
                };
                match self.ctx.services().get_service(header.class, header.sequence) {
                    Some(service) => service.handle(&self.ctx, conn, req),
                    None => self.unsupported(conn, req, &header),
                }
            }
            RequestStatus::SendDone | RequestStatus::Error | RequestStatus::Free => {
                req.set_status(RequestStatus::Destroy);
                Flow::Continue(req)
            }
            RequestStatus::Destroy => {
                trace!("Request {} back to pool", req.id());
                self.ctx.pool().free(req);
                Flow::Pending
            }
        }
    }

    fn unsupported(
        &self,
        conn: &Arc<dyn ConnectionSession>,
        req: Box<WorkRequest>,
        header: &CommandHeader,
    ) -> Flow {
        let missing = EngineError::MissingService {
            class: header.class,
            sequence: header.sequence,
        };
        debug!("Request {}: {}", req.id(), missing);
        reply(&self.ctx, conn, req, Response::reply_to(header, missing.return_code()))
    }

    /// Answer a command that failed to decode. Without a readable header
    /// there is nowhere to route a response, so the request is dropped.
    fn reject(&self, conn: &Arc<dyn ConnectionSession>, mut req: Box<WorkRequest>, error: EngineError) -> Flow {
        let received = &req.header()[..req.received_len()];
        match CommandHeader::from_bytes(received) {
            Ok(header) => {
                warn!("Request {} undecodable command: {}", req.id(), error);
                reply(&self.ctx, conn, req, Response::reply_to(&header, error.return_code()))
            }
            Err(_) => {
                warn!(
                    "Request {} dropped {} byte message without a header",
                    req.id(),
                    req.received_len()
                );
                req.set_status(RequestStatus::Destroy);
                Flow::Continue(req)
            }
        }
    }
}

impl CompletionHandler for ServerMessenger {
    fn on_send_done(&self, conn: &Arc<dyn ConnectionSession>, wc: WorkCompletion) {
        let WorkCompletion {
            request: mut req,
            opcode,
            status,
            ..
        } = wc;
        if !status.is_success() {
            warn!("Request {} {:?} failed: {:?}", req.id(), opcode, status);
            self.ctx.stats().transport_error();
        }
        req.set_status(RequestStatus::on_completion(opcode, status));
        drive(req, |req| self.step(conn, req));
    }

    fn on_recv_done(&self, conn: &Arc<dyn ConnectionSession>, wc: WorkCompletion) {
        let WorkCompletion {
            request: mut req,
            opcode,
            status,
            ..
        } = wc;
        if conn.is_connected() {
            self.replenish(conn);
        }

        req.set_status(RequestStatus::on_completion(opcode, status));
        if !status.is_success() {
            warn!("Request {} receive failed: {:?}", req.id(), status);
            self.ctx.stats().transport_error();
            drive(req, |req| self.step(conn, req));
            return;
        }

        self.ctx.stats().command_received();
        let (id, len) = (req.id(), req.received_len());
        let first = match req.decode_command() {
            Ok(command) => {
                trace!(
                    "Request {} command {} ({} bytes)",
                    id,
                    command.header.service_key(),
                    len
                );
                Flow::Continue(req)
            }
            Err(e) => self.reject(conn, req, e),
        };
        if let Flow::Continue(req) = first {
            drive(req, |req| self.step(conn, req));
        }
    }

    fn on_send_cancelled(&self, wc: WorkCompletion) {
        let mut req = wc.request;
        debug!("Request {} {:?} cancelled", req.id(), wc.opcode);
        req.set_status(RequestStatus::Destroy);
        self.ctx.pool().free(req);
    }

    fn on_recv_cancelled(&self, wc: WorkCompletion) {
        let mut req = wc.request;
        trace!("Request {} receive cancelled", req.id());
        req.set_status(RequestStatus::Destroy);
        self.ctx.pool().free(req);
    }
}

impl std::fmt::Debug for ServerMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMessenger").finish_non_exhaustive()
    }
}
