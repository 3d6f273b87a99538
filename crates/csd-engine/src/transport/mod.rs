//! Connection-oriented transport seam.
//!
//! A [`ConnectionSession`] posts work requests; each post later produces a
//! [`WorkCompletion`] that the transport hands to the attached
//! [`CompletionHandler`]. Ownership of the request travels with the post and
//! comes back with the completion, so a request is never touched by two
//! parties at once.
//!
//! Requests never hold a reference to their connection. The handler is given
//! the connection on every callback instead.

mod loopback;

use std::fmt;
use std::sync::Arc;

pub use loopback::{LoopbackConnection, LoopbackFabric};

use crate::error::EngineError;
use crate::request::WorkRequest;

/// Operation a completion reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Two-sided send
    Send,
    /// Posted receive
    Recv,
    /// One-sided read of peer memory
    RdmaRead,
    /// One-sided write to peer memory
    RdmaWrite,
}

/// Outcome of a transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// Operation finished
    Success,
    /// Incoming message larger than the posted receive
    LocalLengthError,
    /// Peer memory key or bounds rejected
    RemoteAccessError,
    /// Flushed because the connection closed
    WrFlushError,
    /// Peer unreachable
    RetryExceeded,
    /// Any other failure
    GeneralError,
}

impl CompletionStatus {
    /// Check if the operation succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Success)
    }
}

/// Completed operation, returning ownership of the request
pub struct WorkCompletion {
    /// The request that was posted
    pub request: Box<WorkRequest>,
    /// Operation type
    pub opcode: Opcode,
    /// Outcome
    pub status: CompletionStatus,
    /// Bytes moved
    pub byte_len: usize,
}

impl WorkCompletion {
    /// Build a completion for `request`
    pub fn new(
        request: Box<WorkRequest>,
        opcode: Opcode,
        status: CompletionStatus,
        byte_len: usize,
    ) -> Self {
        Self {
            request,
            opcode,
            status,
            byte_len,
        }
    }
}

impl fmt::Debug for WorkCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkCompletion")
            .field("request", &self.request.id())
            .field("opcode", &self.opcode)
            .field("status", &self.status)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

/// A post the transport refused; the request is handed back
#[derive(Debug, thiserror::Error)]
#[error("post of request {} failed: {error}", .request.id())]
pub struct PostError {
    /// The request that could not be posted
    pub request: Box<WorkRequest>,
    /// Why
    #[source]
    pub error: EngineError,
}

impl PostError {
    /// Wrap a refused request
    pub fn new(request: Box<WorkRequest>, error: EngineError) -> Self {
        Self { request, error }
    }
}

/// Result of posting a request
pub type PostResult = Result<(), PostError>;

/// One established connection
pub trait ConnectionSession: Send + Sync {
    /// Connection id
    fn id(&self) -> u64;

    /// Route completions of this connection to `handler`
    fn attach(&self, handler: Arc<dyn CompletionHandler>);

    /// Send the bytes named by the request's scatter/gather entry
    fn send(&self, req: Box<WorkRequest>) -> PostResult;

    /// Post the request's header buffer as a receive
    fn register_receive(&self, req: Box<WorkRequest>) -> PostResult;

    /// Read `req.remote` from the peer into the local bytes
    fn rdma_read(&self, req: Box<WorkRequest>) -> PostResult;

    /// Write the local bytes to `req.remote` on the peer
    fn rdma_write(&self, req: Box<WorkRequest>) -> PostResult;

    /// Close the connection. Posted receives complete with
    /// [`CompletionStatus::WrFlushError`].
    fn close(&self);

    /// Whether posts are still accepted
    fn is_connected(&self) -> bool;
}

/// Receiver of completions
pub trait CompletionHandler: Send + Sync {
    /// A send, RDMA read or RDMA write finished (successfully or not)
    fn on_send_done(&self, conn: &Arc<dyn ConnectionSession>, wc: WorkCompletion);

    /// A receive finished (successfully or not)
    fn on_recv_done(&self, conn: &Arc<dyn ConnectionSession>, wc: WorkCompletion);

    /// An outbound operation was flushed by close
    fn on_send_cancelled(&self, wc: WorkCompletion);

    /// A posted receive was flushed by close
    fn on_recv_cancelled(&self, wc: WorkCompletion);
}
