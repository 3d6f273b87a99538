//! In-process transport.
//!
//! Connections come in pairs. Sends are copied into the peer's posted
//! receives. A send that finds no receive posted stays outstanding until
//! one is, and is cancelled if the pair closes first. RDMA operations go through
//! the shared [`MemoryRegistry`], which enforces descriptor keys and bounds
//! the way an adapter would. Completions are queued per connection and only
//! delivered from [`LoopbackFabric::poll`], never from inside a post.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use csd_queue::{LinkedQueue, RingQueue, SpinPolicy};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::{
    CompletionHandler, CompletionStatus, ConnectionSession, Opcode, PostError, PostResult,
    WorkCompletion,
};
use crate::config::TransportConfig;
use crate::error::EngineError;
use crate::memory::MemoryRegistry;
use crate::request::WorkRequest;

/// Creates connected pairs and polls their completion queues
pub struct LoopbackFabric {
    registry: Arc<MemoryRegistry>,
    config: TransportConfig,
    policy: SpinPolicy,
    next_id: AtomicU64,
    connections: Mutex<Vec<Weak<LoopbackConnection>>>,
}

impl LoopbackFabric {
    /// Create a fabric over `registry`
    pub fn new(registry: Arc<MemoryRegistry>, config: TransportConfig, policy: SpinPolicy) -> Self {
        Self {
            registry,
            config,
            policy,
            next_id: AtomicU64::new(1),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Registry RDMA operations are checked against
    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    /// Create two connected endpoints
    pub fn connect(&self) -> (Arc<LoopbackConnection>, Arc<LoopbackConnection>) {
        let a = self.endpoint();
        let b = self.endpoint();
        *a.peer.write() = Arc::downgrade(&b);
        *b.peer.write() = Arc::downgrade(&a);

        let mut connections = self.connections.lock();
        connections.retain(|conn| conn.strong_count() > 0);
        connections.push(Arc::downgrade(&a));
        connections.push(Arc::downgrade(&b));
        debug!("Loopback connection {} <-> {}", a.id, b.id);
        (a, b)
    }

    fn endpoint(&self) -> Arc<LoopbackConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let depth = self.config.completion_queue_depth.max(2);
        Arc::new_cyclic(|me| LoopbackConnection {
            id,
            me: me.clone(),
            registry: self.registry.clone(),
            peer: RwLock::new(Weak::new()),
            handler: RwLock::new(None),
            recv: Mutex::new(RecvState::default()),
            cq: RingQueue::with_policy(depth, self.policy),
            backlog: LinkedQueue::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver up to `poll_batch` completions per live connection. Returns
    /// the number delivered.
    pub fn poll(&self) -> usize {
        let live: Vec<_> = self
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        live.iter()
            .map(|conn| conn.poll(self.config.poll_batch))
            .sum()
    }

    /// Poll until nothing is delivered or `max_rounds` rounds have run.
    /// Returns the total number of completions delivered.
    pub fn run_until_idle(&self, max_rounds: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_rounds {
            let delivered = self.poll();
            if delivered == 0 {
                break;
            }
            total += delivered;
        }
        total
    }
}

/// A peer send waiting for a receive to be posted
struct Parked {
    send: Box<WorkRequest>,
    message: Bytes,
}

#[derive(Default)]
struct RecvState {
    posted: VecDeque<Box<WorkRequest>>,
    waiting: VecDeque<Parked>,
}

/// One endpoint of a loopback pair
pub struct LoopbackConnection {
    id: u64,
    me: Weak<LoopbackConnection>,
    registry: Arc<MemoryRegistry>,
    peer: RwLock<Weak<LoopbackConnection>>,
    handler: RwLock<Option<Arc<dyn CompletionHandler>>>,
    recv: Mutex<RecvState>,
    cq: RingQueue<WorkCompletion>,
    /// Overflow once `cq` is full; drained after it
    backlog: LinkedQueue<WorkCompletion>,
    closed: AtomicBool,
}

impl LoopbackConnection {
    /// Receives currently posted
    pub fn posted_receives(&self) -> usize {
        self.recv.lock().posted.len()
    }

    /// Completions queued but not yet delivered
    pub fn has_completions(&self) -> bool {
        !self.cq.is_empty() || !self.backlog.is_empty()
    }

    /// Deliver up to `max` queued completions to the attached handler.
    /// Completions stay queued while no handler is attached.
    pub fn poll(&self, max: usize) -> usize {
        let Some(handler) = self.handler.read().clone() else {
            return 0;
        };
        let Some(me) = self.me.upgrade() else {
            return 0;
        };
        let conn: Arc<dyn ConnectionSession> = me;

        let mut delivered = 0;
        while delivered < max {
            let Some(wc) = self.cq.try_pop().or_else(|| self.backlog.pop()) else {
                break;
            };
            trace!(
                "Connection {} completion {:?} {:?} for request {}",
                self.id,
                wc.opcode,
                wc.status,
                wc.request.id()
            );
            match (wc.opcode, wc.status) {
                (Opcode::Recv, CompletionStatus::WrFlushError) => handler.on_recv_cancelled(wc),
                (_, CompletionStatus::WrFlushError) => handler.on_send_cancelled(wc),
                (Opcode::Recv, _) => handler.on_recv_done(&conn, wc),
                _ => handler.on_send_done(&conn, wc),
            }
            delivered += 1;
        }
        delivered
    }

    fn complete(&self, wc: WorkCompletion) {
        if !self.backlog.is_empty() {
            self.backlog.push(wc);
            return;
        }
        if let Err(wc) = self.cq.try_push(wc) {
            debug!("Connection {} completion queue full, spilling", self.id);
            self.backlog.push(wc);
        }
    }

    fn peer(&self) -> Option<Arc<LoopbackConnection>> {
        self.peer
            .read()
            .upgrade()
            .filter(|peer| !peer.closed.load(Ordering::Acquire))
    }

    fn ensure_open(&self, req: Box<WorkRequest>) -> Result<Box<WorkRequest>, PostError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PostError::new(
                req,
                EngineError::Disconnected(format!("connection {} is closed", self.id)),
            ));
        }
        Ok(req)
    }

    /// Land a peer send in the oldest posted receive, or park it
    fn deliver(&self, parked: Parked) {
        let mut recv = self.recv.lock();
        let posted = recv.posted.pop_front();
        match posted {
            Some(req) => {
                drop(recv);
                self.transfer(parked, req);
            }
            None => {
                trace!(
                    "Connection {} parked {} byte message",
                    self.id,
                    parked.message.len()
                );
                recv.waiting.push_back(parked);
            }
        }
    }

    /// Complete both sides of a send landing in `target`
    fn transfer(&self, parked: Parked, target: Box<WorkRequest>) {
        let Parked { send, message } = parked;
        self.fill_receive(target, &message);
        self.complete_for_sender(WorkCompletion::new(
            send,
            Opcode::Send,
            CompletionStatus::Success,
            message.len(),
        ));
    }

    /// Queue a send completion on the peer that posted the send
    fn complete_for_sender(&self, wc: WorkCompletion) {
        match self.peer.read().upgrade() {
            Some(sender) => sender.complete(wc),
            None => debug!(
                "Connection {} dropped completion for request {}: sender gone",
                self.id,
                wc.request.id()
            ),
        }
    }

    fn fill_receive(&self, mut req: Box<WorkRequest>, message: &[u8]) {
        let wc = if req.receive_into(message) {
            WorkCompletion::new(req, Opcode::Recv, CompletionStatus::Success, message.len())
        } else {
            warn!(
                "Connection {} dropped {} byte message: receive buffer holds {}",
                self.id,
                message.len(),
                req.header_capacity()
            );
            WorkCompletion::new(req, Opcode::Recv, CompletionStatus::LocalLengthError, 0)
        };
        self.complete(wc);
    }
}

impl ConnectionSession for LoopbackConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn attach(&self, handler: Arc<dyn CompletionHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn send(&self, req: Box<WorkRequest>) -> PostResult {
        let req = self.ensure_open(req)?;
        let Some(peer) = self.peer() else {
            self.complete(WorkCompletion::new(req, Opcode::Send, CompletionStatus::RetryExceeded, 0));
            return Ok(());
        };
        let message = match req.local() {
            Ok(message) => Bytes::copy_from_slice(message),
            Err(error) => return Err(PostError::new(req, error)),
        };
        peer.deliver(Parked { send: req, message });
        Ok(())
    }

    fn register_receive(&self, req: Box<WorkRequest>) -> PostResult {
        let req = self.ensure_open(req)?;
        let mut recv = self.recv.lock();
        let parked = recv.waiting.pop_front();
        match parked {
            Some(parked) => {
                drop(recv);
                self.transfer(parked, req);
            }
            None => recv.posted.push_back(req),
        }
        Ok(())
    }

    fn rdma_read(&self, req: Box<WorkRequest>) -> PostResult {
        let mut req = self.ensure_open(req)?;
        let Some(remote) = req.remote else {
            return Err(PostError::new(
                req,
                EngineError::Transport("RDMA read without a remote descriptor".into()),
            ));
        };
        if self.peer().is_none() {
            self.complete(WorkCompletion::new(req, Opcode::RdmaRead, CompletionStatus::RetryExceeded, 0));
            return Ok(());
        }
        let result = match req.local_mut() {
            Ok(local) => self.registry.remote_read(&remote, local).map(|_| local.len()),
            Err(error) => return Err(PostError::new(req, error)),
        };
        let wc = match result {
            Ok(len) => WorkCompletion::new(req, Opcode::RdmaRead, CompletionStatus::Success, len),
            Err(_) => WorkCompletion::new(req, Opcode::RdmaRead, CompletionStatus::RemoteAccessError, 0),
        };
        self.complete(wc);
        Ok(())
    }

    fn rdma_write(&self, req: Box<WorkRequest>) -> PostResult {
        let req = self.ensure_open(req)?;
        let Some(remote) = req.remote else {
            return Err(PostError::new(
                req,
                EngineError::Transport("RDMA write without a remote descriptor".into()),
            ));
        };
        if self.peer().is_none() {
            self.complete(WorkCompletion::new(req, Opcode::RdmaWrite, CompletionStatus::RetryExceeded, 0));
            return Ok(());
        }
        let result = match req.local() {
            Ok(local) => self.registry.remote_write(&remote, local).map(|_| local.len()),
            Err(error) => return Err(PostError::new(req, error)),
        };
        let wc = match result {
            Ok(len) => WorkCompletion::new(req, Opcode::RdmaWrite, CompletionStatus::Success, len),
            Err(_) => WorkCompletion::new(req, Opcode::RdmaWrite, CompletionStatus::RemoteAccessError, 0),
        };
        self.complete(wc);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (flushed, parked): (Vec<_>, Vec<_>) = {
            let mut recv = self.recv.lock();
            (recv.posted.drain(..).collect(), recv.waiting.drain(..).collect())
        };
        debug!(
            "Connection {} closed, flushing {} receives and {} peer sends",
            self.id,
            flushed.len(),
            parked.len()
        );
        for req in flushed {
            self.complete(WorkCompletion::new(req, Opcode::Recv, CompletionStatus::WrFlushError, 0));
        }
        for Parked { send, .. } in parked {
            self.complete_for_sender(WorkCompletion::new(
                send,
                Opcode::Send,
                CompletionStatus::WrFlushError,
                0,
            ));
        }
        if let Some(peer) = self.peer.read().upgrade() {
            peer.close();
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("posted_receives", &self.posted_receives())
            .finish()
    }
}
