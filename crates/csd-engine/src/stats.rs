//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by both messenger roles
#[derive(Debug, Default)]
pub struct EngineStats {
    commands_received: AtomicU64,
    responses_sent: AtomicU64,
    error_responses: AtomicU64,
    rdma_bytes_read: AtomicU64,
    rdma_bytes_written: AtomicU64,
    inline_writes: AtomicU64,
    transport_errors: AtomicU64,
    correlation_mismatches: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Commands delivered to the server role
    pub commands_received: u64,
    /// Responses posted by the server role
    pub responses_sent: u64,
    /// Responses carrying a non-success return code
    pub error_responses: u64,
    /// Bytes pulled from peers with RDMA read
    pub rdma_bytes_read: u64,
    /// Bytes pushed to peers with RDMA write
    pub rdma_bytes_written: u64,
    /// Writes served from inline payload
    pub inline_writes: u64,
    /// Failed posts and error completions
    pub transport_errors: u64,
    /// Responses whose routing did not match the oldest pending command
    pub correlation_mismatches: u64,
}

impl EngineStats {
    pub(crate) fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn response_sent(&self, success: bool) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.error_responses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn rdma_read(&self, bytes: usize) {
        self.rdma_bytes_read
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn rdma_written(&self, bytes: usize) {
        self.rdma_bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn inline_write(&self) {
        self.inline_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn correlation_mismatch(&self) {
        self.correlation_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            commands_received: self.commands_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            error_responses: self.error_responses.load(Ordering::Relaxed),
            rdma_bytes_read: self.rdma_bytes_read.load(Ordering::Relaxed),
            rdma_bytes_written: self.rdma_bytes_written.load(Ordering::Relaxed),
            inline_writes: self.inline_writes.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            correlation_mismatches: self.correlation_mismatches.load(Ordering::Relaxed),
        }
    }
}
