//! Storage collaborators: chunk devices, device resolution and I/O observation
//!
//! Chunk placement and metadata persistence live outside the engine. The
//! engine only needs to turn a chunk id into a device that can read, write
//! and fill byte ranges, and to report what it did.

use std::sync::Arc;
use std::time::Duration;

use csd_proto::{ChunkOp, ReturnCode};
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage backend errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Range falls outside the chunk
    #[error("Out of range: chunk={chunk_id}, offset={offset}, len={len}")]
    OutOfRange {
        /// Chunk addressed
        chunk_id: u64,
        /// Start offset
        offset: u64,
        /// Length in bytes
        len: u64,
    },

    /// Device-level failure
    #[error("Device error: {0}")]
    Device(String),
}

/// A device holding fixed-size chunks
pub trait ChunkStore: Send + Sync {
    /// Bytes per chunk
    fn chunk_size(&self) -> u64;

    /// Read `buf.len()` bytes at `offset`
    fn read(&self, chunk_id: u64, offset: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Write `data` at `offset`
    fn write(&self, chunk_id: u64, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Fill `len` bytes at `offset` with `byte`
    fn fill(&self, chunk_id: u64, offset: u64, len: u64, byte: u8) -> StorageResult<()>;
}

/// Maps a chunk id to the device that stores it
pub trait DeviceResolver: Send + Sync {
    /// Device for `chunk_id`, or `None` if the chunk is not placed here
    fn resolve(&self, chunk_id: u64) -> Option<Arc<dyn ChunkStore>>;
}

/// Resolver with an explicit chunk table and an optional fallback device
#[derive(Default)]
pub struct StaticResolver {
    routes: DashMap<u64, Arc<dyn ChunkStore>>,
    fallback: Option<Arc<dyn ChunkStore>>,
}

impl StaticResolver {
    /// Resolver that knows no chunks
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver placing every chunk on `store`
    pub fn with_fallback(store: Arc<dyn ChunkStore>) -> Self {
        Self {
            routes: DashMap::new(),
            fallback: Some(store),
        }
    }

    /// Place `chunk_id` on `store`
    pub fn route(&self, chunk_id: u64, store: Arc<dyn ChunkStore>) {
        self.routes.insert(chunk_id, store);
    }
}

impl DeviceResolver for StaticResolver {
    fn resolve(&self, chunk_id: u64) -> Option<Arc<dyn ChunkStore>> {
        self.routes
            .get(&chunk_id)
            .map(|entry| entry.value().clone())
            .or_else(|| self.fallback.clone())
    }
}

/// In-memory chunk device; chunks are zero-filled on first touch
pub struct MemoryChunkStore {
    chunk_size: u64,
    chunks: DashMap<u64, Vec<u8>>,
}

impl MemoryChunkStore {
    /// Create a store with `chunk_size`-byte chunks
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            chunks: DashMap::new(),
        }
    }

    /// Number of chunks that have been written
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn check_range(&self, chunk_id: u64, offset: u64, len: u64) -> StorageResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.chunk_size => Ok(()),
            _ => Err(StorageError::OutOfRange {
                chunk_id,
                offset,
                len,
            }),
        }
    }

    fn with_chunk_mut<R>(&self, chunk_id: u64, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut chunk = self
            .chunks
            .entry(chunk_id)
            .or_insert_with(|| vec![0u8; self.chunk_size as usize]);
        f(chunk.value_mut().as_mut_slice())
    }
}

impl ChunkStore for MemoryChunkStore {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn read(&self, chunk_id: u64, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.check_range(chunk_id, offset, buf.len() as u64)?;
        match self.chunks.get(&chunk_id) {
            Some(chunk) => {
                let start = offset as usize;
                buf.copy_from_slice(&chunk[start..start + buf.len()]);
            }
            None => buf.fill(0),
        }
        trace!("Read chunk {} [{}, +{})", chunk_id, offset, buf.len());
        Ok(())
    }

    fn write(&self, chunk_id: u64, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.check_range(chunk_id, offset, data.len() as u64)?;
        self.with_chunk_mut(chunk_id, |chunk| {
            let start = offset as usize;
            chunk[start..start + data.len()].copy_from_slice(data);
        });
        trace!("Wrote chunk {} [{}, +{})", chunk_id, offset, data.len());
        Ok(())
    }

    fn fill(&self, chunk_id: u64, offset: u64, len: u64, byte: u8) -> StorageResult<()> {
        self.check_range(chunk_id, offset, len)?;
        self.with_chunk_mut(chunk_id, |chunk| {
            let start = offset as usize;
            chunk[start..start + len as usize].fill(byte);
        });
        trace!("Filled chunk {} [{}, +{}) with {:#04x}", chunk_id, offset, len, byte);
        Ok(())
    }
}

/// Outcome of one chunk command, reported after the response is posted
#[derive(Debug, Clone)]
pub struct ChunkIoEvent {
    /// Chunk addressed
    pub chunk_id: u64,
    /// Operation performed
    pub op: ChunkOp,
    /// Bytes moved or filled
    pub bytes: u64,
    /// Time from command arrival to response
    pub latency: Duration,
    /// Status returned to the peer
    pub return_code: ReturnCode,
}

/// Hook for the metadata layer to record chunk activity
pub trait IoObserver: Send + Sync {
    /// Called once per completed chunk command
    fn on_chunk_io(&self, event: &ChunkIoEvent);
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl IoObserver for NoopObserver {
    fn on_chunk_io(&self, _event: &ChunkIoEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untouched_chunk_reads_zero() {
        let store = MemoryChunkStore::new(1024);
        let mut buf = [0xAAu8; 16];
        store.read(7, 100, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(store.allocated_chunks(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let store = MemoryChunkStore::new(1024);
        store.write(1, 10, b"hello").unwrap();
        let mut buf = [0u8; 7];
        store.read(1, 9, &mut buf).unwrap();
        assert_eq!(&buf, b"\0hello\0");
    }

    #[test]
    fn test_fill() {
        let store = MemoryChunkStore::new(64);
        store.fill(2, 0, 64, 0xFF).unwrap();
        store.fill(2, 8, 8, 0x00).unwrap();
        let mut buf = [0u8; 24];
        store.read(2, 0, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0xFF; 8]);
        assert_eq!(&buf[8..16], &[0x00; 8]);
        assert_eq!(&buf[16..], &[0xFF; 8]);
    }

    #[test]
    fn test_out_of_range() {
        let store = MemoryChunkStore::new(64);
        let err = store.write(0, 60, b"12345").unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { offset: 60, len: 5, .. }));
        assert!(store.fill(0, u64::MAX, 2, 0).is_err());
    }

    #[test]
    fn test_static_resolver() {
        let a: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new(64));
        let b: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new(128));

        let resolver = StaticResolver::new();
        assert!(resolver.resolve(1).is_none());
        resolver.route(1, a.clone());
        assert_eq!(resolver.resolve(1).unwrap().chunk_size(), 64);

        let resolver = StaticResolver::with_fallback(b);
        resolver.route(1, a);
        assert_eq!(resolver.resolve(1).unwrap().chunk_size(), 64);
        assert_eq!(resolver.resolve(2).unwrap().chunk_size(), 128);
    }
}
