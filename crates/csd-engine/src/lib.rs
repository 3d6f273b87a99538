//! RDMA work-request engine for a chunk storage device.
//!
//! The engine accepts 64-byte commands over a connection, moves bulk data
//! between registered memory and chunk storage with one-sided RDMA, and
//! answers with 64-byte responses. It is driven entirely by transport
//! completions: a messenger attached to a connection advances one
//! [`WorkRequest`] per completion and never blocks.
//!
//! - [`memory`]: registered slabs carved by buddy allocators into
//!   [`RegisteredBuffer`]s, plus the key registry that validates remote access.
//! - [`request`]: work requests, their pool and their lifecycle states.
//! - [`transport`]: the [`ConnectionSession`] / [`CompletionHandler`] seam and
//!   an in-process loopback fabric.
//! - [`service`]: the [`CommandServiceTable`] and the chunk I/O services.
//! - [`messenger`]: [`ServerMessenger`], [`ClientMessenger`] and the shared
//!   [`EngineContext`].
//! - [`storage`]: chunk device, placement and observer contracts.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod memory;
pub mod messenger;
pub mod request;
pub mod service;
pub mod stats;
pub mod storage;
pub mod transport;

pub use config::{
    EngineConfig, MemoryConfig, PoolConfig, ProtocolConfig, QueueConfig, QueueWaitStrategy,
    TransportConfig,
};
pub use error::{EngineError, EngineResult};
pub use memory::{MemoryRegistry, RegisteredBuffer, RegisteredMemoryAllocator};
pub use messenger::{ClientMessenger, EngineContext, ResponseCallback, ServerMessenger};
pub use request::{Flow, RequestStatus, WorkRequest, WorkRequestPool};
pub use service::{CommandService, CommandServiceTable, register_chunk_services};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use storage::{
    ChunkIoEvent, ChunkStore, DeviceResolver, IoObserver, MemoryChunkStore, StaticResolver,
    StorageError,
};
pub use transport::{
    CompletionHandler, CompletionStatus, ConnectionSession, LoopbackConnection, LoopbackFabric,
    Opcode, PostError, WorkCompletion,
};
