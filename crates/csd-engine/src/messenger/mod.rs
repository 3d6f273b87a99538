//! Client and server messengers, and the context they share.
//!
//! A messenger is the [`CompletionHandler`](crate::transport::CompletionHandler)
//! attached to a connection. Every completion it receives moves one work
//! request forward; nothing in here blocks or waits.

mod client;
mod server;

use std::sync::Arc;

use tracing::info;

pub use client::{ClientMessenger, ResponseCallback};
pub use server::ServerMessenger;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::memory::{MemoryRegistry, RegisteredMemoryAllocator};
use crate::request::WorkRequestPool;
use crate::service::{CommandServiceTable, register_chunk_services};
use crate::stats::EngineStats;
use crate::storage::{DeviceResolver, IoObserver, NoopObserver, StaticResolver};

/// Everything a messenger and its services need, built once at startup
pub struct EngineContext {
    config: EngineConfig,
    allocator: Arc<RegisteredMemoryAllocator>,
    pool: WorkRequestPool,
    services: CommandServiceTable,
    resolver: Arc<dyn DeviceResolver>,
    observer: Arc<dyn IoObserver>,
    stats: EngineStats,
}

impl EngineContext {
    /// Validate `config`, register the first slab with `registry` and
    /// pre-create the initial work requests. The service table starts with
    /// the chunk services; chunks resolve nowhere until a resolver is set.
    pub fn new(config: EngineConfig, registry: Arc<MemoryRegistry>) -> EngineResult<Self> {
        config.validate()?;

        let allocator = Arc::new(RegisteredMemoryAllocator::new(
            config.memory.clone(),
            registry,
        )?);
        let pool = WorkRequestPool::new(
            allocator.clone(),
            config.protocol.header_buffer_size()?,
            config.pool.expand_batch,
        );
        pool.expand(config.pool.initial_requests)?;

        let services = CommandServiceTable::new();
        register_chunk_services(&services);

        info!(
            "Engine context ready: {} work requests, {} bytes registered",
            config.pool.initial_requests,
            allocator.get_mem_reged()
        );

        Ok(Self {
            config,
            allocator,
            pool,
            services,
            resolver: Arc::new(StaticResolver::new()),
            observer: Arc::new(NoopObserver),
            stats: EngineStats::default(),
        })
    }

    /// Use `resolver` to place chunks on devices
    pub fn with_resolver(mut self, resolver: Arc<dyn DeviceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Report chunk activity to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn IoObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registered memory allocator
    pub fn allocator(&self) -> &Arc<RegisteredMemoryAllocator> {
        &self.allocator
    }

    /// Work request pool
    pub fn pool(&self) -> &WorkRequestPool {
        &self.pool
    }

    /// Command service table
    pub fn services(&self) -> &CommandServiceTable {
        &self.services
    }

    /// Chunk placement
    pub fn resolver(&self) -> &Arc<dyn DeviceResolver> {
        &self.resolver
    }

    /// Chunk activity observer
    pub fn observer(&self) -> &Arc<dyn IoObserver> {
        &self.observer
    }

    /// Live counters
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("allocator", &self.allocator)
            .field("pool", &self.pool)
            .field("services", &self.services)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, PoolConfig};
    use crate::error::EngineError;

    #[test]
    fn test_context_pre_creates_requests() {
        let config = EngineConfig {
            memory: MemoryConfig {
                slab_size: 1024 * 1024,
                max_block: 256 * 1024,
                ..MemoryConfig::default()
            },
            pool: PoolConfig {
                initial_requests: 8,
                expand_batch: 2,
            },
            ..EngineConfig::default()
        };
        let ctx = EngineContext::new(config, Arc::new(MemoryRegistry::new())).unwrap();
        assert_eq!(ctx.pool().stats().idle, 8);
        assert_eq!(ctx.services().len(), 4);
        assert!(ctx.allocator().get_mem_used() >= 8 * 4160);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.memory.expand_retries = 0;
        assert!(matches!(
            EngineContext::new(config, Arc::new(MemoryRegistry::new())),
            Err(EngineError::Config(_))
        ));
    }
}
