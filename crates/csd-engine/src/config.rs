//! Engine configuration
//!
//! Loaded from TOML; every section falls back to its defaults when absent.
//!
//! ```toml
//! [memory]
//! slab_size = 16777216
//! max_slabs = 8
//!
//! [protocol]
//! inline_threshold = 4096
//!
//! [queue]
//! max_spins = 128
//! strategy = "yield"
//! ```

use std::path::Path;

use csd_proto::{COMMAND_SIZE, cache_line_units, units_to_bytes};
use csd_queue::{SpinPolicy, WaitStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Main engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Registered memory slabs
    pub memory: MemoryConfig,
    /// Work request pool
    pub pool: PoolConfig,
    /// Wire protocol
    pub protocol: ProtocolConfig,
    /// Transport queues
    pub transport: TransportConfig,
    /// Spin/yield behaviour of the lock-free queues
    pub queue: QueueConfig,
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> EngineResult<()> {
        let m = &self.memory;
        for (name, value) in [
            ("memory.slab_size", m.slab_size),
            ("memory.min_block", m.min_block),
            ("memory.max_block", m.max_block),
        ] {
            if !value.is_power_of_two() {
                return Err(EngineError::Config(format!(
                    "{name} must be a power of two, got {value}"
                )));
            }
        }
        if m.min_block > m.max_block {
            return Err(EngineError::Config(format!(
                "memory.min_block ({}) exceeds memory.max_block ({})",
                m.min_block, m.max_block
            )));
        }
        if m.max_block > m.slab_size {
            return Err(EngineError::Config(format!(
                "memory.max_block ({}) exceeds memory.slab_size ({})",
                m.max_block, m.slab_size
            )));
        }
        if m.expand_retries == 0 {
            return Err(EngineError::Config(
                "memory.expand_retries must be at least 1".to_string(),
            ));
        }
        if m.max_slabs == 0 {
            return Err(EngineError::Config(
                "memory.max_slabs must be at least 1".to_string(),
            ));
        }

        let header = self.protocol.header_buffer_size()?;
        if header > m.max_block {
            return Err(EngineError::Config(format!(
                "header buffer ({header} bytes) exceeds memory.max_block ({})",
                m.max_block
            )));
        }

        for (name, value) in [
            ("pool.expand_batch", self.pool.expand_batch),
            ("transport.recv_depth", self.transport.recv_depth),
            (
                "transport.completion_queue_depth",
                self.transport.completion_queue_depth,
            ),
            ("transport.max_outstanding", self.transport.max_outstanding),
            ("transport.poll_batch", self.transport.poll_batch),
        ] {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }
}

/// Registered memory configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Bytes per registered slab
    pub slab_size: usize,
    /// Smallest buddy block
    pub min_block: usize,
    /// Largest buddy block; larger allocations are rejected
    pub max_block: usize,
    /// Upper bound on registered slabs
    pub max_slabs: usize,
    /// Slab expansions attempted by one allocation before giving up
    pub expand_retries: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            slab_size: 16 * 1024 * 1024,
            min_block: 256,
            max_block: 4 * 1024 * 1024,
            max_slabs: 16,
            expand_retries: 3,
        }
    }
}

/// Work request pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Requests created up front
    pub initial_requests: usize,
    /// Requests created per expansion when the free list runs dry
    pub expand_batch: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_requests: 32,
            expand_batch: 8,
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest write payload carried inline after the command
    pub inline_threshold: usize,
}

impl ProtocolConfig {
    /// Size of the per-request header buffer: one command plus the largest
    /// inline payload, rounded to whole cache lines
    pub fn header_buffer_size(&self) -> EngineResult<usize> {
        let units = cache_line_units(COMMAND_SIZE + self.inline_threshold).map_err(|_| {
            EngineError::Config(format!(
                "protocol.inline_threshold ({}) does not fit the length field",
                self.inline_threshold
            ))
        })?;
        Ok(units_to_bytes(units))
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 4096,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Receives a server keeps posted per connection
    pub recv_depth: usize,
    /// Completion queue slots per connection
    pub completion_queue_depth: usize,
    /// Commands a client may have awaiting a response
    pub max_outstanding: usize,
    /// Completions delivered per poll call
    pub poll_batch: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_depth: 16,
            completion_queue_depth: 256,
            max_outstanding: 128,
            poll_batch: 32,
        }
    }
}

/// Wait strategy as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueWaitStrategy {
    /// Busy-spin
    Spin,
    /// Spin, then yield
    Yield,
    /// Fail immediately
    Fail,
}

impl From<QueueWaitStrategy> for WaitStrategy {
    fn from(strategy: QueueWaitStrategy) -> Self {
        match strategy {
            QueueWaitStrategy::Spin => WaitStrategy::Spin,
            QueueWaitStrategy::Yield => WaitStrategy::Yield,
            QueueWaitStrategy::Fail => WaitStrategy::Fail,
        }
    }
}

/// Lock-free queue wait policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Busy iterations before yielding
    pub max_spins: u32,
    /// What to do once the budget is spent
    pub strategy: QueueWaitStrategy,
}

impl QueueConfig {
    /// Policy handed to the queue primitives
    pub fn spin_policy(&self) -> SpinPolicy {
        SpinPolicy::new(self.max_spins, self.strategy.into())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_spins: SpinPolicy::DEFAULT_MAX_SPINS,
            strategy: QueueWaitStrategy::Yield,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.protocol.inline_threshold, 4096);
        assert_eq!(config.memory.expand_retries, 3);
        assert_eq!(config.protocol.header_buffer_size().unwrap(), 4160);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [memory]
            max_slabs = 2

            [queue]
            strategy = "fail"
            "#,
        )
        .unwrap();
        assert_eq!(config.memory.max_slabs, 2);
        assert_eq!(config.memory.slab_size, MemoryConfig::default().slab_size);
        assert_eq!(config.queue.spin_policy(), SpinPolicy::new(64, WaitStrategy::Fail));
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_rejects_inconsistent_blocks() {
        let mut config = EngineConfig::default();
        config.memory.min_block = 8192;
        config.memory.max_block = 4096;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let mut config = EngineConfig::default();
        config.memory.slab_size = 3 * 1024 * 1024;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let mut config = EngineConfig::default();
        config.memory.max_block = config.memory.slab_size * 2;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_oversized_inline_threshold() {
        let mut config = EngineConfig::default();
        config.protocol.inline_threshold = csd_proto::MAX_MESSAGE_SIZE;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_depths() {
        let mut config = EngineConfig::default();
        config.transport.recv_depth = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let mut config = EngineConfig::default();
        config.memory.expand_retries = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_from_file_round_trip() {
        let mut config = EngineConfig::default();
        config.transport.recv_depth = 4;
        config.queue.strategy = QueueWaitStrategy::Spin;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_from_file_missing() {
        let err = EngineConfig::from_file("/nonexistent/csd-engine.toml").unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
