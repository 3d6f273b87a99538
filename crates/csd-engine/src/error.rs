//! Engine error types

use std::io;

use csd_proto::{ProtoError, ReturnCode};
use thiserror::Error;

use crate::storage::StorageError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error types
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Zero-sized or otherwise unusable buffer/payload size
    #[error("Invalid size: {0} bytes")]
    InvalidSize(usize),

    /// Request above the largest buffer size class
    #[error("Size {size} exceeds maximum block size {max}")]
    TooLarge {
        /// Requested bytes
        size: usize,
        /// Largest size class
        max: usize,
    },

    /// Registered memory exhausted after the configured expansion retries
    #[error("Out of registered memory for {size} bytes")]
    OutOfMemory {
        /// Requested bytes
        size: usize,
    },

    /// Wire format error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote key or range not registered
    #[error("Remote access denied: key={key:#x}, addr={addr:#x}, len={len}")]
    RemoteAccess {
        /// Remote key presented
        key: u32,
        /// Start address
        addr: u64,
        /// Length in bytes
        len: usize,
    },

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No handler registered for the command
    #[error("No service for class={class:#04x}, sequence={sequence:#04x}")]
    MissingService {
        /// Command class
        class: u8,
        /// Command sequence
        sequence: u8,
    },

    /// Too many commands awaiting a response
    #[error("Outstanding command limit reached ({0})")]
    QueueFull(usize),

    /// Connection closed
    #[error("Disconnected: {0}")]
    Disconnected(String),
}

impl EngineError {
    /// Wire status reported to a peer for this error
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::InvalidSize(_) | Self::Protocol(_) => ReturnCode::InvalidArgument,
            Self::TooLarge { .. } => ReturnCode::TooLarge,
            Self::OutOfMemory { .. } => ReturnCode::NoMemory,
            Self::Storage(StorageError::OutOfRange { .. }) => ReturnCode::InvalidArgument,
            Self::Storage(_) => ReturnCode::StorageError,
            Self::MissingService { .. } => ReturnCode::Unsupported,
            Self::Transport(_)
            | Self::RemoteAccess { .. }
            | Self::Disconnected(_)
            | Self::QueueFull(_) => ReturnCode::TransportError,
            Self::Io(_) | Self::Config(_) => ReturnCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_code_mapping() {
        assert_eq!(
            EngineError::OutOfMemory { size: 10 }.return_code(),
            ReturnCode::NoMemory
        );
        assert_eq!(
            EngineError::TooLarge { size: 10, max: 4 }.return_code(),
            ReturnCode::TooLarge
        );
        assert_eq!(
            EngineError::Storage(StorageError::OutOfRange {
                chunk_id: 1,
                offset: 0,
                len: 1
            })
            .return_code(),
            ReturnCode::InvalidArgument
        );
        assert_eq!(
            EngineError::Storage(StorageError::Device("gone".into())).return_code(),
            ReturnCode::StorageError
        );
        assert_eq!(
            EngineError::MissingService {
                class: 0x10,
                sequence: 1
            }
            .return_code(),
            ReturnCode::Unsupported
        );
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: EngineError = ProtoError::UnknownChunkOp(9).into();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert_eq!(err.to_string(), "Protocol error: Unknown chunk operation: sequence=0x09");
    }
}
