//! Wire format errors

use thiserror::Error;

/// Result type for wire format operations
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors raised while encoding or decoding commands and responses
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Input buffer shorter than the structure being decoded
    #[error("Short buffer: need {needed} bytes, have {available}")]
    ShortBuffer {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Header length field cannot describe the message
    #[error("Invalid length field: {0} cache lines")]
    InvalidLength(u16),

    /// Payload does not fit the 16-bit cache-line length field
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Chunk class with a sequence outside READ/WRITE/SET/RESET
    #[error("Unknown chunk operation: sequence={0:#04x}")]
    UnknownChunkOp(u8),

    /// Return code not defined by this protocol version
    #[error("Unknown return code: {0:#06x}")]
    UnknownReturnCode(u16),
}
