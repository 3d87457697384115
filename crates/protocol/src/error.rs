//! Protocol error types

use thiserror::Error;

/// Frame protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Length field declares fewer bytes than the header itself
    #[error("Frame length field {declared} is smaller than the {min}-byte header")]
    LengthTooSmall { declared: u32, min: u32 },

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Neither byte order yields a plausible frame length
    #[error("Cannot detect frame header byte order from {header:02x?}")]
    UndetectableByteOrder { header: [u8; 4] },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error means the byte stream itself is corrupt.
    ///
    /// Corruption is terminal: the stream is never resynchronised.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ProtocolError::LengthTooSmall { .. }
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::UndetectableByteOrder { .. }
        )
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
