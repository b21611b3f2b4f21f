//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Message could not be parsed as JSON.
    ///
    /// Only poisons a single line; the codec yields it inline so the
    /// connection stays usable.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Message exceeds the maximum allowed size
    #[error("Message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
