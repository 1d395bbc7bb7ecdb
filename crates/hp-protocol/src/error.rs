//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing or decoding the appliance protocol
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A line grew past the framing limit without a terminator
    #[error("Line too long: {size} bytes exceeds maximum of {max} bytes")]
    LineTooLong { size: usize, max: usize },

    /// Heartbeat frame without the `pm` prefix
    #[error("Not a heartbeat frame: {0:?}")]
    NotHeartbeat(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
