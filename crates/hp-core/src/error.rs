//! Core error types for hargproxy

use hp_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type using [`RelayError`]
pub type Result<T> = std::result::Result<T, RelayError>;

/// Top-level error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Bus error
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Socket-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Interface name or address could not be used
    #[error("Invalid interface: {0}")]
    InvalidInterface(String),

    /// Binding a socket failed
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to a peer failed
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket option could not be applied
    #[error("Socket option {option} failed: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Message bus errors
#[derive(Error, Debug)]
pub enum BusError {
    /// The subscription was released before the call
    #[error("Subscription {0} is closed")]
    Closed(String),

    /// Shutdown was requested while waiting
    #[error("Shutdown requested")]
    ShutdownRequested,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Reading or writing the file failed
    #[error("Config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
