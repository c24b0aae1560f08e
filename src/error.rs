//! Error types for guest-bridge

use thiserror::Error;

use crate::pipe::PipeError;

/// Result type alias using guest-bridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in guest-bridge operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Guest memory access errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// Save-state encode/decode errors
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Tunnel transport selection or target errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Recoverable guest pipe errors
    #[error("Pipe error: {0}")]
    Pipe(#[from] PipeError),

    /// Fatal guest protocol violations
    #[error("Fatal guest protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Binary save-state container errors
    #[error("Save-state encoding error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Guest requests whose preconditions are violated.
///
/// These are never recovered from: the caller must abort processing of the
/// access that produced them, since continuing would run on inconsistent
/// device state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Guest asked to drain more bytes than the receive queue holds
    #[error("reading more data than available: requested {requested}, buffered {available}")]
    DrainOverrun { requested: u32, available: u32 },

    /// Read of an offset that has no readable register
    #[error("bad read offset {0:#x}")]
    BadReadOffset(u64),

    /// Write to an offset that has no writable register
    #[error("bad write offset {0:#x}")]
    BadWriteOffset(u64),

    /// Unknown value written to the command register
    #[error("bad command {0:#x}")]
    BadCommand(u64),

    /// More device instances requested than the board allows
    #[error("maximum number of stream bridge devices ({max}) reached")]
    TooManyInstances { max: u32 },
}

impl Error {
    /// True when the error is a fatal guest protocol violation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}
