//! Error types for TelemXnet.

use thiserror::Error;

use crate::transport::FrameError;

#[cfg(feature = "client")]
use crate::client::ClientError;
#[cfg(feature = "server")]
use crate::server::ServerError;

/// Errors constructing protocol identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// Network id is not exactly 32 bytes.
    #[error("network id must be 32 bytes, got {0}")]
    NetworkIdLength(usize),

    /// Device id outside `[-64, 64]`.
    #[error("device id {0} outside [-64, 64]")]
    DeviceIdOutOfRange(i8),

    /// Device slot does not fit a signed byte.
    #[error("device slot {0} out of range")]
    SlotOutOfRange(u8),
}

/// Top-level TelemXnet errors.
#[derive(Debug, Error)]
pub enum TelemxError {
    /// Identifier error.
    #[error("identifier error: {0}")]
    Identifier(#[from] IdentifierError),

    /// Frame error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Relay server error.
    #[cfg(feature = "server")]
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// Client multiplexer error.
    #[cfg(feature = "client")]
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using [`TelemxError`].
pub type Result<T> = std::result::Result<T, TelemxError>;
