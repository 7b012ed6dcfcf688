//! Error types for transports.

use thiserror::Error;

/// Errors raised by a transport while opening, writing to, or reading from a
/// connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint address could not be used.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error on an open connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}
