//! Transport abstraction for JSON-RPC clients
//!
//! This crate provides a transport-agnostic interface for carrying JSON-RPC
//! text frames over a single full-duplex connection. Specific transport
//! implementations (WebSocket, in-memory) are provided in separate crates.
//!
//! A transport hands back a [`Connection`] split into two halves:
//! - a [`FrameSink`] shared by every caller that writes frames
//! - an [`IncomingFrames`] stream owned by whoever consumes inbound frames
//!
//! A remote disconnect is reported on the inbound stream, never to writers:
//! the stream yields at most one final `Err` and then ends.

pub mod error;

use async_trait::async_trait;
use futures::Stream;
use std::fmt::Debug;
use std::pin::Pin;

pub use error::TransportError;

/// Stream of inbound text frames.
///
/// Ends (`None`) when the connection is gone. A read failure is yielded as a
/// single `Err` item right before the end of the stream.
pub type IncomingFrames = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open connection, split into its write and read halves.
pub struct Connection {
    /// Endpoint this connection was opened against.
    pub endpoint: String,
    /// Write half.
    pub sink: Box<dyn FrameSink>,
    /// Read half.
    pub incoming: IncomingFrames,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Debug + Send + Sync + 'static {
    /// Send a single text frame.
    ///
    /// Fails with [`TransportError::ConnectionClosed`] once the sink has been
    /// closed.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Close the connection.
    ///
    /// Idempotent: closing an already closed sink succeeds.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether [`close`](Self::close) has been called or the peer is known
    /// to be gone.
    fn is_closed(&self) -> bool;
}

/// A way of opening connections to one remote endpoint.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Open a new connection to the endpoint.
    async fn open(&self) -> Result<Connection, TransportError>;

    /// Human readable endpoint description, used for logging.
    fn endpoint(&self) -> String;
}
