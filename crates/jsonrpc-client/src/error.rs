//! Error types for the JSON-RPC client.

use crate::protocol::Id;
use crate::state::ConnectionState;
use proven_jsonrpc_transport::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport could not open a connection.
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        /// The endpoint we tried to reach.
        endpoint: String,
        /// The underlying transport error.
        #[source]
        source: TransportError,
    },

    /// Writing a frame to an open connection failed.
    #[error("Failed to send frame: {0}")]
    Send(#[source] TransportError),

    /// The connection is gone; every pending call receives this.
    #[error("Connection closed: {0}")]
    ConnectionClosed(CloseReason),

    /// The endpoint answered the call with an error object.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// No response arrived before the deadline.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// `call` or `notify` was used before `connect`.
    #[error("Client is not connected")]
    NotConnected,

    /// The operation is not allowed in the current connection state.
    #[error("Operation not permitted while {0}")]
    InvalidState(ConnectionState),

    /// A correlation id was registered twice while still pending.
    #[error("Correlation id {0} is already pending")]
    DuplicateId(Id),

    /// Encoding params or decoding a result failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Params must be positional (array), keyed (object) or absent.
    #[error("Invalid params: expected an array, an object or nothing, got {0}")]
    InvalidParams(&'static str),

    /// An inbound frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// An inbound frame is valid JSON-RPC this client does not handle.
    #[error("Unsupported message: {0}")]
    Unsupported(String),

    /// A result did not deserialize into the requested type.
    #[error("Failed to deserialize result: {0}")]
    InvalidResult(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    /// `close` was called.
    #[error("closed by client")]
    ClientClosed,

    /// The connection never opened.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The remote endpoint closed the connection.
    #[error("closed by peer")]
    PeerClosed,

    /// The transport failed while reading.
    #[error("transport error: {0}")]
    TransportError(String),
}

/// Standard JSON-RPC 2.0 error codes, plus the ones the login/subscription
/// endpoints use.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The request object is not valid.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Params were required but missing.
    pub const PARAMS_NOT_FOUND: i64 = -32604;
    /// The caller lacks the scope for the method.
    pub const METHOD_FORBIDDEN: i64 = -32605;
}

/// Error object returned by the remote endpoint for one call.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct RemoteError {
    /// Error code.
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Optional additional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    /// Interpret an `error` member.
    ///
    /// Anything that is not a `{code, message}` object is kept verbatim in
    /// `data` under an internal-error code.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(error) => error,
            Err(_) => Self {
                code: codes::INTERNAL_ERROR,
                message: "Internal error".to_string(),
                data: Some(value),
            },
        }
    }
}
