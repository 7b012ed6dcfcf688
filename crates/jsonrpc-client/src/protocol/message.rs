//! JSON-RPC message types.

use crate::error::{CodecError, RemoteError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation id linking a call to its response.
///
/// Outgoing calls always use numbers; responses may echo either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    /// Numeric id.
    Number(u64),
    /// String id.
    String(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl TryFrom<Value> for Id {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(Self::Number)
                .ok_or_else(|| CodecError::MalformedFrame(format!("unsupported id {n}"))),
            Value::String(s) => Ok(Self::String(s)),
            other => Err(CodecError::MalformedFrame(format!(
                "unsupported id {other}"
            ))),
        }
    }
}

/// Per-connection id source. The first id handed out is `1`.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator starting at `1`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Hand out the next id.
    pub fn next_id(&self) -> Id {
        Id::Number(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Outgoing call or notification.
///
/// A call carries an id, a notification omits it.
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingEnvelope<'a> {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a Id>,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Response to one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the call this answers.
    pub id: Id,
    /// `result` on success, `error` otherwise.
    pub outcome: Result<Value, RemoteError>,
}

/// Event pushed by the endpoint without an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Event name.
    pub method: String,
    /// Event payload, `null` when absent.
    pub params: Value,
}

impl Notification {
    /// Deserialize the params into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns an error if the params do not match `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| CodecError::InvalidResult(e.to_string()))
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to a pending call.
    Response(Response),
    /// Server-initiated notification.
    Notification(Notification),
}
