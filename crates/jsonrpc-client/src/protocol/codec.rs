//! JSON text codec for JSON-RPC 2.0 envelopes.
//!
//! Pure functions, no I/O. Values pass through `serde_json::Value` untouched,
//! so numbers and strings keep the exact type the caller supplied.

use super::JSONRPC_VERSION;
use super::message::{Id, Incoming, Notification, OutgoingEnvelope, Response};
use crate::error::{CodecError, RemoteError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Encode a call envelope for `id`.
///
/// # Errors
///
/// Returns an error if the params do not serialize to an array, an object or
/// nothing.
pub fn encode_call<P: Serialize>(id: &Id, method: &str, params: P) -> Result<String, CodecError> {
    encode(Some(id), method, params)
}

/// Encode a notification envelope (no id).
///
/// # Errors
///
/// Returns an error if the params do not serialize to an array, an object or
/// nothing.
pub fn encode_notification<P: Serialize>(method: &str, params: P) -> Result<String, CodecError> {
    encode(None, method, params)
}

fn encode<P: Serialize>(id: Option<&Id>, method: &str, params: P) -> Result<String, CodecError> {
    let envelope = OutgoingEnvelope {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params: params_value(params)?,
    };

    Ok(serde_json::to_string(&envelope)?)
}

/// Positional params become an array, keyed params an object, and `()` or
/// `None` omit the member entirely.
fn params_value<P: Serialize>(params: P) -> Result<Option<Value>, CodecError> {
    match serde_json::to_value(params)? {
        Value::Null => Ok(None),
        value @ (Value::Array(_) | Value::Object(_)) => Ok(Some(value)),
        Value::Bool(_) => Err(CodecError::InvalidParams("a boolean")),
        Value::Number(_) => Err(CodecError::InvalidParams("a number")),
        Value::String(_) => Err(CodecError::InvalidParams("a string")),
    }
}

/// Any inbound object; members that may legitimately be `null` are kept as
/// `Some(Value::Null)` to tell them apart from absent ones.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    notification: Option<String>,
    #[serde(default, deserialize_with = "present")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    error: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Decode an inbound text frame.
///
/// # Errors
///
/// Returns [`CodecError::MalformedFrame`] for anything that is not a single
/// JSON-RPC response or notification, and [`CodecError::Unsupported`] for
/// server-to-client requests.
pub fn decode(text: &str) -> Result<Incoming, CodecError> {
    let raw: RawMessage =
        serde_json::from_str(text).map_err(|e| CodecError::MalformedFrame(e.to_string()))?;

    if let Some(version) = &raw.jsonrpc {
        if version != JSONRPC_VERSION {
            return Err(CodecError::MalformedFrame(format!(
                "unsupported jsonrpc version {version:?}"
            )));
        }
    }

    match (raw.result, raw.error) {
        (Some(_), Some(_)) => Err(CodecError::MalformedFrame(
            "response carries both result and error".to_string(),
        )),
        (Some(result), None) => {
            let id = response_id(raw.id, || "result".to_string())?;
            Ok(Incoming::Response(Response {
                id,
                outcome: Ok(result),
            }))
        }
        (None, Some(error)) => {
            let error = RemoteError::from_value(error);
            let id = response_id(raw.id, || format!("error {error}"))?;
            Ok(Incoming::Response(Response {
                id,
                outcome: Err(error),
            }))
        }
        (None, None) => {
            let name = raw.method.or(raw.notification).ok_or_else(|| {
                CodecError::MalformedFrame("neither a response nor a notification".to_string())
            })?;

            match raw.id {
                None | Some(Value::Null) => Ok(Incoming::Notification(Notification {
                    method: name,
                    params: raw.params.unwrap_or(Value::Null),
                })),
                Some(id) => Err(CodecError::Unsupported(format!(
                    "server request {name:?} with id {id}"
                ))),
            }
        }
    }
}

fn response_id(id: Option<Value>, describe: impl FnOnce() -> String) -> Result<Id, CodecError> {
    match id {
        None | Some(Value::Null) => Err(CodecError::MalformedFrame(format!(
            "response without id ({})",
            describe()
        ))),
        Some(value) => Id::try_from(value),
    }
}
