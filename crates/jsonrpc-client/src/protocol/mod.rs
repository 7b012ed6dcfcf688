//! Protocol layer for the JSON-RPC client.
//!
//! This module contains:
//! - Message types (ids, responses, notifications)
//! - The text codec between envelopes and wire frames

pub mod codec;
pub mod message;

pub use message::{Id, IdGenerator, Incoming, Notification, Response};

/// Protocol version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved method used by `auth`.
pub const LOGIN_METHOD: &str = "rpc.login";

/// Reserved method used by `subscribe`.
pub const SUBSCRIBE_METHOD: &str = "rpc.on";

/// Reserved method used by `unsubscribe`.
pub const UNSUBSCRIBE_METHOD: &str = "rpc.off";
