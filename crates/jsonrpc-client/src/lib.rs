//! JSON-RPC 2.0 client over a persistent message transport.
//!
//! One connection carries any number of concurrent calls. Each call gets a
//! fresh numeric id and is parked in a registry until the matching response
//! arrives, its deadline passes, or the connection closes. Every call
//! completes exactly once.
//!
//! # Features
//!
//! - **Calls**: typed request/response with per-call timeouts
//! - **Notifications**: fire-and-forget messages
//! - **Subscriptions**: `rpc.on`/`rpc.off` events delivered as streams
//! - **Pluggable Transports**: WebSocket out of the box, in-memory for tests
//!
//! # Example
//!
//! ```no_run
//! use proven_jsonrpc_client::RpcClient;
//! use serde_json::json;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RpcClient::builder()
//!         .url("ws://127.0.0.1:8080")
//!         .build()?;
//!
//!     client.connect().await?;
//!
//!     let ok: bool = client.auth(json!({ "username": "user" })).await?;
//!     let sum: i64 = client.call("sum", [1, 2]).await?;
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod state;
pub mod subscriptions;

// Re-export commonly used types
pub use client::{CallOptions, ClientBuilder, ClientConfig, RpcClient};
pub use error::{CloseReason, CodecError, Error, RemoteError, Result, codes};
pub use pending::PendingCalls;
pub use protocol::{Id, Notification, codec};
pub use state::{AnomalyCounters, ConnectionState};
pub use subscriptions::Subscription;

// Re-export dependencies that are part of our public API
pub use proven_jsonrpc_transport::{Connection, FrameSink, Transport, TransportError};
pub use proven_jsonrpc_transport_ws::WebSocketTransport;
