//! RPC client implementation.

use crate::error::{CloseReason, CodecError, Error, Result};
use crate::pending::{PendingCalls, PendingGuard};
use crate::protocol::{
    IdGenerator, Incoming, LOGIN_METHOD, Response, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD, codec,
};
use crate::state::{AnomalyCounters, ConnectionState};
use crate::subscriptions::{Subscription, Subscriptions};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use proven_jsonrpc_transport::{Connection, FrameSink, IncomingFrames, Transport, TransportError};
use proven_jsonrpc_transport_ws::WebSocketTransport;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default deadline for a call; `None` waits until the connection closes.
    pub call_timeout: Option<Duration>,
    /// Deadline for opening the transport.
    pub connect_timeout: Duration,
    /// Method invoked by `auth`.
    pub login_method: String,
    /// Method invoked by `subscribe`.
    pub subscribe_method: String,
    /// Method invoked by `unsubscribe`.
    pub unsubscribe_method: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            login_method: LOGIN_METHOD.to_string(),
            subscribe_method: SUBSCRIBE_METHOD.to_string(),
            unsubscribe_method: UNSUBSCRIBE_METHOD.to_string(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Overrides the configured call timeout when set.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Options with a specific deadline.
    #[must_use]
    pub const fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Builder for creating RPC clients.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    url: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect over WebSocket to `url` (`ws://` or `wss://`).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Use a custom transport. Takes precedence over [`url`](Self::url).
    #[must_use]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default call timeout.
    #[must_use]
    pub const fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Let calls wait until answered or until the connection closes.
    #[must_use]
    pub const fn no_call_timeout(mut self) -> Self {
        self.config.call_timeout = None;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Build the RPC client. Nothing is opened until
    /// [`RpcClient::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if no endpoint was given or the URL is not a
    /// valid WebSocket URL.
    pub fn build(self) -> Result<RpcClient> {
        let transport: Arc<dyn Transport> = match (self.transport, self.url) {
            (Some(transport), _) => transport,
            (None, Some(url)) => {
                let transport =
                    WebSocketTransport::new(&url).map_err(|source| Error::Connect {
                        endpoint: url.clone(),
                        source,
                    })?;
                Arc::new(transport)
            }
            (None, None) => {
                return Err(Error::Connect {
                    endpoint: String::new(),
                    source: TransportError::InvalidAddress("endpoint not specified".to_string()),
                });
            }
        };

        Ok(RpcClient::with_transport(transport, self.config))
    }
}

/// JSON-RPC client over one persistent connection.
///
/// Cheap to clone; clones share the connection. Any number of tasks may
/// issue calls concurrently, and responses are matched to callers by id in
/// whatever order they arrive.
#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    ids: IdGenerator,
    pending: PendingCalls,
    subscriptions: Subscriptions,
    anomalies: AnomalyCounters,
    state: watch::Sender<ConnectionState>,
    sink: RwLock<Option<Arc<dyn FrameSink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create an unconnected client on top of an explicit transport.
    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unconnected);

        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                ids: IdGenerator::new(),
                pending: PendingCalls::new(),
                subscriptions: Subscriptions::default(),
                anomalies: AnomalyCounters::default(),
                state,
                sink: RwLock::new(None),
                reader: Mutex::new(None),
            }),
        }
    }

    /// Open the connection and start consuming inbound frames in the
    /// background.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the client is unconnected
    /// - [`Error::Connect`] if the transport cannot open; the client is then
    ///   closed
    /// - [`Error::ConnectionClosed`] if `close` won the race with `connect`
    #[instrument(skip(self), fields(endpoint = %self.inner.transport.endpoint()))]
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;

        inner
            .transition(&[ConnectionState::Unconnected], ConnectionState::Connecting)
            .map_err(Error::InvalidState)?;

        let limit = inner.config.connect_timeout;
        let opened = match timeout(limit, inner.transport.open()).await {
            Ok(opened) => opened,
            Err(_) => Err(TransportError::ConnectionFailed(format!(
                "timed out after {limit:?}"
            ))),
        };

        let Connection {
            endpoint,
            sink,
            incoming,
        } = match opened {
            Ok(connection) => connection,
            Err(source) => {
                let endpoint = inner.transport.endpoint();
                warn!("Failed to connect to {}: {}", endpoint, source);

                inner
                    .pending
                    .drain_all(CloseReason::ConnectFailed(source.to_string()));
                inner.state.send_replace(ConnectionState::Closed);

                return Err(Error::Connect { endpoint, source });
            }
        };

        let sink: Arc<dyn FrameSink> = Arc::from(sink);
        *inner.sink.write() = Some(sink);
        *inner.reader.lock() = Some(tokio::spawn(read_loop(Arc::downgrade(inner), incoming)));

        if let Err(state) =
            inner.transition(&[ConnectionState::Connecting], ConnectionState::Connected)
        {
            debug!("Connection to {} ended while connecting ({})", endpoint, state);

            let (sink, reader) = inner.teardown(CloseReason::ClientClosed);
            release(sink, reader).await;

            return Err(Error::ConnectionClosed(inner.close_reason()));
        }

        info!("Connected to {}", endpoint);

        Ok(())
    }

    /// Call `method` and wait for its result, using the configured timeout.
    ///
    /// `params` must serialize to an array (positional), an object (keyed),
    /// or nothing (`()`).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The endpoint answers with an error object ([`Error::Remote`])
    /// - The connection closes first ([`Error::ConnectionClosed`])
    /// - The deadline elapses ([`Error::Timeout`])
    /// - The frame cannot be written ([`Error::Send`])
    /// - Params or result do not (de)serialize ([`Error::Codec`])
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_options(method, params, CallOptions::default())
            .await
    }

    /// Call `method` with custom options.
    ///
    /// If the caller stops waiting (timeout or a dropped future) the pending
    /// entry is removed, so a late response is discarded.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    #[instrument(skip(self, params, options))]
    pub async fn call_with_options<P, R>(
        &self,
        method: &str,
        params: P,
        options: CallOptions,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let inner = &self.inner;

        let sink = inner.connected_sink()?;
        let id = inner.ids.next_id();
        let frame = codec::encode_call(&id, method, params)?;

        let completion = inner.pending.register(id.clone())?;
        let _guard = PendingGuard::new(&inner.pending, id.clone());

        debug!("Sending call {} ({})", id, method);
        sink.send(frame)
            .await
            .map_err(|source| inner.send_error(source))?;

        let outcome = match options.timeout.or(inner.config.call_timeout) {
            Some(limit) => timeout(limit, completion).await.map_err(|_| {
                warn!("Call {} ({}) timed out after {:?}", id, method, limit);
                Error::Timeout(limit)
            })?,
            None => completion.await,
        };

        let result = outcome.unwrap_or_else(|_| Err(Error::ConnectionClosed(inner.close_reason())))?;

        serde_json::from_value(result)
            .map_err(|e| CodecError::InvalidResult(e.to_string()).into())
    }

    /// Send a notification. Never waits for, or expects, a reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected, the params are
    /// invalid, or the frame cannot be written.
    #[instrument(skip(self, params))]
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let inner = &self.inner;

        let sink = inner.connected_sink()?;
        let frame = codec::encode_notification(method, params)?;

        debug!("Sending notification {}", method);
        sink.send(frame)
            .await
            .map_err(|source| inner.send_error(source))
    }

    /// Authenticate with the endpoint.
    ///
    /// An ordinary call to the login method (`rpc.login` by default); what
    /// the result means is up to the endpoint.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn auth<C, R>(&self, credentials: C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.call(&self.inner.config.login_method, credentials)
            .await
    }

    /// Subscribe to an event: registers a local queue, then asks the endpoint
    /// to start sending it (`rpc.on` with `[name]`).
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn subscribe(&self, name: &str) -> Result<Subscription> {
        // Registered first so nothing sent right after the reply is missed
        let subscription = self.inner.subscriptions.add(name);

        let result: Value = self.call(&self.inner.config.subscribe_method, [name]).await?;
        debug!("Subscribed to {}: {}", name, result);

        Ok(subscription)
    }

    /// Unsubscribe from an event (`rpc.off` with `[name]`). On success every
    /// local stream for `name` ends.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn unsubscribe(&self, name: &str) -> Result<Value> {
        let result = self
            .call(&self.inner.config.unsubscribe_method, [name])
            .await?;

        let removed = self.inner.subscriptions.remove(name);
        debug!("Unsubscribed from {} ({} local streams)", name, removed);

        Ok(result)
    }

    /// Receive notifications for `name` without asking the endpoint to send
    /// them.
    #[must_use]
    pub fn notifications(&self, name: &str) -> Subscription {
        self.inner.subscriptions.add(name)
    }

    /// Close the connection.
    ///
    /// Fails every pending call with [`Error::ConnectionClosed`], then closes
    /// the transport. Idempotent, and safe before or during `connect`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Send`] if the transport fails to close cleanly; the
    /// client is closed regardless.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;

        match inner.transition(&[ConnectionState::Connected], ConnectionState::Closing) {
            Ok(_) => {}
            Err(ConnectionState::Unconnected | ConnectionState::Connecting) => {
                // A concurrent connect sees the closed state and backs out
                let (sink, reader) = inner.teardown(CloseReason::ClientClosed);
                inner.state.send_replace(ConnectionState::Closed);
                release(sink, reader).await;
                return Ok(());
            }
            Err(_) => return Ok(()),
        }

        info!("Closing connection to {}", inner.transport.endpoint());

        let (sink, reader) = inner.teardown(CloseReason::ClientClosed);
        if let Some(reader) = reader {
            reader.abort();
        }

        let result = match sink {
            Some(sink) => sink.close().await.map_err(Error::Send),
            None => Ok(()),
        };

        inner.state.send_replace(ConnectionState::Closed);
        info!("Disconnected from {}", inner.transport.endpoint());

        result
    }

    /// Wait until the connection is closed, by `close` or by the peer.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether calls can be sent.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Why the connection ended, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.pending.close_reason()
    }

    /// Number of calls waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Inbound frames dropped so far.
    #[must_use]
    pub fn anomalies(&self) -> &AnomalyCounters {
        &self.inner.anomalies
    }

    /// Endpoint description of the underlying transport.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.inner.transport.endpoint()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `to` if the current state is one of `from`. Returns the
    /// previous state, or the current one when the move is refused.
    fn transition(
        &self,
        from: &[ConnectionState],
        to: ConnectionState,
    ) -> std::result::Result<ConnectionState, ConnectionState> {
        let mut outcome = Err(to);

        self.state.send_if_modified(|state| {
            if from.contains(state) {
                outcome = Ok(*state);
                *state = to;
                true
            } else {
                outcome = Err(*state);
                false
            }
        });

        outcome
    }

    fn close_reason(&self) -> CloseReason {
        self.pending
            .close_reason()
            .unwrap_or(CloseReason::ClientClosed)
    }

    fn connected_sink(&self) -> Result<Arc<dyn FrameSink>> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Unconnected | ConnectionState::Connecting => {
                return Err(Error::NotConnected);
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(Error::ConnectionClosed(self.close_reason()));
            }
        }

        self.sink
            .read()
            .clone()
            .ok_or_else(|| Error::ConnectionClosed(self.close_reason()))
    }

    /// A write that fails because the connection is going away reports the
    /// close, not the write.
    fn send_error(&self, source: TransportError) -> Error {
        match self.pending.close_reason() {
            Some(reason) => Error::ConnectionClosed(reason),
            None => Error::Send(source),
        }
    }

    /// Fail pending calls, end subscriptions, and hand back what still needs
    /// closing.
    fn teardown(
        &self,
        reason: CloseReason,
    ) -> (Option<Arc<dyn FrameSink>>, Option<JoinHandle<()>>) {
        self.pending.drain_all(reason);
        self.subscriptions.clear();

        (self.sink.write().take(), self.reader.lock().take())
    }

    fn dispatch(&self, frame: &str) {
        match codec::decode(frame) {
            Ok(Incoming::Response(Response { id, outcome })) => {
                let matched = match outcome {
                    Ok(result) => self.pending.resolve(&id, result),
                    Err(error) => self.pending.resolve_error(&id, error),
                };

                if !matched {
                    self.anomalies.record_unmatched_response();
                }
            }
            Ok(Incoming::Notification(notification)) => {
                self.subscriptions.dispatch(&notification);
            }
            Err(CodecError::Unsupported(message)) => {
                warn!("Ignoring unsupported message: {}", message);
                self.anomalies.record_unsupported_message();
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.anomalies.record_malformed_frame();
            }
        }
    }

    /// The inbound stream ended without `close` being called.
    async fn handle_disconnect(&self, reason: CloseReason) {
        if !matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        // Our own reader handle; dropping it detaches this task
        let (sink, _reader) = self.teardown(reason.clone());

        if self
            .transition(
                &[ConnectionState::Connecting, ConnectionState::Connected],
                ConnectionState::Closed,
            )
            .is_ok()
        {
            info!(
                "Disconnected from {}: {}",
                self.transport.endpoint(),
                reason
            );
        }

        if let Some(sink) = sink {
            let _ = sink.close().await;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn release(sink: Option<Arc<dyn FrameSink>>, reader: Option<JoinHandle<()>>) {
    if let Some(reader) = reader {
        reader.abort();
    }

    if let Some(sink) = sink {
        if let Err(e) = sink.close().await {
            debug!("Failed to close transport: {}", e);
        }
    }
}

/// Consume inbound frames until the transport reports the end of the
/// connection.
async fn read_loop(inner: Weak<Inner>, mut incoming: IncomingFrames) {
    let reason = loop {
        match incoming.next().await {
            Some(Ok(frame)) => match inner.upgrade() {
                Some(inner) => inner.dispatch(&frame),
                None => return,
            },
            Some(Err(e)) => {
                warn!("Transport error: {}", e);
                break CloseReason::TransportError(e.to_string());
            }
            None => {
                debug!("Inbound stream ended");
                break CloseReason::PeerClosed;
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.handle_disconnect(reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_jsonrpc_transport_memory::MemoryTransport;
    use tracing_test::traced_test;

    #[test]
    fn test_client_builder() {
        let client = RpcClient::builder()
            .url("ws://localhost:3000")
            .call_timeout(Duration::from_secs(1))
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        assert_eq!(client.state(), ConnectionState::Unconnected);
        assert_eq!(client.endpoint(), "ws://localhost:3000/");
        assert_eq!(client.inner.config.call_timeout, Some(Duration::from_secs(1)));
        assert_eq!(client.inner.config.connect_timeout, Duration::from_secs(2));
        assert_eq!(client.inner.config.login_method, "rpc.login");
    }

    #[test]
    fn test_builder_without_endpoint() {
        let result = RpcClient::builder().build();

        assert!(matches!(result, Err(Error::Connect { .. })));
    }

    #[test]
    fn test_builder_rejects_http_url() {
        let result = RpcClient::builder().url("http://localhost:3000").build();

        assert!(matches!(
            result,
            Err(Error::Connect {
                source: TransportError::InvalidAddress(_),
                ..
            })
        ));
    }

    #[test]
    fn test_no_call_timeout() {
        let client = RpcClient::builder()
            .url("ws://localhost:3000")
            .no_call_timeout()
            .build()
            .unwrap();

        assert_eq!(client.inner.config.call_timeout, None);
    }

    #[tokio::test]
    async fn test_call_before_connect() {
        let client = RpcClient::builder()
            .url("ws://localhost:3000")
            .build()
            .unwrap();

        let result: Result<Value> = client.call("rpc.on", ["execution"]).await;
        assert!(matches!(result, Err(Error::NotConnected)));

        let result = client.notify("execution.started", ()).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let client = RpcClient::builder()
            .url("ws://localhost:3000")
            .build()
            .unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.close_reason(), Some(CloseReason::ClientClosed));
        assert!(matches!(
            client.connect().await,
            Err(Error::InvalidState(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_anomalies_are_logged() {
        let (transport, listener) = MemoryTransport::pair();
        let client = RpcClient::builder().transport(transport).build().unwrap();

        let (connected, peer) = tokio::join!(client.connect(), listener.accept());
        connected.unwrap();
        let peer = peer.unwrap();

        peer.send(r#"{"jsonrpc":"2.0","id":99,"result":1}"#)
            .await
            .unwrap();
        peer.send("{").await.unwrap();
        peer.close();

        client.closed().await;

        assert_eq!(client.anomalies().unmatched_responses(), 1);
        assert_eq!(client.anomalies().malformed_frames(), 1);
        assert!(logs_contain("Received response for unknown call 99"));
        assert!(logs_contain("Dropping malformed frame"));
    }
}
