//! WebSocket transport for JSON-RPC clients
//!
//! Opens a standard WebSocket client connection with `tokio-tungstenite` and
//! splits it so that writers and the inbound-frame consumer never contend on
//! the same lock:
//! - the write half sits behind a mutex shared by every caller
//! - the read half is turned into an [`IncomingFrames`] stream

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use proven_jsonrpc_transport::{Connection, FrameSink, IncomingFrames, Transport, TransportError};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport bound to a single `ws://` or `wss://` endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    /// Create a transport for the given endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if the URL does not parse or
    /// its scheme is not `ws`/`wss`.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::InvalidAddress(format!("Invalid URL: {e}")))?;

        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            scheme => Err(TransportError::InvalidAddress(format!(
                "Unsupported scheme {scheme:?}, expected ws or wss"
            ))),
        }
    }

    /// The endpoint URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<Connection, TransportError> {
        debug!("Connecting to WebSocket at {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("WebSocket connect failed: {e}"))
        })?;

        info!("WebSocket connected to {}", self.url);

        let closed = Arc::new(AtomicBool::new(false));
        let (sink, stream) = ws_stream.split();

        Ok(Connection {
            endpoint: self.url.to_string(),
            sink: Box::new(WebSocketSink {
                sink: Mutex::new(sink),
                closed: Arc::clone(&closed),
            }),
            incoming: incoming_frames(stream, closed),
        })
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

/// Write half of a client WebSocket connection.
struct WebSocketSink {
    sink: Mutex<SplitSink<WsStream, Message>>,
    closed: Arc<AtomicBool>,
}

impl Debug for WebSocketSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSink")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(Message::text(frame))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;

        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut sink = self.sink.lock().await;
        // The peer may already be gone.
        let _ = sink.close().await;

        debug!("WebSocket sink closed");

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Turn the read half into a stream of text frames.
///
/// Control frames are skipped, binary frames are accepted when they hold
/// UTF-8 text. A Close frame or the end of the socket ends the stream; a read
/// error is yielded once before the end.
fn incoming_frames(stream: SplitStream<WsStream>, closed: Arc<AtomicBool>) -> IncomingFrames {
    Box::pin(futures::stream::unfold(Some(stream), move |state| {
        let closed = Arc::clone(&closed);

        async move {
            let mut stream = state?;

            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some((Ok(text.as_str().to_owned()), Some(stream)));
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => return Some((Ok(text), Some(stream))),
                        Err(_) => {
                            warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len());
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!("WebSocket closed by peer: {:?}", frame);
                        closed.store(true, Ordering::Release);
                        return None;
                    }
                    Some(Ok(_)) => {
                        // Ping, Pong and raw frames carry no payload for us
                    }
                    Some(Err(e)) => {
                        closed.store(true, Ordering::Release);
                        return Some((Err(TransportError::Io(std::io::Error::other(e))), None));
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        closed.store(true, Ordering::Release);
                        return None;
                    }
                }
            }
        }
    }))
}
