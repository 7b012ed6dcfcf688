//! In-memory transport implementation for testing
//!
//! This transport connects a client to a peer within the same process. The
//! peer side plays the remote endpoint: it reads the client's frames, writes
//! replies and notifications, and simulates a disconnect by closing or
//! failing.

use async_trait::async_trait;
use futures::StreamExt;
use proven_jsonrpc_transport::{Connection, FrameSink, Transport, TransportError};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Memory transport implementation
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    /// Hands the peer side of each new connection to the listener; `None`
    /// means nothing is listening.
    peers_tx: Option<flume::Sender<MemoryPeer>>,
}

impl MemoryTransport {
    /// Create a transport together with the listener that accepts its
    /// connections.
    #[must_use]
    pub fn pair() -> (Self, MemoryListener) {
        let (peers_tx, peers_rx) = flume::unbounded();

        (
            Self {
                peers_tx: Some(peers_tx),
            },
            MemoryListener { peers_rx },
        )
    }

    /// Create a transport whose `open` always fails.
    #[must_use]
    pub const fn unreachable() -> Self {
        Self { peers_tx: None }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<Connection, TransportError> {
        let peers_tx = self.peers_tx.as_ref().ok_or_else(|| {
            TransportError::ConnectionFailed("No listener for memory endpoint".to_string())
        })?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        // Create a bidirectional connection pair
        let (client_to_peer_tx, client_to_peer_rx) = flume::unbounded();
        let (peer_to_client_tx, peer_to_client_rx) = flume::unbounded();

        let peer = MemoryPeer {
            id,
            sender: peer_to_client_tx,
            receiver: client_to_peer_rx,
        };

        peers_tx
            .send_async(peer)
            .await
            .map_err(|_| TransportError::ConnectionFailed("Listener closed".to_string()))?;

        info!("Memory connection {} established", id);

        Ok(Connection {
            endpoint: self.endpoint(),
            sink: Box::new(MemorySink {
                id,
                sender: Mutex::new(Some(client_to_peer_tx)),
                closed: AtomicBool::new(false),
            }),
            incoming: peer_to_client_rx.into_stream().boxed(),
        })
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

/// Accepts the peer side of connections opened through a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryListener {
    peers_rx: flume::Receiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once every transport
    /// handle has been dropped.
    pub async fn accept(&self) -> Result<MemoryPeer, TransportError> {
        self.peers_rx
            .recv_async()
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Remote side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    id: u64,
    sender: flume::Sender<Result<String, TransportError>>,
    receiver: flume::Receiver<String>,
}

impl MemoryPeer {
    /// Connection id, shared with the client side.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Send a frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client side is gone.
    pub async fn send(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.sender
            .send_async(Ok(frame.into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame written by the client.
    ///
    /// Returns `None` once the client has closed its side.
    pub async fn recv(&self) -> Option<String> {
        self.receiver.recv_async().await.ok()
    }

    /// Close the connection from the remote side; the client's inbound
    /// stream ends.
    pub fn close(self) {
        debug!("Memory peer {} closing", self.id);
    }

    /// Fail the connection from the remote side; the client's inbound stream
    /// yields `error` and then ends.
    pub fn fail(self, error: TransportError) {
        debug!("Memory peer {} failing: {}", self.id, error);
        let _ = self.sender.send(Err(error));
    }
}

/// Client side write half.
struct MemorySink {
    id: u64,
    sender: Mutex<Option<flume::Sender<String>>>,
    closed: AtomicBool,
}

impl Debug for MemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySink")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let sender = self.sender.lock().await;
        let sender = sender.as_ref().ok_or(TransportError::ConnectionClosed)?;

        debug!("Memory connection {} sending {} bytes", self.id, frame.len());

        sender
            .send_async(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);

        if self.sender.lock().await.take().is_some() {
            debug!("Closing memory connection {}", self.id);
        }

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
