//! Connection lifecycle and anomaly accounting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle of the client's single connection.
///
/// `Unconnected → Connecting → Connected → Closing → Closed`, with
/// `Connected → Closed` on an unexpected disconnect. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// `connect` has not been called.
    Unconnected,
    /// The transport is opening.
    Connecting,
    /// Calls and notifications can be sent.
    Connected,
    /// `close` is tearing the connection down.
    Closing,
    /// The connection is gone.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Counts of inbound frames that were dropped instead of delivered.
#[derive(Debug, Default)]
pub struct AnomalyCounters {
    unmatched_responses: AtomicU64,
    malformed_frames: AtomicU64,
    unsupported_messages: AtomicU64,
}

impl AnomalyCounters {
    /// Responses whose id matched no pending call.
    pub fn unmatched_responses(&self) -> u64 {
        self.unmatched_responses.load(Ordering::Relaxed)
    }

    /// Frames that could not be decoded.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Valid messages this client does not handle, such as server requests.
    pub fn unsupported_messages(&self) -> u64 {
        self.unsupported_messages.load(Ordering::Relaxed)
    }

    /// Sum of all anomalies.
    pub fn total(&self) -> u64 {
        self.unmatched_responses() + self.malformed_frames() + self.unsupported_messages()
    }

    pub(crate) fn record_unmatched_response(&self) {
        self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unsupported_message(&self) {
        self.unsupported_messages.fetch_add(1, Ordering::Relaxed);
    }
}
