//! Pending-call registry.
//!
//! Maps the id of every outstanding call to the oneshot channel its caller
//! is waiting on. All mutations go through one lock, so a response racing a
//! drain is either delivered before the drain or discarded after it, never
//! both.

use crate::error::{CloseReason, Error, RemoteError, Result};
use crate::protocol::Id;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome delivered to a waiting caller.
pub type CallOutcome = Result<Value>;

/// Receiving end of a pending call.
pub type Completion = oneshot::Receiver<CallOutcome>;

#[derive(Debug, Default)]
struct State {
    calls: HashMap<Id, oneshot::Sender<CallOutcome>>,
    /// Set by the first drain; no registration succeeds afterwards.
    closed: Option<CloseReason>,
}

/// Tracks calls waiting for a response.
#[derive(Debug, Default)]
pub struct PendingCalls {
    state: Mutex<State>,
}

impl PendingCalls {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateId`] if `id` is already pending and
    /// [`Error::ConnectionClosed`] once the registry has been drained.
    pub fn register(&self, id: Id) -> Result<Completion> {
        let mut state = self.state.lock();

        if let Some(reason) = &state.closed {
            return Err(Error::ConnectionClosed(reason.clone()));
        }

        match state.calls.entry(id) {
            Entry::Occupied(entry) => Err(Error::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Deliver a result to the call registered under `id`.
    ///
    /// Returns `false`, and logs the anomaly, if no such call is pending.
    pub fn resolve(&self, id: &Id, result: Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Deliver a remote error to the call registered under `id`.
    ///
    /// Returns `false`, and logs the anomaly, if no such call is pending.
    pub fn resolve_error(&self, id: &Id, error: RemoteError) -> bool {
        self.complete(id, Err(Error::Remote(error)))
    }

    fn complete(&self, id: &Id, outcome: CallOutcome) -> bool {
        let Some(tx) = self.state.lock().calls.remove(id) else {
            warn!("Received response for unknown call {}", id);
            return false;
        };

        if tx.send(outcome).is_err() {
            debug!("Caller of call {} went away before its response", id);
        }

        true
    }

    /// Remove a pending call without completing it.
    ///
    /// Used when the caller times out or is cancelled.
    pub fn remove(&self, id: &Id) -> bool {
        self.state.lock().calls.remove(id).is_some()
    }

    /// Fail every pending call with [`Error::ConnectionClosed`] and refuse
    /// further registrations.
    ///
    /// Only the first drain's reason is kept. Returns the number of calls
    /// failed by this drain.
    pub fn drain_all(&self, reason: CloseReason) -> usize {
        let (reason, drained) = {
            let mut state = self.state.lock();
            let reason = state.closed.get_or_insert(reason).clone();
            let drained: Vec<_> = state.calls.drain().collect();
            (reason, drained)
        };

        let count = drained.len();
        if count > 0 {
            debug!("Draining {} pending calls: {}", count, reason);
        }

        for (_, tx) in drained {
            let _ = tx.send(Err(Error::ConnectionClosed(reason.clone())));
        }

        count
    }

    /// Reason recorded by the first drain, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().closed.clone()
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Whether no call is pending.
    pub fn is_empty(&self) -> bool {
        self.state.lock().calls.is_empty()
    }
}

/// Removes a call from the registry when the caller stops waiting for it.
///
/// Dropping the guard after a normal completion is a no-op.
pub(crate) struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    id: Id,
}

impl<'a> PendingGuard<'a> {
    pub(crate) const fn new(calls: &'a PendingCalls, id: Id) -> Self {
        Self { calls, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.calls.remove(&self.id) {
            debug!("Removed abandoned call {}", self.id);
        }
    }
}
