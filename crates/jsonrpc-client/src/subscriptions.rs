//! Local notification queues.

use crate::protocol::Notification;
use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Stream of notifications for one event name, in arrival order.
///
/// Ends when the event is unsubscribed or the connection closes.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    receiver: UnboundedReceiverStream<Notification>,
}

impl Subscription {
    /// Event name this subscription receives.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next notification.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.next().await
    }
}

impl Stream for Subscription {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

/// Notification queues keyed by event name.
///
/// Queues are unbounded so dispatch never waits on a slow consumer. Once
/// cleared the table stays closed: later subscriptions end immediately.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    queues: DashMap<String, Vec<mpsc::UnboundedSender<Notification>>>,
    closed: AtomicBool,
}

impl Subscriptions {
    pub(crate) fn add(&self, name: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        if self.closed.load(Ordering::Acquire) {
            debug!("Subscription to {:?} after close", name);
        } else {
            self.queues.entry(name.to_string()).or_default().push(tx);

            // Lost a race with `clear`
            if self.closed.load(Ordering::Acquire) {
                self.queues.remove(name);
            }
        }

        Subscription {
            name: name.to_string(),
            receiver: UnboundedReceiverStream::new(rx),
        }
    }

    /// Drop every queue for `name`, ending their streams.
    pub(crate) fn remove(&self, name: &str) -> usize {
        self.queues
            .remove(name)
            .map_or(0, |(_, queues)| queues.len())
    }

    /// Deliver a notification to every live queue for its event name.
    pub(crate) fn dispatch(&self, notification: &Notification) -> usize {
        let name = notification.method.as_str();

        let (delivered, empty) = match self.queues.get_mut(name) {
            Some(mut queues) => {
                queues.retain(|queue| !queue.is_closed());
                let delivered = queues
                    .iter()
                    .filter(|queue| queue.send(notification.clone()).is_ok())
                    .count();
                (delivered, queues.is_empty())
            }
            None => (0, false),
        };

        if empty {
            self.queues.remove_if(name, |_, queues| queues.is_empty());
        }

        if delivered == 0 {
            debug!("No subscriber for notification {:?}", name);
        }

        delivered
    }

    /// Drop every queue and refuse new ones.
    pub(crate) fn clear(&self) {
        self.closed.store(true, Ordering::Release);
        self.queues.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |queues| queues.len())
    }
}
