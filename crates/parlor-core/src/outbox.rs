//! Per-connection outbound queues.
//!
//! Every connection gets an unbounded queue of shared events. Broadcasts
//! serialize nothing: the same `Arc` is pushed to every recipient and each
//! gateway task encodes it for its own socket.

use crate::session::ConnectionId;
use dashmap::DashMap;
use parlor_protocol::ServerEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Receiving half handed to the gateway task of a connection.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// Outbound queues keyed by connection.
#[derive(Debug, Default)]
pub struct Outbox {
    queues: DashMap<ConnectionId, mpsc::UnboundedSender<Arc<ServerEvent>>>,
}

impl Outbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a queue for a connection, replacing any previous one.
    pub fn attach(&self, connection_id: impl Into<ConnectionId>) -> OutboundReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.insert(connection_id.into(), tx);
        rx
    }

    /// Close the queue of a connection.
    pub fn detach(&self, connection_id: &str) -> bool {
        self.queues.remove(connection_id).is_some()
    }

    /// Push an event to one connection.
    ///
    /// Returns `false` if the connection has no open queue.
    pub fn send_to(&self, connection_id: &str, event: impl Into<Arc<ServerEvent>>) -> bool {
        let Some(tx) = self.queues.get(connection_id) else {
            trace!(connection = %connection_id, "Dropping event for detached connection");
            return false;
        };
        tx.send(event.into()).is_ok()
    }

    /// Push one event to every connection in `targets`.
    ///
    /// Returns the number of queues the event was delivered to.
    pub fn broadcast<I, S>(&self, targets: I, event: ServerEvent) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let event = Arc::new(event);
        let mut delivered = 0;
        for target in targets {
            if self.send_to(target.as_ref(), Arc::clone(&event)) {
                delivered += 1;
            }
        }
        trace!(event = event.name(), delivered, "Broadcast");
        delivered
    }

    /// Number of open queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Check if no queue is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
