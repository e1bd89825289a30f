//! Connection Handle
//!
//! Outbound half of a live socket. The inbound adapter owns the socket and
//! drains the channel; the application layer only ever pushes envelopes.

use crate::domain::value_objects::ConnectionId;
use crate::protocol::Envelope;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Why an envelope could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The peer is not draining its queue fast enough
    Full,
    /// The socket is gone
    Closed,
}

/// Sending side of one peer connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Envelope>,
    drops: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            id,
            tx,
            drops: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue an envelope without waiting.
    ///
    /// Returns false if the peer's queue is full or the socket is gone.
    /// Never blocks, so callers may hold routing state while sending.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.try_deliver(envelope).is_ok()
    }

    /// Like [`send`](Self::send), but tells a full queue apart from a closed one.
    pub fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(env)) => {
                let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    conn_id = %self.id,
                    event = %env.event,
                    total_drops = drops,
                    "outbound queue full, message dropped"
                );
                Err(DeliveryError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(env)) => {
                tracing::debug!(conn_id = %self.id, event = %env.event, "send on closed connection");
                Err(DeliveryError::Closed)
            }
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_delivers_envelope() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new("c1".into(), tx);

        assert!(handle.send(Envelope::new("ping", json!({}))));
        let env = rx.recv().await.unwrap();
        assert_eq!(env.event, "ping");
    }

    #[tokio::test]
    async fn test_full_queue_counts_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("c1".into(), tx);

        assert!(handle.send(Envelope::new("a", json!(null))));
        assert_eq!(
            handle.try_deliver(Envelope::new("b", json!(null))),
            Err(DeliveryError::Full)
        );
        assert_eq!(handle.drop_count(), 1);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("c1".into(), tx);
        drop(rx);

        assert!(handle.is_closed());
        assert!(!handle.send(Envelope::new("a", json!(null))));
        assert_eq!(handle.drop_count(), 0);
    }
}
