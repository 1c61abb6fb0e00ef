//! Client registry.
//!
//! Tracks every live connection, authenticated or not, keyed by
//! connection id. Routing state (who is online, where) lives in the
//! router; this registry only answers "which sockets exist" and carries
//! the per-connection outbound channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::ConnectionId;

/// Outbound channel capacity per connection. Fan-out never blocks; a
/// client that cannot drain this many frames gets isolated instead.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// A frame queued for delivery to one connection.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Serialized stanza to write as-is
    Stanza(String),
    /// Force-close the connection, optionally preceded by a stream error
    Close { stream_error: Option<String> },
}

/// Shared per-connection handle: the write channel plus the flags the
/// router needs without reaching into the session task.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Connection id, stable across the STARTTLS upgrade
    pub id: ConnectionId,
    /// Channel to the connection's write loop
    pub sender: mpsc::Sender<OutboundFrame>,
    /// Set once SASL completes
    pub authenticated: Arc<AtomicBool>,
}

impl ClientHandle {
    /// Create a handle and the receiving half of its outbound channel.
    pub fn new(id: ConnectionId) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        (
            Self {
                id,
                sender: tx,
                authenticated: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Whether this connection has completed SASL.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Mark this connection authenticated.
    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Relaxed);
    }

    /// Queue a serialized stanza without blocking.
    pub fn send_stanza(&self, xml: impl Into<String>) -> SendResult {
        match self.sender.try_send(OutboundFrame::Stanza(xml.into())) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(connection = %self.id, "Outbound queue full, dropping stanza");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendResult::ChannelClosed,
        }
    }

    /// Queue a force-close, optionally preceded by a stream error.
    pub fn send_close(&self, stream_error: Option<String>) -> SendResult {
        match self.sender.try_send(OutboundFrame::Close { stream_error }) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendResult::ChannelFull,
            Err(mpsc::error::TrySendError::Closed(_)) => SendResult::ChannelClosed,
        }
    }
}

/// Result of attempting to queue a frame for a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum SendResult {
    /// Frame was queued for delivery
    Sent,
    /// The channel to the recipient is full (backpressure)
    ChannelFull,
    /// The channel to the recipient is closed
    ChannelClosed,
}

/// Registry of all live connections.
pub struct ClientRegistry {
    connections: DashMap<ConnectionId, ClientHandle>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection at accept time.
    pub fn register(&self, handle: ClientHandle) {
        debug!(connection = %handle.id, "Registered connection");
        self.connections.insert(handle.id, handle);
    }

    /// Remove a connection. Idempotent.
    pub fn unregister(&self, id: ConnectionId) -> Option<ClientHandle> {
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            debug!(connection = %id, "Unregistered connection");
        }
        removed.map(|(_, handle)| handle)
    }

    /// Number of live connections (including unauthenticated ones).
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Queue a stanza to every authenticated connection except `exclude`.
    pub fn broadcast_authenticated(&self, xml: &str, exclude: ConnectionId) {
        for entry in self.connections.iter() {
            let handle = entry.value();
            if handle.id != exclude && handle.is_authenticated() {
                handle.send_stanza(xml);
            }
        }
    }

    /// Run a closure over every live connection handle.
    pub fn for_each(&self, mut f: impl FnMut(&ClientHandle)) {
        for entry in self.connections.iter() {
            f(entry.value());
        }
    }

    /// Drop every registration at once (shutdown).
    pub fn clear(&self) {
        self.connections.clear();
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = ClientRegistry::new();
        let id = ConnectionId::new();
        let (handle, _rx) = ClientHandle::new(id);

        registry.register(handle);
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_send_stanza_queues_frame() {
        let (handle, mut rx) = ClientHandle::new(ConnectionId::new());

        assert_eq!(handle.send_stanza("<presence/>"), SendResult::Sent);
        match rx.recv().await {
            Some(OutboundFrame::Stanza(xml)) => assert_eq!(xml, "<presence/>"),
            other => panic!("Expected stanza frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_to_closed_channel() {
        let (handle, rx) = ClientHandle::new(ConnectionId::new());
        drop(rx);

        assert_eq!(handle.send_stanza("<presence/>"), SendResult::ChannelClosed);
    }

    #[tokio::test]
    async fn test_full_channel_isolates_recipient() {
        let (handle, _rx) = ClientHandle::new(ConnectionId::new());

        for _ in 0..OUTBOUND_QUEUE_SIZE {
            assert_eq!(handle.send_stanza("<presence/>"), SendResult::Sent);
        }
        assert_eq!(handle.send_stanza("<presence/>"), SendResult::ChannelFull);
    }

    #[tokio::test]
    async fn test_broadcast_skips_unauthenticated_and_excluded() {
        let registry = ClientRegistry::new();

        let (auth_handle, mut auth_rx) = ClientHandle::new(ConnectionId::new());
        auth_handle.set_authenticated();
        let (plain_handle, mut plain_rx) = ClientHandle::new(ConnectionId::new());
        let (sender_handle, mut sender_rx) = ClientHandle::new(ConnectionId::new());
        sender_handle.set_authenticated();

        let sender_id = sender_handle.id;
        registry.register(auth_handle);
        registry.register(plain_handle);
        registry.register(sender_handle);

        registry.broadcast_authenticated("<presence type='unavailable'/>", sender_id);

        assert!(matches!(
            auth_rx.try_recv(),
            Ok(OutboundFrame::Stanza(_))
        ));
        assert!(plain_rx.try_recv().is_err());
        assert!(sender_rx.try_recv().is_err());
    }
}
