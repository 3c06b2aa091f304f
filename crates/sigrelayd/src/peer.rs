//! Handle on one connected client.
//!
//! A `ConnectionHandle` is what the registry stores as a channel member.
//! It owns nothing but a sender into the connection's outbound queue;
//! the transport itself belongs to the `ConnectionHandler` driving it.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use sigrelay_core::ConnectionId;
use sigrelay_protocol::ServerMessage;

/// Cheap-to-clone reference to a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer: SocketAddr, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self { id, peer, outbound }
    }

    /// Creates a handle together with the receiving end of its queue.
    pub fn with_queue(
        id: ConnectionId,
        peer: SocketAddr,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, peer, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues a message without waiting.
    ///
    /// # Errors
    ///
    /// - `SendError::QueueFull` if the client is not draining its queue
    /// - `SendError::Closed` if the connection's writer has gone away
    pub fn send(&self, message: ServerMessage) -> Result<(), SendError> {
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(connection = %self.id, peer = %self.peer, "Outbound queue full, message dropped");
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }
}

/// Failure to hand a message to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue full")]
    QueueFull,

    #[error("connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigrelay_core::ChannelCode;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    #[tokio::test]
    async fn test_send_delivers_to_queue() {
        let (handle, mut rx) = ConnectionHandle::with_queue(ConnectionId::new(1), addr(), 4);

        handle
            .send(ServerMessage::channel_id(ChannelCode::new("ABCD")))
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, ServerMessage::channel_id(ChannelCode::new("ABCD")));
    }

    #[tokio::test]
    async fn test_send_full_queue() {
        let (handle, _rx) = ConnectionHandle::with_queue(ConnectionId::new(1), addr(), 1);

        handle.send(ServerMessage::error("one")).unwrap();
        let result = handle.send(ServerMessage::error("two"));
        assert_eq!(result, Err(SendError::QueueFull));
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (handle, rx) = ConnectionHandle::with_queue(ConnectionId::new(2), addr(), 4);
        drop(rx);

        assert_eq!(handle.send(ServerMessage::error("x")), Err(SendError::Closed));
    }

    #[test]
    fn test_handle_accessors() {
        let (handle, _rx) = ConnectionHandle::with_queue(ConnectionId::new(9), addr(), 4);
        assert_eq!(handle.id(), ConnectionId::new(9));
        assert_eq!(handle.peer(), addr());
    }
}
