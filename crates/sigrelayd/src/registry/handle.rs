//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to channel events.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use sigrelay_core::{ChannelCode, ConnectionId};
use sigrelay_protocol::ServerMessage;

use super::commands::{ChannelEvent, JoinOutcome, RegistryCommand, RegistryError};
use crate::peer::ConnectionHandle;

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
/// All methods are async and communicate with the actor via channels.
///
/// # Usage
///
/// ```ignore
/// // Clone the handle to share across tasks
/// let handle = registry_handle.clone();
///
/// // Join a channel
/// handle.join(code.clone(), connection).await?;
///
/// // Relay to everyone else in it
/// let attempted = handle.broadcast(&code, message, connection_id).await?;
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<ChannelEvent>,
}

impl RegistryHandle {
    /// Create a new registry handle.
    ///
    /// # Arguments
    ///
    /// * `sender` - The command channel sender for communicating with the actor
    /// * `event_sender` - The broadcast sender for subscribing to events
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Generate and register a fresh channel code.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Domain` if the code space is exhausted
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn request_channel(&self) -> Result<ChannelCode, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::RequestChannel { respond_to: tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Register an empty channel under `code`.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelAlreadyExists` if the code is live
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn create_channel(&self, code: ChannelCode) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::CreateChannel {
                code,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Make `connection` a member of `code`, leaving any previous channel.
    ///
    /// # Errors
    ///
    /// - `RegistryError::RegistryFull` if `code` is unseen and the registry
    ///   is at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn join(
        &self,
        code: ChannelCode,
        connection: ConnectionHandle,
    ) -> Result<JoinOutcome, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Join {
                code,
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Remove a connection from its channel.
    ///
    /// Returns the channel it left, or `None` if it was not a member.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn leave(&self, connection_id: ConnectionId) -> Result<Option<ChannelCode>, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Leave {
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Send `message` to every member of `code` except `exclude`.
    ///
    /// The member list is snapshotted by the actor; the sends happen here,
    /// after the actor has moved on. A failed send to one recipient is
    /// logged and skipped. Returns the number of deliveries attempted.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn broadcast(
        &self,
        code: &ChannelCode,
        message: ServerMessage,
        exclude: ConnectionId,
    ) -> Result<usize, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Recipients {
                code: code.clone(),
                exclude,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        let recipients = rx.await.map_err(|_| RegistryError::ChannelClosed)?;

        for recipient in &recipients {
            if let Err(e) = recipient.send(message.clone()) {
                debug!(
                    channel = %code,
                    recipient = %recipient.id(),
                    error = %e,
                    "Skipping recipient"
                );
            }
        }

        Ok(recipients.len())
    }

    /// Get the channel a connection currently belongs to.
    ///
    /// Returns `None` if it is in no channel or if communication
    /// with the actor fails.
    pub async fn current_channel(&self, connection_id: ConnectionId) -> Option<ChannelCode> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::CurrentChannel {
                connection_id,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Get the member ids of a channel, sorted.
    ///
    /// Returns `None` if the channel doesn't exist or if communication
    /// with the actor fails.
    pub async fn members(&self, code: ChannelCode) -> Option<Vec<ConnectionId>> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Members {
                code,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Count live channels.
    ///
    /// Returns 0 if communication with the actor fails.
    pub async fn channel_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::ChannelCount { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }

        rx.await.unwrap_or_default()
    }

    /// Trigger cleanup of stale reservations.
    ///
    /// This is a fire-and-forget operation - it does not wait for
    /// the cleanup to complete or return any result.
    pub async fn cleanup_stale(&self) {
        // Fire-and-forget: ignore send errors (actor may be shutting down)
        let _ = self.sender.send(RegistryCommand::CleanupStale).await;
    }

    /// Subscribe to channel events.
    ///
    /// Returns a broadcast receiver that will receive all channel events
    /// (creations, joins, leaves, removals) published by the registry actor.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.event_sender.subscribe()
    }

    /// Check if the actor is still running.
    ///
    /// Returns `true` if the command channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
