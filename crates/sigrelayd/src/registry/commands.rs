//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `ChannelEvent`: Events published by the registry for subscribers
//!
//! All types are designed for async message passing and follow the panic-free policy.

use sigrelay_core::{ChannelCode, ConnectionId, DomainError};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::peer::ConnectionHandle;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
///
/// # Usage
///
/// ```ignore
/// let (tx, rx) = oneshot::channel();
/// registry_tx.send(RegistryCommand::Leave {
///     connection_id: id,
///     respond_to: tx,
/// }).await?;
/// let left = rx.await?;
/// ```
#[derive(Debug)]
pub enum RegistryCommand {
    /// Generate a fresh channel code and register it in the same turn.
    ///
    /// # Errors
    /// - `RegistryError::Domain(IdSpaceExhausted)` if no free code was drawn
    /// - `RegistryError::RegistryFull` if at maximum capacity
    RequestChannel {
        /// Channel to send the result
        respond_to: oneshot::Sender<Result<ChannelCode, RegistryError>>,
    },

    /// Register an empty channel under a caller-chosen code.
    ///
    /// # Errors
    /// - `RegistryError::ChannelAlreadyExists` if the code is live
    /// - `RegistryError::RegistryFull` if at maximum capacity
    CreateChannel {
        /// Code to register
        code: ChannelCode,
        /// Channel to send the result
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Add a connection to a channel, creating the channel if unseen.
    ///
    /// A connection already in another channel leaves it first.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if the channel would have to be
    ///   created while at maximum capacity
    Join {
        /// Channel to join
        code: ChannelCode,
        /// The joining connection
        connection: ConnectionHandle,
        /// Channel to send the result
        respond_to: oneshot::Sender<Result<JoinOutcome, RegistryError>>,
    },

    /// Remove a connection from whatever channel it is in.
    ///
    /// Responds with the channel it left, or `None` if it was not a member.
    Leave {
        /// The leaving connection
        connection_id: ConnectionId,
        /// Channel to send the result
        respond_to: oneshot::Sender<Option<ChannelCode>>,
    },

    /// Snapshot the members of a channel for broadcast.
    ///
    /// The sends themselves happen outside the actor.
    Recipients {
        /// Channel to enumerate
        code: ChannelCode,
        /// Member to leave out (the sender)
        exclude: ConnectionId,
        /// Channel to send the snapshot
        respond_to: oneshot::Sender<Vec<ConnectionHandle>>,
    },

    /// Look up the channel a connection currently belongs to.
    CurrentChannel {
        /// Connection to look up
        connection_id: ConnectionId,
        /// Channel to send the result
        respond_to: oneshot::Sender<Option<ChannelCode>>,
    },

    /// List the member ids of a channel.
    ///
    /// Returns `None` if the channel doesn't exist.
    Members {
        /// Channel to list
        code: ChannelCode,
        /// Channel to send the result
        respond_to: oneshot::Sender<Option<Vec<ConnectionId>>>,
    },

    /// Count live channels.
    ChannelCount {
        /// Channel to send the result
        respond_to: oneshot::Sender<usize>,
    },

    /// Trigger cleanup of stale reservations.
    ///
    /// This is a fire-and-forget command used by the cleanup task.
    /// Channels handed out by `RequestChannel` that nobody joined within
    /// the reservation TTL are removed.
    CleanupStale,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Channel the connection was moved out of, if any
    pub previous: Option<ChannelCode>,

    /// Whether the join created the channel
    pub created: bool,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
///
/// Uses `thiserror` for ergonomic error handling and Display implementations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum channel capacity.
    #[error("registry is full (max: {max} channels)")]
    RegistryFull {
        /// Maximum number of channels allowed
        max: usize,
    },

    /// A channel with this code already exists.
    #[error("channel already exists: {0}")]
    ChannelAlreadyExists(ChannelCode),

    /// Code generation failed.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Channel Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel was registered, explicitly or by a first join.
    Created {
        /// Code of the new channel
        code: ChannelCode,
    },

    /// A connection became a member of a channel.
    Joined {
        code: ChannelCode,
        connection_id: ConnectionId,
    },

    /// A connection stopped being a member of a channel.
    Left {
        code: ChannelCode,
        connection_id: ConnectionId,
    },

    /// A channel was removed from the registry.
    Removed {
        /// Code of the removed channel
        code: ChannelCode,
        /// Why the channel was removed
        reason: RemovalReason,
    },
}

/// Reason why a channel was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The last member left.
    Empty,

    /// Reserved by a channel id request but never joined in time.
    StaleReservation,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "last member left"),
            Self::StaleReservation => write!(f, "reservation never joined"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::RegistryFull { max: 100 };
        assert_eq!(err.to_string(), "registry is full (max: 100 channels)");

        let err = RegistryError::ChannelAlreadyExists(ChannelCode::new("WXYZ"));
        assert_eq!(err.to_string(), "channel already exists: WXYZ");

        let err = RegistryError::ChannelClosed;
        assert_eq!(err.to_string(), "response channel closed");

        let err = RegistryError::from(DomainError::IdSpaceExhausted { attempts: 20 });
        assert_eq!(err.to_string(), "channel id space exhausted after 20 attempts");
    }

    #[test]
    fn test_removal_reason_display() {
        assert_eq!(RemovalReason::Empty.to_string(), "last member left");
        assert_eq!(
            RemovalReason::StaleReservation.to_string(),
            "reservation never joined"
        );
    }
}
