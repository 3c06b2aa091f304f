//! Registry actor - owns all channel state and processes commands.
//!
//! The RegistryActor is the single owner of channel membership in the system.
//! It receives commands via an mpsc channel and publishes events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use sigrelay_core::{ChannelCode, ChannelIdGenerator, ConnectionId};

use super::commands::{ChannelEvent, JoinOutcome, RegistryCommand, RegistryError, RemovalReason};
use crate::peer::ConnectionHandle;

// ============================================================================
// Resource Limits
// ============================================================================

/// Default maximum number of live channels.
pub const MAX_CHANNELS: usize = 10_000;

/// Default lifetime of a reserved channel nobody has joined.
pub const RESERVATION_TTL: Duration = Duration::from_secs(600);

/// Tunables for the registry actor.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Maximum number of live channels
    pub max_channels: usize,

    /// How long a never-joined channel survives
    pub reservation_ttl: Duration,

    /// How often the cleanup task fires
    pub cleanup_interval: Duration,

    /// Code generator
    pub generator: ChannelIdGenerator,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_channels: MAX_CHANNELS,
            reservation_ttl: RESERVATION_TTL,
            cleanup_interval: Duration::from_secs(30),
            generator: ChannelIdGenerator::default(),
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

/// One live channel and its members.
#[derive(Debug)]
struct Channel {
    members: HashMap<ConnectionId, ConnectionHandle>,
    created_at: DateTime<Utc>,
    /// Set on first join; a never-joined channel is a reservation.
    ever_joined: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            created_at: Utc::now(),
            ever_joined: false,
        }
    }

    fn is_stale_reservation(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if self.ever_joined || !self.members.is_empty() {
            return false;
        }
        (now - self.created_at)
            .to_std()
            .map(|age| age >= ttl)
            .unwrap_or(false)
    }
}

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all channel state.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially, and publishes events to subscribers.
///
/// # Ownership
///
/// The actor owns:
/// - `channels`: channel code → members
/// - `memberships`: connection → the one channel it belongs to
///
/// Both maps are updated in the same command, so a connection listed as
/// a member of C always has C recorded as its current channel and vice
/// versa.
///
/// # Thread Safety
///
/// The actor runs in a single task and processes commands sequentially.
/// Broadcast only reads a member snapshot here; the sends happen in the
/// caller's task, so a slow recipient never holds up the actor.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    channels: HashMap<ChannelCode, Channel>,

    memberships: HashMap<ConnectionId, ChannelCode>,

    settings: RegistrySettings,

    /// Event publisher for lifecycle notifications
    event_publisher: broadcast::Sender<ChannelEvent>,
}

impl RegistryActor {
    /// Creates a new registry actor.
    ///
    /// # Arguments
    ///
    /// * `receiver` - Channel for receiving commands
    /// * `event_publisher` - Broadcast channel for publishing events
    /// * `settings` - Capacity and cleanup tunables
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<ChannelEvent>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            receiver,
            channels: HashMap::new(),
            memberships: HashMap::new(),
            settings,
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    /// This is the main entry point - call this in a spawned task.
    pub async fn run(mut self) {
        info!(max_channels = self.settings.max_channels, "Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            channels = self.channels.len(),
            connections = self.memberships.len(),
            "Registry actor stopped"
        );
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::RequestChannel { respond_to } => {
                let result = self.handle_request_channel();
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::CreateChannel { code, respond_to } => {
                let result = self.handle_create_channel(code);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Join {
                code,
                connection,
                respond_to,
            } => {
                let result = self.handle_join(code, connection);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Leave {
                connection_id,
                respond_to,
            } => {
                let result = self.handle_leave(connection_id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Recipients {
                code,
                exclude,
                respond_to,
            } => {
                let result = self.handle_recipients(&code, exclude);
                let _ = respond_to.send(result);
            }
            RegistryCommand::CurrentChannel {
                connection_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.memberships.get(&connection_id).cloned());
            }
            RegistryCommand::Members { code, respond_to } => {
                let result = self.channels.get(&code).map(|channel| {
                    let mut ids: Vec<ConnectionId> = channel.members.keys().copied().collect();
                    ids.sort();
                    ids
                });
                let _ = respond_to.send(result);
            }
            RegistryCommand::ChannelCount { respond_to } => {
                let _ = respond_to.send(self.channels.len());
            }
            RegistryCommand::CleanupStale => {
                self.handle_cleanup_stale();
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Generates a code and registers it before any other command runs.
    fn handle_request_channel(&mut self) -> Result<ChannelCode, RegistryError> {
        self.ensure_capacity()?;

        let code = self
            .settings
            .generator
            .generate(|candidate| self.channels.contains_key(candidate))
            .map_err(|e| {
                warn!(
                    channels = self.channels.len(),
                    error = %e,
                    "Could not generate a free channel code"
                );
                RegistryError::from(e)
            })?;

        self.insert_channel(code.clone());
        Ok(code)
    }

    fn handle_create_channel(&mut self, code: ChannelCode) -> Result<(), RegistryError> {
        if self.channels.contains_key(&code) {
            debug!(channel = %code, "Channel already exists, rejecting creation");
            return Err(RegistryError::ChannelAlreadyExists(code));
        }
        self.ensure_capacity()?;

        self.insert_channel(code);
        Ok(())
    }

    /// Leave-then-join: a connection is in at most one channel.
    fn handle_join(
        &mut self,
        code: ChannelCode,
        connection: ConnectionHandle,
    ) -> Result<JoinOutcome, RegistryError> {
        let connection_id = connection.id();

        if self.memberships.get(&connection_id) == Some(&code) {
            debug!(connection = %connection_id, channel = %code, "Already a member");
            return Ok(JoinOutcome {
                previous: None,
                created: false,
            });
        }

        let created = !self.channels.contains_key(&code);
        if created {
            // Moving the last member out of a channel frees its slot first
            let frees_slot = self
                .memberships
                .get(&connection_id)
                .and_then(|previous| self.channels.get(previous))
                .is_some_and(|channel| channel.members.len() == 1);
            if !frees_slot {
                self.ensure_capacity()?;
            }
        }

        let previous = self.handle_leave(connection_id);

        if created {
            self.insert_channel(code.clone());
        }

        if let Some(channel) = self.channels.get_mut(&code) {
            channel.members.insert(connection_id, connection);
            channel.ever_joined = true;
            self.memberships.insert(connection_id, code.clone());

            info!(
                connection = %connection_id,
                channel = %code,
                members = channel.members.len(),
                "Connection joined channel"
            );

            let _ = self.event_publisher.send(ChannelEvent::Joined {
                code,
                connection_id,
            });
        }

        Ok(JoinOutcome { previous, created })
    }

    /// Removes a connection from its channel, dropping the channel if empty.
    fn handle_leave(&mut self, connection_id: ConnectionId) -> Option<ChannelCode> {
        let code = self.memberships.remove(&connection_id)?;

        let now_empty = match self.channels.get_mut(&code) {
            Some(channel) => {
                channel.members.remove(&connection_id);
                channel.members.is_empty()
            }
            None => false,
        };

        debug!(connection = %connection_id, channel = %code, "Connection left channel");
        let _ = self.event_publisher.send(ChannelEvent::Left {
            code: code.clone(),
            connection_id,
        });

        if now_empty {
            self.remove_channel(&code, RemovalReason::Empty);
        }

        Some(code)
    }

    fn handle_recipients(&self, code: &ChannelCode, exclude: ConnectionId) -> Vec<ConnectionHandle> {
        self.channels
            .get(code)
            .map(|channel| {
                channel
                    .members
                    .values()
                    .filter(|member| member.id() != exclude)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn handle_cleanup_stale(&mut self) {
        let now = Utc::now();
        let ttl = self.settings.reservation_ttl;

        let stale: Vec<ChannelCode> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.is_stale_reservation(now, ttl))
            .map(|(code, _)| code.clone())
            .collect();

        for code in &stale {
            self.remove_channel(code, RemovalReason::StaleReservation);
        }

        if !stale.is_empty() {
            info!(
                removed = stale.len(),
                remaining = self.channels.len(),
                "Cleaned up stale reservations"
            );
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn ensure_capacity(&self) -> Result<(), RegistryError> {
        if self.channels.len() >= self.settings.max_channels {
            warn!(
                current = self.channels.len(),
                max = self.settings.max_channels,
                "Registry is full, rejecting channel creation"
            );
            return Err(RegistryError::RegistryFull {
                max: self.settings.max_channels,
            });
        }
        Ok(())
    }

    fn insert_channel(&mut self, code: ChannelCode) {
        self.channels.insert(code.clone(), Channel::new());
        info!(channel = %code, total_channels = self.channels.len(), "Channel created");
        let _ = self.event_publisher.send(ChannelEvent::Created { code });
    }

    fn remove_channel(&mut self, code: &ChannelCode, reason: RemovalReason) {
        if let Some(channel) = self.channels.remove(code) {
            for id in channel.members.keys() {
                self.memberships.remove(id);
            }
            info!(channel = %code, reason = %reason, "Channel removed");
            let _ = self.event_publisher.send(ChannelEvent::Removed {
                code: code.clone(),
                reason,
            });
        }
    }

    /// Returns the current number of channels.
    ///
    /// This is primarily for testing - in production, use the handle.
    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
