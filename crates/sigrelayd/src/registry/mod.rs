//! Channel registry using Actor pattern.
//!
//! The registry is the central state manager for all live channels and
//! their members. It receives commands via a tokio mpsc channel and
//! maintains the canonical source of truth for membership.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ConnectionHandler│────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   RegistryCommand     │   ChannelEvent        │
//!         │   (mpsc channel)      │   (broadcast)         │
//!         ▼                       ▼                       ▼
//!    Create/Join/Leave      HashMap<ChannelCode,     Event logger,
//!    Recipients             Channel>                 tests
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, RegistrySettings, MAX_CHANNELS, RESERVATION_TTL};
pub use commands::{ChannelEvent, JoinOutcome, RegistryCommand, RegistryError, RemovalReason};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and event channels
/// 2. Spawns the RegistryActor on a tokio task
/// 3. Spawns a background cleanup task
/// 4. Returns a RegistryHandle for client use
///
/// # Example
///
/// ```no_run
/// use sigrelayd::registry::{spawn_registry, RegistrySettings};
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(RegistrySettings::default());
///
///     // Use handle to interact with registry
///     let code = handle.request_channel().await;
/// }
/// ```
pub fn spawn_registry(settings: RegistrySettings) -> RegistryHandle {
    // Create channels
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let cleanup_interval = settings.cleanup_interval;

    // Create and spawn actor
    let actor = RegistryActor::new(cmd_rx, event_tx.clone(), settings);
    tokio::spawn(actor.run());

    // Create handle
    let handle = RegistryHandle::new(cmd_tx, event_tx);

    // Spawn cleanup task
    spawn_cleanup_task(handle.clone(), cleanup_interval);

    handle
}

/// Spawn a background task that triggers periodic stale reservation cleanup.
fn spawn_cleanup_task(handle: RegistryHandle, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if !handle.is_connected() {
                // Actor stopped - exit cleanup task
                debug!("Cleanup task stopping: registry channel closed");
                break;
            }
            handle.cleanup_stale().await;
        }
    });
}
