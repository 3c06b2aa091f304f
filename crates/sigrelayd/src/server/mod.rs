//! WebSocket server for the relay daemon.
//!
//! The server:
//! - Listens on a TCP socket for client connections
//! - Upgrades each one to a WebSocket on the configured path
//! - Spawns a ConnectionHandler per client
//! - Logs registry lifecycle events
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept() + upgrade
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  MessageRouter  │────▶│  RegistryHandle │
//! │   (per client)  │     └─────────────────┘     └────────┬────────┘
//! └─────────────────┘                                      │ broadcast
//!         ▲                                                ▼
//!         │ writer task                            ┌─────────────────┐
//!         └────────────── outbound queue ◀─────────│ConnectionHandles│
//!                                                  └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;
mod router;

pub use connection::{ConnectionError, ConnectionHandler, WRITE_TIMEOUT};
pub use router::MessageRouter;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sigrelay_core::ConnectionId;

use crate::config::{ConfigError, RelayConfig};
use crate::peer::ConnectionHandle;
use crate::registry::{ChannelEvent, RegistryHandle};

/// Time allowed for the WebSocket upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for open connections to finish cleanup on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Per-connection settings derived from the config.
#[derive(Debug, Clone)]
struct ConnectionSettings {
    path: String,
    outbound_queue: usize,
    websocket: WebSocketConfig,
}

/// WebSocket relay server.
///
/// Owns the listener and spawns one task per client.
pub struct RelayServer {
    /// Bound TCP listener
    listener: TcpListener,

    /// Settings handed to each connection
    settings: ConnectionSettings,

    /// Handle to the channel registry
    registry: RegistryHandle,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for generating connection IDs
    connection_counter: AtomicU64,
}

impl RelayServer {
    /// Validates `config` and binds its listen address.
    ///
    /// # Arguments
    ///
    /// * `config` - Relay configuration
    /// * `registry` - Handle to the channel registry
    /// * `cancel_token` - Token for graceful shutdown
    pub async fn bind(
        config: &RelayConfig,
        registry: RegistryHandle,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|e| ServerError::Bind {
                addr: config.listen,
                error: e.to_string(),
            })?;

        let mut websocket = WebSocketConfig::default();
        websocket.max_message_size = Some(config.max_message_size);
        websocket.max_frame_size = Some(config.max_message_size);

        Ok(Self {
            listener,
            settings: ConnectionSettings {
                path: config.path.clone(),
                outbound_queue: config.outbound_queue,
                websocket,
            },
            registry,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        })
    }

    /// Returns the address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Listener(e.to_string()))
    }

    /// Runs the server.
    ///
    /// Accepts connections until the cancellation token is triggered,
    /// then waits briefly for open connections to clean up.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr()?,
            path = %self.settings.path,
            "Relay server listening"
        );

        self.spawn_event_logger();

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task panicked");
                    }
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let id = ConnectionId::new(
                                self.connection_counter.fetch_add(1, Ordering::Relaxed),
                            );
                            connections.spawn(serve_connection(
                                stream,
                                peer,
                                id,
                                self.settings.clone(),
                                self.registry.clone(),
                                self.cancel_token.clone(),
                            ));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                        }
                    }
                }
            }
        }

        drop(self.listener);

        let open = connections.len();
        if open > 0 {
            debug!(connections = open, "Waiting for connections to close");
            let drained = timeout(SHUTDOWN_GRACE, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Shutdown grace period elapsed, aborting remaining connections");
                connections.abort_all();
            }
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Spawns a task that logs registry lifecycle events.
    fn spawn_event_logger(&self) {
        let mut event_rx = self.registry.subscribe();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Event logger shutting down");
                        break;
                    }

                    result = event_rx.recv() => {
                        match result {
                            Ok(event) => log_event(&event),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Event logger lagged, skipped events");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Upgrades one TCP stream and runs its handler to completion.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    settings: ConnectionSettings,
    registry: RegistryHandle,
    cancel_token: CancellationToken,
) {
    let expected_path = settings.path.clone();
    let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == expected_path {
            return Ok(resp);
        }
        let mut refusal = ErrorResponse::new(Some("not found".to_string()));
        *refusal.status_mut() = StatusCode::NOT_FOUND;
        Err(refusal)
    };

    let upgrade = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        check_path,
        Some(settings.websocket),
    );

    let ws_stream = match timeout(HANDSHAKE_TIMEOUT, upgrade).await {
        Ok(Ok(ws_stream)) => ws_stream,
        Ok(Err(e)) => {
            debug!(connection = %id, peer = %peer, error = %e, "WebSocket handshake refused");
            return;
        }
        Err(_) => {
            debug!(connection = %id, peer = %peer, "WebSocket handshake timed out");
            return;
        }
    };

    let (handle, outbound) = ConnectionHandle::with_queue(id, peer, settings.outbound_queue);
    let handler = ConnectionHandler::new(ws_stream, handle, outbound, registry, cancel_token);

    // Errors are logged by the handler
    let _ = handler.run().await;
}

fn log_event(event: &ChannelEvent) {
    match event {
        ChannelEvent::Created { code } => debug!(channel = %code, "Channel created"),
        ChannelEvent::Joined {
            code,
            connection_id,
        } => debug!(channel = %code, connection = %connection_id, "Member joined"),
        ChannelEvent::Left {
            code,
            connection_id,
        } => debug!(channel = %code, connection = %connection_id, "Member left"),
        ChannelEvent::Removed { code, reason } => {
            debug!(channel = %code, reason = %reason, "Channel removed")
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
