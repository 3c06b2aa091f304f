//! Connection handler for individual relay clients.
//!
//! Each accepted WebSocket gets its own `ConnectionHandler` that:
//! - Decodes incoming frames into requests
//! - Routes them through the `MessageRouter`
//! - Drains the connection's outbound queue on a separate writer task
//! - Leaves its channel on every exit path
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in a close of this connection only

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError as WsProtocolError};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sigrelay_core::ConnectionId;
use sigrelay_protocol::{parse_request, parse_request_bytes, ProtocolError, ServerMessage};

use crate::peer::ConnectionHandle;
use crate::registry::RegistryHandle;

use super::router::MessageRouter;

/// Write timeout (10 seconds)
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Control frames carry at most 125 bytes, two of them the close code
const MAX_CLOSE_REASON: usize = 123;

type CloseSignal = Option<CloseFrame<'static>>;

/// Why the receive loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// Close frame or end of stream from the client
    Client,
    /// Server cancellation token fired
    Shutdown,
}

/// Drives one client connection from upgrade to cleanup.
pub struct ConnectionHandler<S> {
    /// Upgraded WebSocket stream
    stream: WebSocketStream<S>,

    /// This connection's entry in the registry
    handle: ConnectionHandle,

    /// Receiving end of the handle's outbound queue
    outbound: mpsc::Receiver<ServerMessage>,

    /// Handle to the channel registry
    registry: RegistryHandle,

    /// Server-wide shutdown token
    shutdown: CancellationToken,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - WebSocket stream after a successful handshake
    /// * `handle` - Handle registered for this connection
    /// * `outbound` - Queue receiver paired with `handle`
    /// * `registry` - Handle to the channel registry
    /// * `shutdown` - Token cancelled when the server stops
    pub fn new(
        stream: WebSocketStream<S>,
        handle: ConnectionHandle,
        outbound: mpsc::Receiver<ServerMessage>,
        registry: RegistryHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stream,
            handle,
            outbound,
            registry,
            shutdown,
        }
    }

    /// Runs the connection until the client leaves, a protocol error
    /// occurs, or the server shuts down.
    ///
    /// Cleanup (leave the channel, close the socket, join the writer)
    /// happens before this returns, whatever the outcome.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let Self {
            stream,
            handle,
            outbound,
            registry,
            shutdown,
        } = self;
        let id = handle.id();

        debug!(connection = %id, peer = %handle.peer(), "Client connected");

        let (sink, mut source) = stream.split();
        let (close_tx, close_rx) = oneshot::channel::<CloseSignal>();
        let writer_failed = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            sink,
            outbound,
            close_rx,
            writer_failed.clone(),
            id,
        ));

        let router = MessageRouter::new(registry.clone());
        let result = receive_loop(&mut source, &handle, &router, &shutdown, &writer_failed).await;

        let close = match &result {
            Ok(Disconnect::Client) => {
                info!(connection = %id, "Client disconnected");
                None
            }
            Ok(Disconnect::Shutdown) => {
                debug!(connection = %id, "Closing connection for shutdown");
                Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                })
            }
            Err(e) => {
                warn!(connection = %id, error = %e, "Connection failed");
                e.close_frame()
            }
        };

        // Cleanup runs on every path
        match registry.leave(id).await {
            Ok(Some(code)) => debug!(connection = %id, channel = %code, "Left channel"),
            Ok(None) => {}
            Err(e) => warn!(connection = %id, error = %e, "Failed to leave channel"),
        }
        drop(handle);

        // The writer may already be gone
        let _ = close_tx.send(close);
        if let Err(e) = writer.await {
            warn!(connection = %id, error = %e, "Writer task panicked");
        }

        result.map(|_| ())
    }
}

async fn receive_loop<S>(
    source: &mut SplitStream<WebSocketStream<S>>,
    handle: &ConnectionHandle,
    router: &MessageRouter,
    shutdown: &CancellationToken,
    writer_failed: &CancellationToken,
) -> Result<Disconnect, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(Disconnect::Shutdown),
            _ = writer_failed.cancelled() => return Err(ConnectionError::WriterStopped),
            frame = source.next() => frame,
        };

        let message = match frame {
            None => return Ok(Disconnect::Client),
            Some(Ok(message)) => message,
            Some(Err(e)) => return classify(e),
        };

        let request = match message {
            Message::Text(text) => parse_request(&text)?,
            Message::Binary(bytes) => parse_request_bytes(&bytes)?,
            Message::Close(frame) => {
                debug!(connection = %handle.id(), frame = ?frame, "Close frame received");
                return Ok(Disconnect::Client);
            }
            // Pings are answered by the protocol layer
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        router.route(handle, request).await?;
    }
}

/// Sorts transport errors into clean disconnects and failures.
fn classify(err: WsError) -> Result<Disconnect, ConnectionError> {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => Ok(Disconnect::Client),
        WsError::Capacity(e) => Err(ConnectionError::MessageTooLarge(e.to_string())),
        WsError::Utf8 => Err(ProtocolError::Malformed("invalid UTF-8 in text frame".to_string()).into()),
        other => Err(ConnectionError::Transport(other.to_string())),
    }
}

/// Drains the outbound queue into the socket until told to close.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut close_rx: oneshot::Receiver<CloseSignal>,
    failed: CancellationToken,
    connection: ConnectionId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            signal = &mut close_rx => {
                let frame = signal.unwrap_or(None);
                if let Ok(Err(e)) = timeout(WRITE_TIMEOUT, sink.send(Message::Close(frame))).await {
                    debug!(connection = %connection, error = %e, "Close frame not sent");
                }
                break;
            }

            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = write_message(&mut sink, &message).await {
                    debug!(connection = %connection, error = %e, "Write failed");
                    failed.cancel();
                    break;
                }
            }
        }
    }

    let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
}

async fn write_message<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    message: &ServerMessage,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let json =
        serde_json::to_string(message).map_err(|e| ConnectionError::Serialization(e.to_string()))?;

    match timeout(WRITE_TIMEOUT, sink.send(Message::Text(json))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Transport(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that end a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Writer stopped")]
    WriterStopped,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Registry unavailable")]
    RegistryUnavailable,
}

impl ConnectionError {
    /// Close frame to send to the client, if the socket is still usable.
    fn close_frame(&self) -> CloseSignal {
        let (code, reason) = match self {
            Self::Protocol(e) => (CloseCode::Protocol, e.to_string()),
            Self::MessageTooLarge(_) => (CloseCode::Size, "message too large".to_string()),
            Self::RegistryUnavailable => (CloseCode::Error, "relay unavailable".to_string()),
            Self::Transport(_) | Self::WriteTimeout | Self::WriterStopped | Self::Serialization(_) => {
                return None
            }
        };
        Some(CloseFrame {
            code,
            reason: truncate_reason(reason).into(),
        })
    }
}

/// Cuts a close reason to what fits in a control frame, on a char boundary.
fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use sigrelay_core::ChannelCode;
    use sigrelay_protocol::Request;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use crate::registry::{spawn_registry, RegistrySettings};

    struct Harness {
        client: WebSocketStream<DuplexStream>,
        registry: RegistryHandle,
        shutdown: CancellationToken,
        task: JoinHandle<Result<(), ConnectionError>>,
        id: ConnectionId,
    }

    async fn harness() -> Harness {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let registry = spawn_registry(RegistrySettings::default());
        let shutdown = CancellationToken::new();
        let id = ConnectionId::new(7);
        let (handle, outbound) =
            ConnectionHandle::with_queue(id, SocketAddr::from(([127, 0, 0, 1], 9000)), 16);

        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let handler = ConnectionHandler::new(server, handle, outbound, registry.clone(), shutdown.clone());
        let task = tokio::spawn(handler.run());

        Harness {
            client,
            registry,
            shutdown,
            task,
            id,
        }
    }

    async fn send_json(client: &mut WebSocketStream<DuplexStream>, request: &Request) {
        let json = serde_json::to_string(request).unwrap();
        client.send(Message::Text(json)).await.unwrap();
    }

    async fn next_message(client: &mut WebSocketStream<DuplexStream>) -> Message {
        timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("transport error")
    }

    #[tokio::test]
    async fn test_request_channel_round_trip() {
        let mut h = harness().await;

        send_json(&mut h.client, &Request::request_channel_id()).await;

        let text = match next_message(&mut h.client).await {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        };
        let reply: ServerMessage = serde_json::from_str(&text).unwrap();
        assert!(matches!(reply, ServerMessage::ChannelId { .. }));
    }

    #[tokio::test]
    async fn test_binary_frame_accepted() {
        let mut h = harness().await;

        let json = serde_json::to_vec(&Request::connect_channel("BINA")).unwrap();
        h.client.send(Message::Binary(json)).await.unwrap();
        // Round trip something with a reply to know the join was processed
        send_json(&mut h.client, &Request::request_channel_id()).await;
        let _ = next_message(&mut h.client).await;

        assert_eq!(
            h.registry.current_channel(h.id).await,
            Some(ChannelCode::new("BINA"))
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_with_protocol_error() {
        let mut h = harness().await;

        send_json(&mut h.client, &Request::connect_channel("WXYZ")).await;
        h.client.send(Message::Text("not json".to_string())).await.unwrap();

        match next_message(&mut h.client).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Protocol),
            other => panic!("expected close frame, got {other:?}"),
        }

        let result = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::Protocol(_))));
        // Membership released
        assert_eq!(h.registry.current_channel(h.id).await, None);
        assert_eq!(h.registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_client_close_cleans_up() {
        let mut h = harness().await;

        send_json(&mut h.client, &Request::connect_channel("WXYZ")).await;
        send_json(&mut h.client, &Request::request_channel_id()).await;
        let _ = next_message(&mut h.client).await;
        assert!(h.registry.current_channel(h.id).await.is_some());

        h.client.close(None).await.unwrap();

        let result = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(h.registry.current_channel(h.id).await, None);
    }

    #[tokio::test]
    async fn test_shutdown_sends_going_away() {
        let mut h = harness().await;

        h.shutdown.cancel();

        match next_message(&mut h.client).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {other:?}"),
        }
        let result = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_close_frame_mapping() {
        let err = ConnectionError::Protocol(ProtocolError::UnknownCommand("x".to_string()));
        assert_eq!(err.close_frame().map(|f| f.code), Some(CloseCode::Protocol));

        assert!(ConnectionError::WriteTimeout.close_frame().is_none());
        assert_eq!(
            ConnectionError::MessageTooLarge("big".to_string())
                .close_frame()
                .map(|f| f.code),
            Some(CloseCode::Size)
        );
    }

    #[test]
    fn test_long_close_reason_truncated() {
        let err = ConnectionError::Protocol(ProtocolError::UnknownCommand("x".repeat(300)));
        let frame = err.close_frame().unwrap();
        assert_eq!(frame.code, CloseCode::Protocol);
        assert!(frame.reason.len() <= MAX_CLOSE_REASON);

        // Never splits a multi-byte character
        let reason = truncate_reason("é".repeat(100));
        assert_eq!(reason.len(), 122);
        assert!(reason.chars().all(|c| c == 'é'));

        assert_eq!(truncate_reason("short".to_string()), "short");
    }

    #[tokio::test]
    async fn test_long_unknown_command_closes_cleanly() {
        let mut h = harness().await;

        let json = format!(r#"{{"cmd":"{}"}}"#, "x".repeat(300));
        h.client.send(Message::Text(json)).await.unwrap();

        match next_message(&mut h.client).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Protocol),
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
