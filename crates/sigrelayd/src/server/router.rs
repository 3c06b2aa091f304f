//! Per-message dispatch.
//!
//! | `cmd`              | effect                                   | reply             |
//! |--------------------|------------------------------------------|-------------------|
//! | `""`               | none                                     | none              |
//! | `requestChannelId` | generate and register a channel          | `{"cid": ...}`    |
//! | `connectChannel`   | join `channel`, leaving any previous one | none              |
//! | `send`             | broadcast to the other members           | none to sender    |

use tracing::{debug, info, warn};

use sigrelay_protocol::{error_code, Command, ProtocolError, Request, ServerMessage};

use crate::peer::ConnectionHandle;
use crate::registry::{RegistryError, RegistryHandle};

use super::ConnectionError;

/// Stateless router from decoded requests to registry operations.
#[derive(Clone)]
pub struct MessageRouter {
    registry: RegistryHandle,
}

impl MessageRouter {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    /// Handles one request from `conn`.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::Protocol` for unknown commands or a missing channel
    /// - `ConnectionError::RegistryUnavailable` if the registry has shut down
    pub async fn route(&self, conn: &ConnectionHandle, request: Request) -> Result<(), ConnectionError> {
        match request.command() {
            Command::Empty => {
                debug!(connection = %conn.id(), "Ignoring request with empty command");
                Ok(())
            }
            Command::RequestChannelId => self.handle_request_channel(conn).await,
            Command::ConnectChannel => self.handle_connect(conn, request).await,
            Command::Send => self.handle_send(conn, request).await,
            Command::Unknown(cmd) => Err(ProtocolError::UnknownCommand(cmd).into()),
        }
    }

    async fn handle_request_channel(&self, conn: &ConnectionHandle) -> Result<(), ConnectionError> {
        let reply = match self.registry.request_channel().await {
            Ok(code) => {
                info!(connection = %conn.id(), channel = %code, "Channel reserved");
                ServerMessage::channel_id(code)
            }
            Err(RegistryError::ChannelClosed) => return Err(ConnectionError::RegistryUnavailable),
            Err(e) => {
                warn!(connection = %conn.id(), error = %e, "Channel request refused");
                refusal(&e)
            }
        };

        reply_to(conn, reply);
        Ok(())
    }

    async fn handle_connect(&self, conn: &ConnectionHandle, request: Request) -> Result<(), ConnectionError> {
        let code = require_channel(&request)?;

        match self.registry.join(code.clone(), conn.clone()).await {
            Ok(outcome) => {
                debug!(
                    connection = %conn.id(),
                    channel = %code,
                    previous = ?outcome.previous,
                    created = outcome.created,
                    "Connection joined channel"
                );
                Ok(())
            }
            Err(RegistryError::ChannelClosed) => Err(ConnectionError::RegistryUnavailable),
            Err(e) => {
                warn!(connection = %conn.id(), channel = %code, error = %e, "Join refused");
                reply_to(conn, refusal(&e));
                Ok(())
            }
        }
    }

    async fn handle_send(&self, conn: &ConnectionHandle, request: Request) -> Result<(), ConnectionError> {
        let code = require_channel(&request)?.clone();

        let attempted = self
            .registry
            .broadcast(&code, ServerMessage::relay(request), conn.id())
            .await
            .map_err(|_| ConnectionError::RegistryUnavailable)?;

        debug!(connection = %conn.id(), channel = %code, recipients = attempted, "Relayed message");
        Ok(())
    }
}

fn require_channel(request: &Request) -> Result<&sigrelay_core::ChannelCode, ProtocolError> {
    if request.channel.is_empty() {
        return Err(ProtocolError::MissingChannel(request.cmd.clone()));
    }
    Ok(&request.channel)
}

/// Maps a registry refusal to the error reply sent to the client.
fn refusal(err: &RegistryError) -> ServerMessage {
    let code = match err {
        RegistryError::Domain(_) => error_code::ID_SPACE_EXHAUSTED,
        RegistryError::RegistryFull { .. } => error_code::REGISTRY_FULL,
        _ => error_code::UNAVAILABLE,
    };
    ServerMessage::error_with_code(&err.to_string(), code)
}

fn reply_to(conn: &ConnectionHandle, message: ServerMessage) {
    if let Err(e) = conn.send(message) {
        debug!(connection = %conn.id(), error = %e, "Reply dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use sigrelay_core::{ChannelCode, ChannelIdGenerator, ConnectionId};
    use tokio::sync::mpsc;

    use crate::registry::{spawn_registry, RegistrySettings};

    fn connection(n: u64) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
        ConnectionHandle::with_queue(
            ConnectionId::new(n),
            SocketAddr::from(([127, 0, 0, 1], 5000 + n as u16)),
            8,
        )
    }

    fn router_with(settings: RegistrySettings) -> (MessageRouter, RegistryHandle) {
        let registry = spawn_registry(settings);
        (MessageRouter::new(registry.clone()), registry)
    }

    fn router() -> (MessageRouter, RegistryHandle) {
        router_with(RegistrySettings::default())
    }

    #[tokio::test]
    async fn test_empty_command_is_noop() {
        let (router, registry) = router();
        let (conn, mut rx) = connection(1);

        router.route(&conn, Request::default()).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_channel_replies_with_code() {
        let (router, registry) = router();
        let (conn, mut rx) = connection(1);

        router.route(&conn, Request::request_channel_id()).await.unwrap();

        let cid = match rx.recv().await {
            Some(ServerMessage::ChannelId { cid }) => cid,
            other => panic!("expected channel id, got {other:?}"),
        };
        assert_eq!(cid.as_str().len(), 4);
        assert!(registry.members(cid).await.is_some());
        // The requester is not joined
        assert_eq!(registry.current_channel(conn.id()).await, None);
    }

    #[tokio::test]
    async fn test_request_channel_exhausted_replies_error() {
        let generator = ChannelIdGenerator::new("A", 1, 3).unwrap();
        let (router, _registry) = router_with(RegistrySettings {
            generator,
            ..RegistrySettings::default()
        });
        let (conn, mut rx) = connection(1);

        router.route(&conn, Request::request_channel_id()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::ChannelId { .. })));

        router.route(&conn, Request::request_channel_id()).await.unwrap();
        match rx.recv().await {
            Some(ServerMessage::Error { code, .. }) => {
                assert_eq!(code.as_deref(), Some(error_code::ID_SPACE_EXHAUSTED));
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_when_full_replies_error() {
        let (router, registry) = router_with(RegistrySettings {
            max_channels: 1,
            ..RegistrySettings::default()
        });
        let (a, _rx_a) = connection(1);
        let (b, mut rx_b) = connection(2);

        router.route(&a, Request::connect_channel("AAAA")).await.unwrap();
        router.route(&b, Request::connect_channel("BBBB")).await.unwrap();

        match rx_b.recv().await {
            Some(ServerMessage::Error { code, .. }) => {
                assert_eq!(code.as_deref(), Some(error_code::REGISTRY_FULL));
            }
            other => panic!("expected error reply, got {other:?}"),
        }
        assert_eq!(registry.current_channel(b.id()).await, None);

        // Joining the existing channel is still allowed
        router.route(&b, Request::connect_channel("AAAA")).await.unwrap();
        assert_eq!(
            registry.current_channel(b.id()).await,
            Some(ChannelCode::new("AAAA"))
        );
    }

    #[tokio::test]
    async fn test_connect_sends_no_reply() {
        let (router, registry) = router();
        let (conn, mut rx) = connection(1);

        router.route(&conn, Request::connect_channel("WXYZ")).await.unwrap();

        assert_eq!(
            registry.current_channel(conn.id()).await,
            Some(ChannelCode::new("WXYZ"))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_relays_to_others_only() {
        let (router, _registry) = router();
        let (a, mut rx_a) = connection(1);
        let (b, mut rx_b) = connection(2);
        let (c, mut rx_c) = connection(3);

        for conn in [&a, &b, &c] {
            router.route(conn, Request::connect_channel("WXYZ")).await.unwrap();
        }

        let request = Request::send("WXYZ", "hello");
        router.route(&a, request.clone()).await.unwrap();

        assert_eq!(rx_b.recv().await, Some(ServerMessage::relay(request.clone())));
        assert_eq!(rx_c.recv().await, Some(ServerMessage::relay(request)));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_channel_is_dropped() {
        let (router, registry) = router();
        let (conn, mut rx) = connection(1);

        router.route(&conn, Request::send("NONE", "hello")).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_command_is_protocol_error() {
        let (router, _registry) = router();
        let (conn, _rx) = connection(1);

        let request = Request {
            cmd: "bogus".to_string(),
            ..Request::default()
        };
        let err = router.route(&conn, request).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_channel_is_protocol_error() {
        let (router, _registry) = router();
        let (conn, _rx) = connection(1);

        let err = router
            .route(&conn, Request::connect_channel(""))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::MissingChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_shutdown_is_connection_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (events, _) = tokio::sync::broadcast::channel(1);
        let router = MessageRouter::new(RegistryHandle::new(tx, events));
        let (conn, _rx) = connection(1);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            router.route(&conn, Request::connect_channel("WXYZ")),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ConnectionError::RegistryUnavailable)));
    }
}
